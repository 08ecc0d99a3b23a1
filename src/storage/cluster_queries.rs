//! SQLite queries for details clusters and their details
//!
//! A cluster owns its details; memories only point at a cluster through the
//! nullable `memories.clusterId` column.

use rusqlite::{params, params_from_iter, Connection, Row, ToSql};

use super::queries::{escape_like, tag_conditions};
use super::records::{format_ts, parse_ts};
use crate::error::{Result, VaultError};
use crate::types::{ClusterDeletion, ClusterDetail, ClusterQuery, DetailsCluster, Importance};

fn cluster_from_row(row: &Row) -> rusqlite::Result<DetailsCluster> {
    let tags: String = row.get("tags")?;
    let metadata: String = row.get("metadata")?;
    let created_at: String = row.get("createdAt")?;
    let updated_at: String = row.get("updatedAt")?;
    Ok(DetailsCluster {
        id: row.get("id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        details: vec![], // Loaded separately
    })
}

fn detail_from_row(row: &Row) -> rusqlite::Result<ClusterDetail> {
    let detail_type: String = row.get("type")?;
    let importance: i64 = row.get("importance")?;
    let created_at: String = row.get("createdAt")?;
    let updated_at: String = row.get("updatedAt")?;
    Ok(ClusterDetail {
        id: row.get("id")?,
        cluster_id: row.get("clusterId")?,
        key: row.get("key")?,
        value: row.get("value")?,
        detail_type: detail_type.parse().unwrap_or_default(),
        importance: Importance::new(importance).unwrap_or_default(),
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

pub fn cluster_exists(conn: &Connection, id: &str) -> Result<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM details_clusters WHERE id = ?",
        [id],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}

/// Insert a cluster together with its initial details
pub fn insert_cluster(conn: &mut Connection, cluster: &DetailsCluster) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO details_clusters (id, name, description, tags, createdAt, updatedAt, metadata)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
            cluster.id,
            cluster.name,
            cluster.description,
            serde_json::to_string(&cluster.tags)?,
            format_ts(&cluster.created_at),
            format_ts(&cluster.updated_at),
            serde_json::to_string(&cluster.metadata)?,
        ],
    )?;
    for detail in &cluster.details {
        insert_detail(&tx, detail)?;
    }
    tx.commit()?;
    Ok(())
}

pub fn load_details(conn: &Connection, cluster_id: &str) -> Result<Vec<ClusterDetail>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, clusterId, key, value, type, importance, createdAt, updatedAt
         FROM cluster_details WHERE clusterId = ?
         ORDER BY createdAt ASC, rowid ASC",
    )?;
    let rows = stmt.query_map([cluster_id], detail_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn get_cluster(conn: &Connection, id: &str) -> Result<Option<DetailsCluster>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, name, description, tags, createdAt, updatedAt, metadata
         FROM details_clusters WHERE id = ?",
    )?;
    let cluster = stmt.query_map([id], cluster_from_row)?.next().transpose()?;
    match cluster {
        Some(mut cluster) => {
            cluster.details = load_details(conn, &cluster.id)?;
            Ok(Some(cluster))
        }
        None => Ok(None),
    }
}

/// Most recently updated first
pub fn list_clusters(conn: &Connection, query: &ClusterQuery) -> Result<Vec<DetailsCluster>> {
    let mut conditions: Vec<String> = Vec::new();
    let mut params: Vec<Box<dyn ToSql>> = Vec::new();

    if let Some(q) = &query.query {
        let pattern = format!("%{}%", escape_like(q));
        conditions.push("(name LIKE ? ESCAPE '\\' OR description LIKE ? ESCAPE '\\')".to_string());
        params.push(Box::new(pattern.clone()));
        params.push(Box::new(pattern));
    }
    tag_conditions(&query.tags, &mut conditions, &mut params);

    let mut sql = String::from(
        "SELECT id, name, description, tags, createdAt, updatedAt, metadata FROM details_clusters",
    );
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    sql.push_str(" ORDER BY updatedAt DESC, rowid DESC");
    if let Some(limit) = query.limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }

    let mut stmt = conn.prepare(&sql)?;
    let clusters = stmt
        .query_map(params_from_iter(params.iter()), cluster_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    clusters
        .into_iter()
        .map(|mut cluster| {
            cluster.details = load_details(conn, &cluster.id)?;
            Ok(cluster)
        })
        .collect()
}

pub fn write_cluster(conn: &Connection, cluster: &DetailsCluster) -> Result<usize> {
    Ok(conn.execute(
        "UPDATE details_clusters
         SET name = ?, description = ?, tags = ?, updatedAt = ?, metadata = ?
         WHERE id = ?",
        params![
            cluster.name,
            cluster.description,
            serde_json::to_string(&cluster.tags)?,
            format_ts(&cluster.updated_at),
            serde_json::to_string(&cluster.metadata)?,
            cluster.id,
        ],
    )?)
}

pub fn touch_cluster(conn: &Connection, cluster_id: &str, at: &str) -> Result<()> {
    conn.execute(
        "UPDATE details_clusters SET updatedAt = ? WHERE id = ?",
        params![at, cluster_id],
    )?;
    Ok(())
}

/// Detach memories, drop details and the cluster, all or nothing
pub fn delete_cluster(conn: &mut Connection, id: &str) -> Result<ClusterDeletion> {
    let tx = conn.transaction()?;
    let detached = tx.execute(
        "UPDATE memories SET clusterId = NULL WHERE clusterId = ?",
        [id],
    )?;
    let details = tx.execute("DELETE FROM cluster_details WHERE clusterId = ?", [id])?;
    let deleted = tx.execute("DELETE FROM details_clusters WHERE id = ?", [id])?;
    if deleted == 0 {
        // Dropping the transaction rolls back the detach
        return Err(VaultError::not_found("cluster", id));
    }
    tx.commit()?;

    Ok(ClusterDeletion {
        cluster_id: id.to_string(),
        detached_memories: detached,
        deleted_details: details,
    })
}

pub fn insert_detail(conn: &Connection, detail: &ClusterDetail) -> Result<()> {
    conn.execute(
        "INSERT INTO cluster_details (id, clusterId, key, value, type, importance, createdAt, updatedAt)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            detail.id,
            detail.cluster_id,
            detail.key,
            detail.value,
            detail.detail_type.as_str(),
            i64::from(detail.importance),
            format_ts(&detail.created_at),
            format_ts(&detail.updated_at),
        ],
    )?;
    Ok(())
}

pub fn get_detail(conn: &Connection, id: &str) -> Result<Option<ClusterDetail>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, clusterId, key, value, type, importance, createdAt, updatedAt
         FROM cluster_details WHERE id = ?",
    )?;
    let mut rows = stmt.query_map([id], detail_from_row)?;
    Ok(rows.next().transpose()?)
}

pub fn write_detail(conn: &Connection, detail: &ClusterDetail) -> Result<usize> {
    Ok(conn.execute(
        "UPDATE cluster_details SET key = ?, value = ?, type = ?, importance = ?, updatedAt = ?
         WHERE id = ?",
        params![
            detail.key,
            detail.value,
            detail.detail_type.as_str(),
            i64::from(detail.importance),
            format_ts(&detail.updated_at),
            detail.id,
        ],
    )?)
}

pub fn delete_detail(conn: &Connection, id: &str) -> Result<usize> {
    Ok(conn.execute("DELETE FROM cluster_details WHERE id = ?", [id])?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::migrations::run_migrations;
    use crate::storage::queries::{get_memory, insert_memory};
    use crate::storage::records::now;
    use crate::types::{DetailType, MemoryEntry, Metadata};

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    fn cluster(id: &str) -> DetailsCluster {
        let now = now();
        DetailsCluster {
            id: id.to_string(),
            name: "Project Atlas".to_string(),
            description: "launch plan".to_string(),
            tags: vec!["project".to_string()],
            created_at: now,
            updated_at: now,
            metadata: Metadata::new(),
            details: vec![ClusterDetail {
                id: format!("{}-d1", id),
                cluster_id: id.to_string(),
                key: "deadline".to_string(),
                value: "2026-12-01".to_string(),
                detail_type: DetailType::Date,
                importance: Importance::new(8).unwrap(),
                created_at: now,
                updated_at: now,
            }],
        }
    }

    #[test]
    fn test_cluster_round_trip() {
        let mut conn = conn();
        let c = cluster("c1");
        insert_cluster(&mut conn, &c).unwrap();
        assert_eq!(get_cluster(&conn, "c1").unwrap(), Some(c));
        assert!(cluster_exists(&conn, "c1").unwrap());
        assert!(!cluster_exists(&conn, "c2").unwrap());
    }

    #[test]
    fn test_delete_detaches_and_cascades() {
        let mut conn = conn();
        insert_cluster(&mut conn, &cluster("c1")).unwrap();
        let now = now();
        insert_memory(
            &conn,
            &MemoryEntry {
                id: "m1".into(),
                content: "linked".into(),
                tags: vec![],
                context: String::new(),
                importance: Importance::default(),
                timestamp: now,
                last_accessed: now,
                access_count: 0,
                metadata: Metadata::new(),
                cluster_id: Some("c1".into()),
                embedding: None,
            },
        )
        .unwrap();

        let deletion = delete_cluster(&mut conn, "c1").unwrap();
        assert_eq!(deletion.detached_memories, 1);
        assert_eq!(deletion.deleted_details, 1);
        assert_eq!(get_memory(&conn, "m1").unwrap().unwrap().cluster_id, None);
        assert!(get_detail(&conn, "c1-d1").unwrap().is_none());
    }

    #[test]
    fn test_delete_missing_cluster_is_not_found() {
        let mut conn = conn();
        let err = delete_cluster(&mut conn, "nope").unwrap_err();
        assert!(matches!(err, VaultError::NotFound { entity: "cluster", .. }));
    }

    #[test]
    fn test_list_filters_by_name() {
        let mut conn = conn();
        insert_cluster(&mut conn, &cluster("c1")).unwrap();
        let mut other = cluster("c2");
        other.name = "Groceries".into();
        other.description = String::new();
        other.details.clear();
        insert_cluster(&mut conn, &other).unwrap();

        let found = list_clusters(
            &conn,
            &ClusterQuery {
                query: Some("atlas".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].details.len(), 1);
    }

    #[test]
    fn test_list_query_wildcards_are_literal() {
        let mut conn = conn();
        let mut done = cluster("c1");
        done.name = "100% done".into();
        insert_cluster(&mut conn, &done).unwrap();
        let mut percent = cluster("c2");
        percent.name = "100 percent".into();
        insert_cluster(&mut conn, &percent).unwrap();
        let mut snake = cluster("c3");
        snake.name = "snake_case".into();
        insert_cluster(&mut conn, &snake).unwrap();

        let names = |q: &str| -> Vec<String> {
            list_clusters(
                &conn,
                &ClusterQuery {
                    query: Some(q.into()),
                    ..Default::default()
                },
            )
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect()
        };
        assert_eq!(names("100%"), vec!["100% done"]);
        assert_eq!(names("e_c"), vec!["snake_case"]);
        assert!(names("a_e").is_empty());
    }
}
