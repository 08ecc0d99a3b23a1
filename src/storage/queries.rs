//! SQLite queries for memories and docs
//!
//! These functions work on the stored form of records: sealed content stays
//! sealed here. Tags, metadata and embeddings are JSON text columns.

use rusqlite::{params, params_from_iter, Connection, Row, ToSql};
use std::collections::HashMap;

use super::backend::{EntityTable, PendingRow, StorageStats};
use super::records::{format_ts, parse_ts};
use crate::error::Result;
use crate::types::{is_sealed, DocEntry, DocFilter, Importance, MemoryEntry, MemoryFilter, Metadata};

const MEMORY_COLUMNS: &str = "id, content, tags, context, importance, timestamp, lastAccessed, \
                              accessCount, metadata, clusterId, embedding";
const DOC_COLUMNS: &str =
    "id, url, title, content, tags, timestamp, lastFetched, accessCount, metadata, embedding";

/// Parse a memory from a database row
pub fn memory_from_row(row: &Row) -> rusqlite::Result<MemoryEntry> {
    let tags: String = row.get("tags")?;
    let importance: i64 = row.get("importance")?;
    let timestamp: String = row.get("timestamp")?;
    let last_accessed: String = row.get("lastAccessed")?;
    let metadata: String = row.get("metadata")?;
    let embedding: Option<String> = row.get("embedding")?;

    Ok(MemoryEntry {
        id: row.get("id")?,
        content: row.get("content")?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        context: row.get("context")?,
        importance: Importance::new(importance).unwrap_or_default(),
        timestamp: parse_ts(&timestamp),
        last_accessed: parse_ts(&last_accessed),
        access_count: row.get("accessCount")?,
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        cluster_id: row.get("clusterId")?,
        embedding: embedding.and_then(|e| serde_json::from_str(&e).ok()),
    })
}

/// Parse a doc from a database row
pub fn doc_from_row(row: &Row) -> rusqlite::Result<DocEntry> {
    let tags: String = row.get("tags")?;
    let timestamp: String = row.get("timestamp")?;
    let last_fetched: String = row.get("lastFetched")?;
    let metadata: String = row.get("metadata")?;
    let embedding: Option<String> = row.get("embedding")?;

    Ok(DocEntry {
        id: row.get("id")?,
        url: row.get("url")?,
        title: row.get("title")?,
        content: row.get("content")?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        timestamp: parse_ts(&timestamp),
        last_fetched: parse_ts(&last_fetched),
        access_count: row.get("accessCount")?,
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        embedding: embedding.and_then(|e| serde_json::from_str(&e).ok()),
    })
}

fn embedding_json(embedding: &Option<Vec<f32>>) -> Result<Option<String>> {
    Ok(embedding.as_ref().map(serde_json::to_string).transpose()?)
}

/// Escape LIKE wildcards; patterns are matched with `ESCAPE '\'`
pub(crate) fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Tags are stored as a JSON array, so a tag matches its quoted form
pub(crate) fn tag_conditions(tags: &[String], conditions: &mut Vec<String>, params: &mut Vec<Box<dyn ToSql>>) {
    if tags.is_empty() {
        return;
    }
    let mut any = Vec::with_capacity(tags.len());
    for tag in tags {
        let quoted = serde_json::Value::String(tag.clone()).to_string();
        any.push("tags LIKE ? ESCAPE '\\'".to_string());
        params.push(Box::new(format!("%{}%", escape_like(&quoted))));
    }
    conditions.push(format!("({})", any.join(" OR ")));
}

/// WHERE conditions for a memory filter.
///
/// With `match_content` false the content substring is left to the caller,
/// which is how sealed content gets matched after decryption.
fn memory_conditions(
    filter: &MemoryFilter,
    match_content: bool,
    conditions: &mut Vec<String>,
    params: &mut Vec<Box<dyn ToSql>>,
) {
    if let Some(id) = &filter.id {
        conditions.push("id = ?".to_string());
        params.push(Box::new(id.clone()));
    }
    tag_conditions(&filter.tags, conditions, params);
    if let Some(context) = &filter.context {
        conditions.push("context = ?".to_string());
        params.push(Box::new(context.clone()));
    }
    if let (Some(query), true) = (&filter.query, match_content) {
        conditions.push("content LIKE ? ESCAPE '\\'".to_string());
        params.push(Box::new(format!("%{}%", escape_like(query))));
    }
    if let Some(min) = filter.min_importance {
        conditions.push("importance >= ?".to_string());
        params.push(Box::new(min));
    }
    if let Some(before) = &filter.before {
        conditions.push("timestamp < ?".to_string());
        params.push(Box::new(format_ts(before)));
    }
}

fn doc_conditions(
    filter: &DocFilter,
    match_content: bool,
    conditions: &mut Vec<String>,
    params: &mut Vec<Box<dyn ToSql>>,
) {
    if let Some(id) = &filter.id {
        conditions.push("id = ?".to_string());
        params.push(Box::new(id.clone()));
    }
    if let Some(url) = &filter.url {
        conditions.push("url = ?".to_string());
        params.push(Box::new(url.clone()));
    }
    tag_conditions(&filter.tags, conditions, params);
    if let (Some(query), true) = (&filter.query, match_content) {
        let pattern = format!("%{}%", escape_like(query));
        conditions.push(
            "(content LIKE ? ESCAPE '\\' OR title LIKE ? ESCAPE '\\' OR url LIKE ? ESCAPE '\\')"
                .to_string(),
        );
        for _ in 0..3 {
            params.push(Box::new(pattern.clone()));
        }
    }
    if let Some(before) = &filter.before {
        conditions.push("timestamp < ?".to_string());
        params.push(Box::new(format_ts(before)));
    }
}

fn where_clause(conditions: &[String]) -> String {
    if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    }
}

fn limit_clause(limit: Option<usize>) -> String {
    limit.map(|l| format!(" LIMIT {}", l)).unwrap_or_default()
}

// ============================================================================
// Memories
// ============================================================================

pub fn insert_memory(conn: &Connection, memory: &MemoryEntry) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO memories (id, content, tags, context, importance, timestamp, lastAccessed,
                               accessCount, metadata, clusterId, embedding)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )?;
    stmt.execute(params![
        memory.id,
        memory.content,
        serde_json::to_string(&memory.tags)?,
        memory.context,
        i64::from(memory.importance),
        format_ts(&memory.timestamp),
        format_ts(&memory.last_accessed),
        memory.access_count,
        serde_json::to_string(&memory.metadata)?,
        memory.cluster_id,
        embedding_json(&memory.embedding)?,
    ])?;
    Ok(())
}

pub fn get_memory(conn: &Connection, id: &str) -> Result<Option<MemoryEntry>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM memories WHERE id = ?",
        MEMORY_COLUMNS
    ))?;
    let mut rows = stmt.query_map([id], memory_from_row)?;
    Ok(rows.next().transpose()?)
}

/// Select memories matching `filter` (or all), in `order`, up to `limit`
pub fn select_memories(
    conn: &Connection,
    filter: Option<&MemoryFilter>,
    match_content: bool,
    order: &str,
    limit: Option<usize>,
) -> Result<Vec<MemoryEntry>> {
    let mut conditions = Vec::new();
    let mut params: Vec<Box<dyn ToSql>> = Vec::new();
    if let Some(filter) = filter {
        memory_conditions(filter, match_content, &mut conditions, &mut params);
    }

    let sql = format!(
        "SELECT {} FROM memories{} ORDER BY {}{}",
        MEMORY_COLUMNS,
        where_clause(&conditions),
        order,
        limit_clause(limit)
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(params.iter()), memory_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Delete memories matching `filter` (all when `None`), including the content substring
pub fn delete_memories(conn: &Connection, filter: Option<&MemoryFilter>) -> Result<usize> {
    let mut conditions = Vec::new();
    let mut params: Vec<Box<dyn ToSql>> = Vec::new();
    if let Some(filter) = filter {
        memory_conditions(filter, true, &mut conditions, &mut params);
    }
    let sql = format!("DELETE FROM memories{}", where_clause(&conditions));
    Ok(conn.execute(&sql, params_from_iter(params.iter()))?)
}

/// Persist every mutable column of a stored memory
pub fn write_memory(conn: &Connection, memory: &MemoryEntry) -> Result<usize> {
    let mut stmt = conn.prepare_cached(
        "UPDATE memories
         SET content = ?, tags = ?, context = ?, importance = ?, metadata = ?,
             clusterId = ?, embedding = ?
         WHERE id = ?",
    )?;
    Ok(stmt.execute(params![
        memory.content,
        serde_json::to_string(&memory.tags)?,
        memory.context,
        i64::from(memory.importance),
        serde_json::to_string(&memory.metadata)?,
        memory.cluster_id,
        embedding_json(&memory.embedding)?,
        memory.id,
    ])?)
}

/// Bump access counters after a search
pub fn touch_memories(conn: &Connection, ids: &[String], at: &str) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "UPDATE memories SET accessCount = accessCount + 1, lastAccessed = ? WHERE id = ?",
    )?;
    for id in ids {
        stmt.execute(params![at, id])?;
    }
    Ok(())
}

pub fn memories_by_cluster(conn: &Connection, cluster_id: &str) -> Result<Vec<MemoryEntry>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM memories WHERE clusterId = ? ORDER BY timestamp ASC, rowid ASC",
        MEMORY_COLUMNS
    ))?;
    let rows = stmt.query_map([cluster_id], memory_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn set_memory_cluster(conn: &Connection, memory_id: &str, cluster_id: Option<&str>) -> Result<usize> {
    Ok(conn.execute(
        "UPDATE memories SET clusterId = ? WHERE id = ?",
        params![cluster_id, memory_id],
    )?)
}

// ============================================================================
// Docs
// ============================================================================

pub fn insert_doc(conn: &Connection, doc: &DocEntry) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO docs (id, url, title, content, tags, timestamp, lastFetched,
                           accessCount, metadata, embedding)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )?;
    stmt.execute(params![
        doc.id,
        doc.url,
        doc.title,
        doc.content,
        serde_json::to_string(&doc.tags)?,
        format_ts(&doc.timestamp),
        format_ts(&doc.last_fetched),
        doc.access_count,
        serde_json::to_string(&doc.metadata)?,
        embedding_json(&doc.embedding)?,
    ])?;
    Ok(())
}

pub fn select_docs(
    conn: &Connection,
    filter: Option<&DocFilter>,
    match_content: bool,
    order: &str,
    limit: Option<usize>,
) -> Result<Vec<DocEntry>> {
    let mut conditions = Vec::new();
    let mut params: Vec<Box<dyn ToSql>> = Vec::new();
    if let Some(filter) = filter {
        doc_conditions(filter, match_content, &mut conditions, &mut params);
    }

    let sql = format!(
        "SELECT {} FROM docs{} ORDER BY {}{}",
        DOC_COLUMNS,
        where_clause(&conditions),
        order,
        limit_clause(limit)
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(params.iter()), doc_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn delete_docs(conn: &Connection, filter: Option<&DocFilter>) -> Result<usize> {
    let mut conditions = Vec::new();
    let mut params: Vec<Box<dyn ToSql>> = Vec::new();
    if let Some(filter) = filter {
        doc_conditions(filter, true, &mut conditions, &mut params);
    }
    let sql = format!("DELETE FROM docs{}", where_clause(&conditions));
    Ok(conn.execute(&sql, params_from_iter(params.iter()))?)
}

pub fn write_doc(conn: &Connection, doc: &DocEntry) -> Result<usize> {
    let mut stmt = conn.prepare_cached(
        "UPDATE docs
         SET url = ?, title = ?, content = ?, tags = ?, lastFetched = ?, metadata = ?, embedding = ?
         WHERE id = ?",
    )?;
    Ok(stmt.execute(params![
        doc.url,
        doc.title,
        doc.content,
        serde_json::to_string(&doc.tags)?,
        format_ts(&doc.last_fetched),
        serde_json::to_string(&doc.metadata)?,
        embedding_json(&doc.embedding)?,
        doc.id,
    ])?)
}

/// Docs only track a counter; `lastFetched` belongs to re-fetches
pub fn touch_docs(conn: &Connection, ids: &[String]) -> Result<()> {
    let mut stmt =
        conn.prepare_cached("UPDATE docs SET accessCount = accessCount + 1 WHERE id = ?")?;
    for id in ids {
        stmt.execute([id])?;
    }
    Ok(())
}

// ============================================================================
// Shared
// ============================================================================

pub fn delete_by_ids(conn: &Connection, table: EntityTable, ids: &[String]) -> Result<usize> {
    let sql = format!("DELETE FROM {} WHERE id = ?", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut deleted = 0;
    for id in ids {
        deleted += stmt.execute([id])?;
    }
    Ok(deleted)
}

fn pending_row(row: &Row) -> rusqlite::Result<PendingRow> {
    let metadata: String = row.get(2)?;
    Ok(PendingRow {
        id: row.get(0)?,
        content: row.get(1)?,
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
    })
}

pub fn rows_missing_embedding(conn: &Connection, table: EntityTable) -> Result<Vec<PendingRow>> {
    let sql = format!(
        "SELECT id, content, metadata FROM {} WHERE embedding IS NULL ORDER BY rowid",
        table
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], pending_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn rows_unsealed(conn: &Connection, table: EntityTable) -> Result<Vec<PendingRow>> {
    let sql = format!("SELECT id, content, metadata FROM {} ORDER BY rowid", table);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], pending_row)?;
    let mut pending = Vec::new();
    for row in rows {
        let row = row?;
        if !is_sealed(&row.metadata) {
            pending.push(row);
        }
    }
    Ok(pending)
}

pub fn write_embedding(conn: &Connection, table: EntityTable, id: &str, embedding: &[f32]) -> Result<()> {
    let sql = format!("UPDATE {} SET embedding = ? WHERE id = ?", table);
    conn.execute(&sql, params![serde_json::to_string(embedding)?, id])?;
    Ok(())
}

pub fn write_sealed(
    conn: &Connection,
    table: EntityTable,
    id: &str,
    content: &str,
    metadata: &Metadata,
) -> Result<()> {
    let sql = format!("UPDATE {} SET content = ?, metadata = ? WHERE id = ?", table);
    conn.execute(&sql, params![content, serde_json::to_string(metadata)?, id])?;
    Ok(())
}

fn count(conn: &Connection, sql: &str) -> Result<i64> {
    Ok(conn.query_row(sql, [], |row| row.get(0))?)
}

fn count_sealed(conn: &Connection, table: EntityTable) -> Result<i64> {
    let sql = format!("SELECT metadata FROM {}", table);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut sealed = 0;
    for metadata in rows {
        let metadata: Metadata = serde_json::from_str(&metadata?).unwrap_or_default();
        if is_sealed(&metadata) {
            sealed += 1;
        }
    }
    Ok(sealed)
}

pub fn stats(conn: &Connection) -> Result<StorageStats> {
    let mut tag_counts: HashMap<String, i64> = HashMap::new();
    {
        let mut stmt = conn.prepare("SELECT tags FROM memories")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        for tags in rows {
            let tags: Vec<String> = serde_json::from_str(&tags?).unwrap_or_default();
            for tag in tags {
                *tag_counts.entry(tag).or_insert(0) += 1;
            }
        }
    }

    let mut context_counts = HashMap::new();
    {
        let mut stmt =
            conn.prepare("SELECT context, COUNT(*) FROM memories GROUP BY context")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (context, n) = row?;
            context_counts.insert(context, n);
        }
    }

    let (oldest, newest): (Option<String>, Option<String>) = conn.query_row(
        "SELECT MIN(timestamp), MAX(timestamp) FROM memories",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    Ok(StorageStats {
        memory_count: count(conn, "SELECT COUNT(*) FROM memories")?,
        doc_count: count(conn, "SELECT COUNT(*) FROM docs")?,
        cluster_count: count(conn, "SELECT COUNT(*) FROM details_clusters")?,
        detail_count: count(conn, "SELECT COUNT(*) FROM cluster_details")?,
        linked_memories: count(conn, "SELECT COUNT(*) FROM memories WHERE clusterId IS NOT NULL")?,
        encrypted_memories: count_sealed(conn, EntityTable::Memories)?,
        encrypted_docs: count_sealed(conn, EntityTable::Docs)?,
        memories_with_embedding: count(
            conn,
            "SELECT COUNT(*) FROM memories WHERE embedding IS NOT NULL",
        )?,
        docs_with_embedding: count(conn, "SELECT COUNT(*) FROM docs WHERE embedding IS NOT NULL")?,
        tag_counts,
        context_counts,
        oldest_memory: oldest.as_deref().map(parse_ts),
        newest_memory: newest.as_deref().map(parse_ts),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::migrations::run_migrations;
    use crate::storage::records::now;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    fn memory(id: &str, content: &str, tags: &[&str], importance: i64) -> MemoryEntry {
        let now = now();
        MemoryEntry {
            id: id.to_string(),
            content: content.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            context: "work".to_string(),
            importance: Importance::new(importance).unwrap(),
            timestamp: now,
            last_accessed: now,
            access_count: 0,
            metadata: Metadata::new(),
            cluster_id: None,
            embedding: None,
        }
    }

    #[test]
    fn test_insert_and_get() {
        let conn = conn();
        let mut m = memory("m1", "hello", &["a"], 7);
        m.embedding = Some(vec![0.25, 0.75]);
        insert_memory(&conn, &m).unwrap();
        assert_eq!(get_memory(&conn, "m1").unwrap(), Some(m));
        assert_eq!(get_memory(&conn, "missing").unwrap(), None);
    }

    #[test]
    fn test_tag_filter_is_exact_and_ored() {
        let conn = conn();
        insert_memory(&conn, &memory("m1", "one", &["rust"], 5)).unwrap();
        insert_memory(&conn, &memory("m2", "two", &["rusty"], 5)).unwrap();
        insert_memory(&conn, &memory("m3", "three", &["go"], 5)).unwrap();
        insert_memory(&conn, &memory("m4", "four", &["100%_sure"], 5)).unwrap();

        let filter = MemoryFilter {
            tags: vec!["rust".into(), "go".into()],
            ..Default::default()
        };
        let found = select_memories(&conn, Some(&filter), true, "rowid ASC", None).unwrap();
        let ids: Vec<_> = found.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m3"]);

        let wildcard = MemoryFilter {
            tags: vec!["100%_sure".into()],
            ..Default::default()
        };
        assert_eq!(
            select_memories(&conn, Some(&wildcard), true, "rowid ASC", None)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_importance_threshold_and_limit() {
        let conn = conn();
        for (i, importance) in [2, 8, 9, 4].iter().enumerate() {
            insert_memory(&conn, &memory(&format!("m{}", i), "x", &[], *importance)).unwrap();
        }
        let filter = MemoryFilter {
            min_importance: Some(8),
            ..Default::default()
        };
        let found =
            select_memories(&conn, Some(&filter), true, "importance DESC", Some(1)).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].importance.get(), 9);
    }

    #[test]
    fn test_delete_with_filter() {
        let conn = conn();
        insert_memory(&conn, &memory("m1", "keep this", &[], 5)).unwrap();
        insert_memory(&conn, &memory("m2", "drop this", &[], 5)).unwrap();
        let filter = MemoryFilter {
            query: Some("drop".into()),
            ..Default::default()
        };
        assert_eq!(delete_memories(&conn, Some(&filter)).unwrap(), 1);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM memories").unwrap(), 1);
    }

    #[test]
    fn test_pending_rows() {
        let conn = conn();
        insert_memory(&conn, &memory("m1", "plain", &[], 5)).unwrap();
        let mut sealed = memory("m2", "c2VhbGVk", &[], 5);
        sealed.metadata.insert("encrypted".into(), serde_json::json!(true));
        sealed.embedding = Some(vec![1.0]);
        insert_memory(&conn, &sealed).unwrap();

        let missing = rows_missing_embedding(&conn, EntityTable::Memories).unwrap();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].id, "m1");

        let unsealed = rows_unsealed(&conn, EntityTable::Memories).unwrap();
        assert_eq!(unsealed.len(), 1);
        assert_eq!(unsealed[0].id, "m1");
    }

    #[test]
    fn test_stats() {
        let conn = conn();
        insert_memory(&conn, &memory("m1", "a", &["x", "y"], 5)).unwrap();
        insert_memory(&conn, &memory("m2", "b", &["x"], 5)).unwrap();
        let stats = stats(&conn).unwrap();
        assert_eq!(stats.memory_count, 2);
        assert_eq!(stats.tag_counts["x"], 2);
        assert_eq!(stats.tag_counts["y"], 1);
        assert_eq!(stats.context_counts["work"], 2);
        assert!(stats.oldest_memory.is_some());
    }
}
