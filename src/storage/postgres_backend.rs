//! PostgreSQL implementation of the storage provider contract
//!
//! Mirrors the SQLite backend over a pooled sqlx connection. Tags, metadata
//! and embeddings are JSONB, timestamps are TIMESTAMPTZ, and column names keep
//! their camelCase spelling (quoted) so both stores share one logical layout.
//!
//! A `seq BIGSERIAL` column records insertion order and breaks timestamp ties.
//!
//! # Usage
//!
//! ```rust,ignore
//! use memvault::storage::PostgresBackend;
//!
//! let backend = PostgresBackend::connect(config, envelope, embeddings)?;
//! backend.initialize().await?;
//! ```
//!
//! Calls are cancelled by dropping their future; sqlx returns the connection
//! to the pool and the server abandons the statement.

#![cfg(feature = "postgres")]

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgExecutor, PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{FromRow, Postgres, QueryBuilder};

use super::backend::{
    require_limit, BackendCapabilities, EntityTable, MigrationTarget, PendingRow, StorageInfo,
    StorageProvider, StorageStats,
};
use super::records::{
    doc_matches_query, doc_query, doc_record, memory_matches_query, memory_query, memory_record,
    new_id, now, patch_cluster, patch_detail, patch_doc, patch_memory, reveal_doc, reveal_memory,
    written_doc, written_memory, ContentChange,
};
use crate::config::PostgresConfig;
use crate::crypto::EnvelopeService;
use crate::embedding::{rank_by_similarity, EmbeddingService};
use crate::error::{Result, VaultError};
use crate::types::{
    normalize_tags, ClusterChanges, ClusterDeletion, ClusterDetail, ClusterQuery,
    CreateClusterInput, DetailChanges, DetailInput, DetailsCluster, DocEntry, DocFilter, DocPatch,
    DocQuery, Importance, MemoryEntry, MemoryFilter, MemoryPatch, MemoryQuery, Metadata, NewDoc,
    NewMemory, ScoredDoc, ScoredMemory, Selector, SemanticQuery, ENCRYPTED_FLAG,
};

/// Schema version written by this backend
pub const PG_SCHEMA_VERSION: i32 = 2;

const TABLES: [&str; 5] = [
    r#"CREATE TABLE IF NOT EXISTS memories (
        id TEXT PRIMARY KEY,
        seq BIGSERIAL,
        content TEXT NOT NULL,
        tags JSONB NOT NULL DEFAULT '[]'::jsonb,
        context TEXT NOT NULL DEFAULT '',
        importance INTEGER NOT NULL DEFAULT 5,
        "timestamp" TIMESTAMPTZ NOT NULL,
        "lastAccessed" TIMESTAMPTZ NOT NULL,
        "accessCount" BIGINT NOT NULL DEFAULT 0,
        metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
        "clusterId" TEXT,
        embedding JSONB
    )"#,
    r#"CREATE TABLE IF NOT EXISTS docs (
        id TEXT PRIMARY KEY,
        seq BIGSERIAL,
        url TEXT,
        title TEXT,
        content TEXT NOT NULL,
        tags JSONB NOT NULL DEFAULT '[]'::jsonb,
        "timestamp" TIMESTAMPTZ NOT NULL,
        "lastFetched" TIMESTAMPTZ NOT NULL,
        "accessCount" BIGINT NOT NULL DEFAULT 0,
        metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
        embedding JSONB
    )"#,
    r#"CREATE TABLE IF NOT EXISTS details_clusters (
        id TEXT PRIMARY KEY,
        seq BIGSERIAL,
        name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        tags JSONB NOT NULL DEFAULT '[]'::jsonb,
        "createdAt" TIMESTAMPTZ NOT NULL,
        "updatedAt" TIMESTAMPTZ NOT NULL,
        metadata JSONB NOT NULL DEFAULT '{}'::jsonb
    )"#,
    r#"CREATE TABLE IF NOT EXISTS cluster_details (
        id TEXT PRIMARY KEY,
        seq BIGSERIAL,
        "clusterId" TEXT NOT NULL,
        key TEXT NOT NULL,
        value TEXT NOT NULL,
        "type" TEXT NOT NULL DEFAULT 'text',
        importance INTEGER NOT NULL DEFAULT 5,
        "createdAt" TIMESTAMPTZ NOT NULL,
        "updatedAt" TIMESTAMPTZ NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER PRIMARY KEY,
        applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )"#,
];

/// Columns an older database may be missing
const LEGACY_COLUMNS: [&str; 6] = [
    r#"ALTER TABLE memories ADD COLUMN IF NOT EXISTS seq BIGSERIAL"#,
    r#"ALTER TABLE memories ADD COLUMN IF NOT EXISTS "clusterId" TEXT"#,
    r#"ALTER TABLE memories ADD COLUMN IF NOT EXISTS embedding JSONB"#,
    r#"ALTER TABLE docs ADD COLUMN IF NOT EXISTS seq BIGSERIAL"#,
    r#"ALTER TABLE docs ADD COLUMN IF NOT EXISTS embedding JSONB"#,
    r#"ALTER TABLE cluster_details ADD COLUMN IF NOT EXISTS seq BIGSERIAL"#,
];

const INDEXES: [&str; 10] = [
    r#"CREATE INDEX IF NOT EXISTS idx_memories_timestamp ON memories("timestamp")"#,
    r#"CREATE INDEX IF NOT EXISTS idx_memories_importance ON memories(importance)"#,
    r#"CREATE INDEX IF NOT EXISTS idx_memories_context ON memories(context)"#,
    r#"CREATE INDEX IF NOT EXISTS idx_memories_last_accessed ON memories("lastAccessed")"#,
    r#"CREATE INDEX IF NOT EXISTS idx_memories_cluster ON memories("clusterId")"#,
    r#"CREATE INDEX IF NOT EXISTS idx_memories_tags ON memories USING GIN (tags)"#,
    r#"CREATE INDEX IF NOT EXISTS idx_docs_timestamp ON docs("timestamp")"#,
    r#"CREATE INDEX IF NOT EXISTS idx_docs_url ON docs(url)"#,
    r#"CREATE INDEX IF NOT EXISTS idx_cluster_details_cluster ON cluster_details("clusterId", "createdAt")"#,
    r#"CREATE INDEX IF NOT EXISTS idx_clusters_name ON details_clusters(name)"#,
];

const MEMORY_COLUMNS: &str = r#"id, content, tags, context, importance, "timestamp", "lastAccessed", "accessCount", metadata, "clusterId", embedding"#;
const DOC_COLUMNS: &str = r#"id, url, title, content, tags, "timestamp", "lastFetched", "accessCount", metadata, embedding"#;
const CLUSTER_COLUMNS: &str =
    r#"id, name, description, tags, "createdAt", "updatedAt", metadata"#;
const DETAIL_COLUMNS: &str =
    r#"id, "clusterId", key, value, "type", importance, "createdAt", "updatedAt""#;

// ============================================================================
// Row mapping
// ============================================================================

#[derive(FromRow)]
struct MemoryRow {
    id: String,
    content: String,
    tags: Json<Vec<String>>,
    context: String,
    importance: i32,
    timestamp: DateTime<Utc>,
    #[sqlx(rename = "lastAccessed")]
    last_accessed: DateTime<Utc>,
    #[sqlx(rename = "accessCount")]
    access_count: i64,
    metadata: Json<Metadata>,
    #[sqlx(rename = "clusterId")]
    cluster_id: Option<String>,
    embedding: Option<Json<Vec<f32>>>,
}

impl From<MemoryRow> for MemoryEntry {
    fn from(row: MemoryRow) -> Self {
        MemoryEntry {
            id: row.id,
            content: row.content,
            tags: row.tags.0,
            context: row.context,
            importance: Importance::new(i64::from(row.importance)).unwrap_or_default(),
            timestamp: row.timestamp,
            last_accessed: row.last_accessed,
            access_count: row.access_count,
            metadata: row.metadata.0,
            cluster_id: row.cluster_id,
            embedding: row.embedding.map(|e| e.0),
        }
    }
}

#[derive(FromRow)]
struct DocRow {
    id: String,
    url: Option<String>,
    title: Option<String>,
    content: String,
    tags: Json<Vec<String>>,
    timestamp: DateTime<Utc>,
    #[sqlx(rename = "lastFetched")]
    last_fetched: DateTime<Utc>,
    #[sqlx(rename = "accessCount")]
    access_count: i64,
    metadata: Json<Metadata>,
    embedding: Option<Json<Vec<f32>>>,
}

impl From<DocRow> for DocEntry {
    fn from(row: DocRow) -> Self {
        DocEntry {
            id: row.id,
            url: row.url,
            title: row.title,
            content: row.content,
            tags: row.tags.0,
            timestamp: row.timestamp,
            last_fetched: row.last_fetched,
            access_count: row.access_count,
            metadata: row.metadata.0,
            embedding: row.embedding.map(|e| e.0),
        }
    }
}

#[derive(FromRow)]
struct ClusterRow {
    id: String,
    name: String,
    description: String,
    tags: Json<Vec<String>>,
    #[sqlx(rename = "createdAt")]
    created_at: DateTime<Utc>,
    #[sqlx(rename = "updatedAt")]
    updated_at: DateTime<Utc>,
    metadata: Json<Metadata>,
}

impl From<ClusterRow> for DetailsCluster {
    fn from(row: ClusterRow) -> Self {
        DetailsCluster {
            id: row.id,
            name: row.name,
            description: row.description,
            tags: row.tags.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
            metadata: row.metadata.0,
            details: vec![],
        }
    }
}

#[derive(FromRow)]
struct DetailRow {
    id: String,
    #[sqlx(rename = "clusterId")]
    cluster_id: String,
    key: String,
    value: String,
    #[sqlx(rename = "type")]
    detail_type: String,
    importance: i32,
    #[sqlx(rename = "createdAt")]
    created_at: DateTime<Utc>,
    #[sqlx(rename = "updatedAt")]
    updated_at: DateTime<Utc>,
}

impl From<DetailRow> for ClusterDetail {
    fn from(row: DetailRow) -> Self {
        ClusterDetail {
            id: row.id,
            cluster_id: row.cluster_id,
            key: row.key,
            value: row.value,
            detail_type: row.detail_type.parse().unwrap_or_default(),
            importance: Importance::new(i64::from(row.importance)).unwrap_or_default(),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct PendingRowPg {
    id: String,
    content: String,
    metadata: Json<Metadata>,
}

fn importance_column(importance: Importance) -> i32 {
    i32::from(importance.get())
}

// ============================================================================
// Filters
// ============================================================================

fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn push_conjunction(qb: &mut QueryBuilder<'_, Postgres>, first: &mut bool) {
    qb.push(if *first { " WHERE " } else { " AND " });
    *first = false;
}

/// Append the WHERE clause for a memory filter.
///
/// With `match_content` false the content substring is left to the caller.
fn push_memory_filter(
    qb: &mut QueryBuilder<'_, Postgres>,
    filter: Option<&MemoryFilter>,
    match_content: bool,
) {
    let Some(filter) = filter else { return };
    let mut first = true;
    if let Some(id) = &filter.id {
        push_conjunction(qb, &mut first);
        qb.push("id = ").push_bind(id.clone());
    }
    if !filter.tags.is_empty() {
        push_conjunction(qb, &mut first);
        qb.push("tags ?| ").push_bind(filter.tags.clone());
    }
    if let Some(context) = &filter.context {
        push_conjunction(qb, &mut first);
        qb.push("context = ").push_bind(context.clone());
    }
    if let (Some(query), true) = (&filter.query, match_content) {
        push_conjunction(qb, &mut first);
        qb.push("content ILIKE ")
            .push_bind(format!("%{}%", escape_like(query)));
    }
    if let Some(min) = filter.min_importance {
        push_conjunction(qb, &mut first);
        qb.push("importance >= ").push_bind(min);
    }
    if let Some(before) = filter.before {
        push_conjunction(qb, &mut first);
        qb.push(r#""timestamp" < "#).push_bind(before);
    }
}

fn push_doc_filter(
    qb: &mut QueryBuilder<'_, Postgres>,
    filter: Option<&DocFilter>,
    match_content: bool,
) {
    let Some(filter) = filter else { return };
    let mut first = true;
    if let Some(id) = &filter.id {
        push_conjunction(qb, &mut first);
        qb.push("id = ").push_bind(id.clone());
    }
    if let Some(url) = &filter.url {
        push_conjunction(qb, &mut first);
        qb.push("url = ").push_bind(url.clone());
    }
    if !filter.tags.is_empty() {
        push_conjunction(qb, &mut first);
        qb.push("tags ?| ").push_bind(filter.tags.clone());
    }
    if let (Some(query), true) = (&filter.query, match_content) {
        let pattern = format!("%{}%", escape_like(query));
        push_conjunction(qb, &mut first);
        qb.push("(content ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR title ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR url ILIKE ")
            .push_bind(pattern)
            .push(")");
    }
    if let Some(before) = filter.before {
        push_conjunction(qb, &mut first);
        qb.push(r#""timestamp" < "#).push_bind(before);
    }
}

fn order_by(column: &str, direction: &str) -> String {
    format!(r#" ORDER BY "{}" {}, seq {}"#, column, direction, direction)
}

async fn select_memories<'e>(
    executor: impl PgExecutor<'e>,
    filter: Option<&MemoryFilter>,
    match_content: bool,
    order: &str,
    limit: Option<usize>,
) -> Result<Vec<MemoryEntry>> {
    let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {} FROM memories", MEMORY_COLUMNS));
    push_memory_filter(&mut qb, filter, match_content);
    qb.push(order);
    if let Some(limit) = limit {
        qb.push(" LIMIT ").push_bind(limit as i64);
    }
    let rows = qb.build_query_as::<MemoryRow>().fetch_all(executor).await?;
    Ok(rows.into_iter().map(MemoryEntry::from).collect())
}

async fn select_docs<'e>(
    executor: impl PgExecutor<'e>,
    filter: Option<&DocFilter>,
    match_content: bool,
    order: &str,
    limit: Option<usize>,
) -> Result<Vec<DocEntry>> {
    let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {} FROM docs", DOC_COLUMNS));
    push_doc_filter(&mut qb, filter, match_content);
    qb.push(order);
    if let Some(limit) = limit {
        qb.push(" LIMIT ").push_bind(limit as i64);
    }
    let rows = qb.build_query_as::<DocRow>().fetch_all(executor).await?;
    Ok(rows.into_iter().map(DocEntry::from).collect())
}

async fn get_memory<'e>(executor: impl PgExecutor<'e>, id: &str) -> Result<Option<MemoryEntry>> {
    let row = sqlx::query_as::<_, MemoryRow>(&format!(
        "SELECT {} FROM memories WHERE id = $1",
        MEMORY_COLUMNS
    ))
    .bind(id)
    .fetch_optional(executor)
    .await?;
    Ok(row.map(MemoryEntry::from))
}

async fn write_memory<'e>(executor: impl PgExecutor<'e>, memory: &MemoryEntry) -> Result<usize> {
    let result = sqlx::query(
        r#"UPDATE memories
           SET content = $1, tags = $2, context = $3, importance = $4,
               metadata = $5, "clusterId" = $6, embedding = $7
           WHERE id = $8"#,
    )
    .bind(&memory.content)
    .bind(Json(&memory.tags))
    .bind(&memory.context)
    .bind(importance_column(memory.importance))
    .bind(Json(&memory.metadata))
    .bind(&memory.cluster_id)
    .bind(memory.embedding.as_ref().map(Json))
    .bind(&memory.id)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() as usize)
}

async fn write_doc<'e>(executor: impl PgExecutor<'e>, doc: &DocEntry) -> Result<usize> {
    let result = sqlx::query(
        r#"UPDATE docs
           SET url = $1, title = $2, content = $3, tags = $4, "lastFetched" = $5,
               metadata = $6, embedding = $7
           WHERE id = $8"#,
    )
    .bind(&doc.url)
    .bind(&doc.title)
    .bind(&doc.content)
    .bind(Json(&doc.tags))
    .bind(doc.last_fetched)
    .bind(Json(&doc.metadata))
    .bind(doc.embedding.as_ref().map(Json))
    .bind(&doc.id)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() as usize)
}

async fn cluster_exists<'e>(executor: impl PgExecutor<'e>, id: &str) -> Result<bool> {
    Ok(
        sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM details_clusters WHERE id = $1)")
            .bind(id)
            .fetch_one(executor)
            .await?,
    )
}

async fn get_detail<'e>(executor: impl PgExecutor<'e>, id: &str) -> Result<Option<ClusterDetail>> {
    let row = sqlx::query_as::<_, DetailRow>(&format!(
        "SELECT {} FROM cluster_details WHERE id = $1",
        DETAIL_COLUMNS
    ))
    .bind(id)
    .fetch_optional(executor)
    .await?;
    Ok(row.map(ClusterDetail::from))
}

async fn insert_detail<'e>(executor: impl PgExecutor<'e>, detail: &ClusterDetail) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO cluster_details (id, "clusterId", key, value, "type", importance, "createdAt", "updatedAt")
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
    )
    .bind(&detail.id)
    .bind(&detail.cluster_id)
    .bind(&detail.key)
    .bind(&detail.value)
    .bind(detail.detail_type.as_str())
    .bind(importance_column(detail.importance))
    .bind(detail.created_at)
    .bind(detail.updated_at)
    .execute(executor)
    .await?;
    Ok(())
}

async fn touch_cluster<'e>(
    executor: impl PgExecutor<'e>,
    cluster_id: &str,
    at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(r#"UPDATE details_clusters SET "updatedAt" = $1 WHERE id = $2"#)
        .bind(at)
        .bind(cluster_id)
        .execute(executor)
        .await?;
    Ok(())
}

// ============================================================================
// Backend
// ============================================================================

/// PostgreSQL storage backend
pub struct PostgresBackend {
    pool: PgPool,
    config: PostgresConfig,
    envelope: Option<Arc<EnvelopeService>>,
    embeddings: Arc<EmbeddingService>,
}

impl PostgresBackend {
    /// Build the pool. No connection is made until the first query.
    pub fn connect(
        config: PostgresConfig,
        envelope: Option<Arc<EnvelopeService>>,
        embeddings: Arc<EmbeddingService>,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect_lazy(&config.url)?;
        Ok(Self {
            pool,
            config,
            envelope,
            embeddings,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Redacted connection URL
    pub fn location(&self) -> String {
        self.config.redacted_url()
    }

    fn envelope(&self) -> Option<&EnvelopeService> {
        self.envelope.as_deref()
    }

    fn needs_reveal_filter(&self, query: Option<&str>) -> bool {
        self.envelope.is_some() && query.is_some()
    }

    async fn content_change(&self, content: Option<&String>) -> Option<ContentChange> {
        match content {
            Some(content) => Some(ContentChange {
                content: content.clone(),
                embedding: self.embeddings.embed_text(content).await,
            }),
            None => None,
        }
    }

    /// Run a write off the request path, retrying once
    fn spawn_detached<F, Fut>(&self, label: &'static str, task: F)
    where
        F: Fn(PgPool) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<(), sqlx::Error>> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::spawn(async move {
            for attempt in 1..=2 {
                match task(pool.clone()).await {
                    Ok(()) => return,
                    Err(e) if attempt == 1 => {
                        tracing::debug!("{} failed, retrying: {}", label, e);
                    }
                    Err(e) => tracing::warn!("{} failed: {}", label, e),
                }
            }
        });
    }

    fn track_memory_access(&self, found: &[MemoryEntry]) {
        if found.is_empty() {
            return;
        }
        let ids: Vec<String> = found.iter().map(|m| m.id.clone()).collect();
        let at = now();
        self.spawn_detached("memory access tracking", move |pool| {
            let ids = ids.clone();
            async move {
                sqlx::query(
                    r#"UPDATE memories SET "accessCount" = "accessCount" + 1, "lastAccessed" = $1
                       WHERE id = ANY($2)"#,
                )
                .bind(at)
                .bind(ids)
                .execute(&pool)
                .await
                .map(|_| ())
            }
        });
    }

    fn track_doc_access(&self, found: &[DocEntry]) {
        if found.is_empty() {
            return;
        }
        let ids: Vec<String> = found.iter().map(|d| d.id.clone()).collect();
        self.spawn_detached("doc access tracking", move |pool| {
            let ids = ids.clone();
            async move {
                sqlx::query(r#"UPDATE docs SET "accessCount" = "accessCount" + 1 WHERE id = ANY($1)"#)
                    .bind(ids)
                    .execute(&pool)
                    .await
                    .map(|_| ())
            }
        });
    }

    async fn load_details<'e>(
        &self,
        executor: impl PgExecutor<'e>,
        cluster_id: &str,
    ) -> Result<Vec<ClusterDetail>> {
        let rows = sqlx::query_as::<_, DetailRow>(&format!(
            r#"SELECT {} FROM cluster_details WHERE "clusterId" = $1 ORDER BY "createdAt" ASC, seq ASC"#,
            DETAIL_COLUMNS
        ))
        .bind(cluster_id)
        .fetch_all(executor)
        .await?;
        Ok(rows.into_iter().map(ClusterDetail::from).collect())
    }

    async fn count(&self, sql: &str) -> Result<i64> {
        Ok(sqlx::query_scalar::<_, i64>(sql).fetch_one(&self.pool).await?)
    }

    async fn schema_version(&self) -> Result<i32> {
        Ok(
            sqlx::query_scalar::<_, i32>("SELECT COALESCE(MAX(version), 0) FROM schema_version")
                .fetch_one(&self.pool)
                .await?,
        )
    }
}

#[async_trait]
impl StorageProvider for PostgresBackend {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            semantic_search: true,
            transactional_cluster_delete: true,
            access_tracking: true,
            cancellable_calls: true,
        }
    }

    fn migration_target(&self) -> Option<&dyn MigrationTarget> {
        Some(self)
    }

    async fn initialize(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for sql in TABLES.iter().chain(LEGACY_COLUMNS.iter()).chain(INDEXES.iter()) {
            sqlx::query(sql).execute(&mut *tx).await?;
        }
        let current: i32 =
            sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
                .fetch_one(&mut *tx)
                .await?;
        if current < PG_SCHEMA_VERSION {
            sqlx::query("INSERT INTO schema_version (version) VALUES ($1) ON CONFLICT DO NOTHING")
                .bind(PG_SCHEMA_VERSION)
                .execute(&mut *tx)
                .await?;
            tracing::info!(
                "PostgreSQL schema migrated from v{} to v{}",
                current,
                PG_SCHEMA_VERSION
            );
        }
        tx.commit().await?;
        tracing::info!("PostgreSQL backend ready at {}", self.location());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        tracing::info!("PostgreSQL backend closed");
        Ok(())
    }

    async fn storage_info(&self) -> Result<StorageInfo> {
        let schema_version = self.schema_version().await?;
        let db_size_bytes = sqlx::query_scalar::<_, i64>("SELECT pg_database_size(current_database())")
            .fetch_one(&self.pool)
            .await
            .ok();
        Ok(StorageInfo {
            backend: self.backend_name().to_string(),
            location: self.location(),
            storage_mode: "postgres".to_string(),
            schema_version,
            encryption_enabled: self.envelope.is_some(),
            embedding_model: self
                .embeddings
                .ready()
                .await
                .map(|e| e.model_name().to_string()),
            db_size_bytes,
            capabilities: self.capabilities(),
        })
    }

    // ========================================================================
    // Memories
    // ========================================================================

    async fn add_memory(&self, memory: NewMemory) -> Result<MemoryEntry> {
        let embedding = self.embeddings.embed_text(&memory.content).await;
        let plaintext = memory.content.clone();
        let stored = memory_record(memory, self.envelope(), embedding)?;

        sqlx::query(
            r#"INSERT INTO memories (id, content, tags, context, importance, "timestamp", "lastAccessed", "accessCount", metadata, "clusterId", embedding)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"#,
        )
        .bind(&stored.id)
        .bind(&stored.content)
        .bind(Json(&stored.tags))
        .bind(&stored.context)
        .bind(importance_column(stored.importance))
        .bind(stored.timestamp)
        .bind(stored.last_accessed)
        .bind(stored.access_count)
        .bind(Json(&stored.metadata))
        .bind(&stored.cluster_id)
        .bind(stored.embedding.as_ref().map(Json))
        .execute(&self.pool)
        .await?;

        Ok(written_memory(stored, plaintext))
    }

    async fn search_memories(&self, query: MemoryQuery) -> Result<Vec<MemoryEntry>> {
        query.validate()?;
        let filter = query.as_filter();
        let reveal_filter = self.needs_reveal_filter(filter.query.as_deref());
        let order = order_by(query.sort_by.column(), query.sort_order.sql());
        let sql_limit = if reveal_filter { None } else { query.limit };

        let stored =
            select_memories(&self.pool, Some(&filter), !reveal_filter, &order, sql_limit).await?;

        let mut found: Vec<MemoryEntry> = stored
            .into_iter()
            .map(|m| reveal_memory(self.envelope(), m))
            .filter(|m| !reveal_filter || memory_matches_query(m, query.query.as_deref()))
            .collect();
        if let Some(limit) = query.limit {
            found.truncate(limit);
        }

        self.track_memory_access(&found);
        Ok(found)
    }

    async fn get_recent_memories(&self, limit: usize) -> Result<Vec<MemoryEntry>> {
        let limit = require_limit(limit)?;
        let stored = select_memories(
            &self.pool,
            None,
            true,
            &order_by("timestamp", "DESC"),
            Some(limit),
        )
        .await?;
        Ok(stored
            .into_iter()
            .map(|m| reveal_memory(self.envelope(), m))
            .collect())
    }

    async fn get_all_memories(&self) -> Result<Vec<MemoryEntry>> {
        let stored =
            select_memories(&self.pool, None, true, &order_by("timestamp", "ASC"), None).await?;
        Ok(stored
            .into_iter()
            .map(|m| reveal_memory(self.envelope(), m))
            .collect())
    }

    async fn delete_memories(&self, selector: Selector<MemoryFilter>) -> Result<usize> {
        let filter = selector.filter();
        let query = memory_query(filter);
        let reveal_filter = self.needs_reveal_filter(query);

        let deleted = if reveal_filter {
            let mut tx = self.pool.begin().await?;
            let ids: Vec<String> = select_memories(&mut *tx, filter, false, " ORDER BY seq ASC", None)
                .await?
                .into_iter()
                .map(|m| reveal_memory(self.envelope(), m))
                .filter(|m| memory_matches_query(m, query))
                .map(|m| m.id)
                .collect();
            let result = sqlx::query("DELETE FROM memories WHERE id = ANY($1)")
                .bind(&ids)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            result.rows_affected() as usize
        } else {
            let mut qb = QueryBuilder::<Postgres>::new("DELETE FROM memories");
            push_memory_filter(&mut qb, filter, true);
            qb.build().execute(&self.pool).await?.rows_affected() as usize
        };

        tracing::info!("Deleted {} memories", deleted);
        Ok(deleted)
    }

    async fn update_memories(
        &self,
        selector: Selector<MemoryFilter>,
        patch: MemoryPatch,
    ) -> Result<usize> {
        let content = self.content_change(patch.content.as_ref()).await;
        let filter = selector.filter();
        let query = memory_query(filter);
        let reveal_filter = self.needs_reveal_filter(query);

        let mut tx = self.pool.begin().await?;
        if let Some(Some(cluster_id)) = &patch.cluster_id {
            if !cluster_exists(&mut *tx, cluster_id).await? {
                return Err(VaultError::not_found("cluster", cluster_id.clone()));
            }
        }

        let candidates =
            select_memories(&mut *tx, filter, !reveal_filter, " ORDER BY seq ASC", None).await?;
        let mut updated = 0;
        for mut stored in candidates {
            if reveal_filter {
                let revealed = reveal_memory(self.envelope(), stored.clone());
                if !memory_matches_query(&revealed, query) {
                    continue;
                }
            }
            patch_memory(&mut stored, &patch, content.as_ref(), self.envelope())?;
            updated += write_memory(&mut *tx, &stored).await?;
        }
        tx.commit().await?;
        Ok(updated)
    }

    // ========================================================================
    // Docs
    // ========================================================================

    async fn add_doc(&self, doc: NewDoc) -> Result<DocEntry> {
        let embedding = self.embeddings.embed_text(&doc.content).await;
        let plaintext = doc.content.clone();
        let stored = doc_record(doc, self.envelope(), embedding)?;

        sqlx::query(
            r#"INSERT INTO docs (id, url, title, content, tags, "timestamp", "lastFetched", "accessCount", metadata, embedding)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"#,
        )
        .bind(&stored.id)
        .bind(&stored.url)
        .bind(&stored.title)
        .bind(&stored.content)
        .bind(Json(&stored.tags))
        .bind(stored.timestamp)
        .bind(stored.last_fetched)
        .bind(stored.access_count)
        .bind(Json(&stored.metadata))
        .bind(stored.embedding.as_ref().map(Json))
        .execute(&self.pool)
        .await?;

        Ok(written_doc(stored, plaintext))
    }

    async fn search_docs(&self, query: DocQuery) -> Result<Vec<DocEntry>> {
        query.validate()?;
        let filter = query.as_filter();
        let reveal_filter = self.needs_reveal_filter(filter.query.as_deref());
        let order = order_by(query.sort_by.column(), query.sort_order.sql());
        let sql_limit = if reveal_filter { None } else { query.limit };

        let stored = select_docs(&self.pool, Some(&filter), !reveal_filter, &order, sql_limit).await?;

        let mut found: Vec<DocEntry> = stored
            .into_iter()
            .map(|d| reveal_doc(self.envelope(), d))
            .filter(|d| !reveal_filter || doc_matches_query(d, query.query.as_deref()))
            .collect();
        if let Some(limit) = query.limit {
            found.truncate(limit);
        }

        self.track_doc_access(&found);
        Ok(found)
    }

    async fn get_recent_docs(&self, limit: usize) -> Result<Vec<DocEntry>> {
        let limit = require_limit(limit)?;
        let stored =
            select_docs(&self.pool, None, true, &order_by("timestamp", "DESC"), Some(limit)).await?;
        Ok(stored.into_iter().map(|d| reveal_doc(self.envelope(), d)).collect())
    }

    async fn get_all_docs(&self) -> Result<Vec<DocEntry>> {
        let stored = select_docs(&self.pool, None, true, &order_by("timestamp", "ASC"), None).await?;
        Ok(stored.into_iter().map(|d| reveal_doc(self.envelope(), d)).collect())
    }

    async fn delete_docs(&self, selector: Selector<DocFilter>) -> Result<usize> {
        let filter = selector.filter();
        let query = doc_query(filter);
        let reveal_filter = self.needs_reveal_filter(query);

        let deleted = if reveal_filter {
            let mut tx = self.pool.begin().await?;
            let ids: Vec<String> = select_docs(&mut *tx, filter, false, " ORDER BY seq ASC", None)
                .await?
                .into_iter()
                .map(|d| reveal_doc(self.envelope(), d))
                .filter(|d| doc_matches_query(d, query))
                .map(|d| d.id)
                .collect();
            let result = sqlx::query("DELETE FROM docs WHERE id = ANY($1)")
                .bind(&ids)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            result.rows_affected() as usize
        } else {
            let mut qb = QueryBuilder::<Postgres>::new("DELETE FROM docs");
            push_doc_filter(&mut qb, filter, true);
            qb.build().execute(&self.pool).await?.rows_affected() as usize
        };

        tracing::info!("Deleted {} docs", deleted);
        Ok(deleted)
    }

    async fn update_docs(&self, selector: Selector<DocFilter>, patch: DocPatch) -> Result<usize> {
        let content = self.content_change(patch.content.as_ref()).await;
        let filter = selector.filter();
        let query = doc_query(filter);
        let reveal_filter = self.needs_reveal_filter(query);

        let mut tx = self.pool.begin().await?;
        let candidates =
            select_docs(&mut *tx, filter, !reveal_filter, " ORDER BY seq ASC", None).await?;
        let mut updated = 0;
        for mut stored in candidates {
            if reveal_filter {
                let revealed = reveal_doc(self.envelope(), stored.clone());
                if !doc_matches_query(&revealed, query) {
                    continue;
                }
            }
            patch_doc(&mut stored, &patch, content.as_ref(), self.envelope())?;
            updated += write_doc(&mut *tx, &stored).await?;
        }
        tx.commit().await?;
        Ok(updated)
    }

    // ========================================================================
    // Clusters and details
    // ========================================================================

    async fn create_cluster(&self, input: CreateClusterInput) -> Result<DetailsCluster> {
        input.validate()?;
        let now = now();
        let id = new_id();
        let details: Vec<ClusterDetail> = input
            .details
            .iter()
            .map(|d| ClusterDetail {
                id: new_id(),
                cluster_id: id.clone(),
                key: d.key.trim().to_string(),
                value: d.value.clone(),
                detail_type: d.detail_type,
                importance: d.importance(),
                created_at: now,
                updated_at: now,
            })
            .collect();
        let cluster = DetailsCluster {
            id,
            name: input.name.trim().to_string(),
            description: input.description,
            tags: normalize_tags(input.tags),
            created_at: now,
            updated_at: now,
            metadata: input.metadata,
            details,
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"INSERT INTO details_clusters (id, name, description, tags, "createdAt", "updatedAt", metadata)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(&cluster.id)
        .bind(&cluster.name)
        .bind(&cluster.description)
        .bind(Json(&cluster.tags))
        .bind(cluster.created_at)
        .bind(cluster.updated_at)
        .bind(Json(&cluster.metadata))
        .execute(&mut *tx)
        .await?;
        for detail in &cluster.details {
            insert_detail(&mut *tx, detail).await?;
        }
        tx.commit().await?;
        Ok(cluster)
    }

    async fn get_cluster(&self, id: &str) -> Result<Option<DetailsCluster>> {
        let row = sqlx::query_as::<_, ClusterRow>(&format!(
            "SELECT {} FROM details_clusters WHERE id = $1",
            CLUSTER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => {
                let mut cluster = DetailsCluster::from(row);
                cluster.details = self.load_details(&self.pool, &cluster.id).await?;
                Ok(Some(cluster))
            }
            None => Ok(None),
        }
    }

    async fn list_clusters(&self, query: ClusterQuery) -> Result<Vec<DetailsCluster>> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {} FROM details_clusters",
            CLUSTER_COLUMNS
        ));
        let mut first = true;
        if let Some(q) = &query.query {
            let pattern = format!("%{}%", escape_like(q));
            push_conjunction(&mut qb, &mut first);
            qb.push("(name ILIKE ")
                .push_bind(pattern.clone())
                .push(" OR description ILIKE ")
                .push_bind(pattern)
                .push(")");
        }
        if !query.tags.is_empty() {
            push_conjunction(&mut qb, &mut first);
            qb.push("tags ?| ").push_bind(query.tags.clone());
        }
        qb.push(order_by("updatedAt", "DESC"));
        if let Some(limit) = query.limit {
            qb.push(" LIMIT ").push_bind(require_limit(limit)? as i64);
        }

        let rows = qb
            .build_query_as::<ClusterRow>()
            .fetch_all(&self.pool)
            .await?;
        let mut clusters = Vec::with_capacity(rows.len());
        for row in rows {
            let mut cluster = DetailsCluster::from(row);
            cluster.details = self.load_details(&self.pool, &cluster.id).await?;
            clusters.push(cluster);
        }
        Ok(clusters)
    }

    async fn update_cluster(&self, id: &str, changes: ClusterChanges) -> Result<DetailsCluster> {
        changes.validate()?;
        let mut cluster = self
            .get_cluster(id)
            .await?
            .ok_or_else(|| VaultError::not_found("cluster", id))?;
        patch_cluster(&mut cluster, changes);
        sqlx::query(
            r#"UPDATE details_clusters
               SET name = $1, description = $2, tags = $3, "updatedAt" = $4, metadata = $5
               WHERE id = $6"#,
        )
        .bind(&cluster.name)
        .bind(&cluster.description)
        .bind(Json(&cluster.tags))
        .bind(cluster.updated_at)
        .bind(Json(&cluster.metadata))
        .bind(&cluster.id)
        .execute(&self.pool)
        .await?;
        Ok(cluster)
    }

    async fn delete_cluster(&self, id: &str) -> Result<ClusterDeletion> {
        let mut tx = self.pool.begin().await?;
        let detached = sqlx::query(r#"UPDATE memories SET "clusterId" = NULL WHERE "clusterId" = $1"#)
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected() as usize;
        let details = sqlx::query(r#"DELETE FROM cluster_details WHERE "clusterId" = $1"#)
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected() as usize;
        let deleted = sqlx::query("DELETE FROM details_clusters WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if deleted == 0 {
            tx.rollback().await?;
            return Err(VaultError::not_found("cluster", id));
        }
        tx.commit().await?;

        tracing::info!(
            "Deleted cluster {} ({} details removed, {} memories detached)",
            id,
            details,
            detached
        );
        Ok(ClusterDeletion {
            cluster_id: id.to_string(),
            detached_memories: detached,
            deleted_details: details,
        })
    }

    async fn add_cluster_detail(
        &self,
        cluster_id: &str,
        detail: DetailInput,
    ) -> Result<ClusterDetail> {
        detail.validate()?;
        let now = now();
        let detail = ClusterDetail {
            id: new_id(),
            cluster_id: cluster_id.to_string(),
            key: detail.key.trim().to_string(),
            value: detail.value.clone(),
            detail_type: detail.detail_type,
            importance: detail.importance(),
            created_at: now,
            updated_at: now,
        };

        let mut tx = self.pool.begin().await?;
        if !cluster_exists(&mut *tx, cluster_id).await? {
            return Err(VaultError::not_found("cluster", cluster_id));
        }
        insert_detail(&mut *tx, &detail).await?;
        touch_cluster(&mut *tx, cluster_id, detail.created_at).await?;
        tx.commit().await?;
        Ok(detail)
    }

    async fn update_cluster_detail(
        &self,
        detail_id: &str,
        changes: DetailChanges,
    ) -> Result<ClusterDetail> {
        changes.validate()?;
        let mut tx = self.pool.begin().await?;
        let mut detail = get_detail(&mut *tx, detail_id)
            .await?
            .ok_or_else(|| VaultError::not_found("cluster detail", detail_id))?;
        patch_detail(&mut detail, changes)?;
        sqlx::query(
            r#"UPDATE cluster_details
               SET key = $1, value = $2, "type" = $3, importance = $4, "updatedAt" = $5
               WHERE id = $6"#,
        )
        .bind(&detail.key)
        .bind(&detail.value)
        .bind(detail.detail_type.as_str())
        .bind(importance_column(detail.importance))
        .bind(detail.updated_at)
        .bind(&detail.id)
        .execute(&mut *tx)
        .await?;
        touch_cluster(&mut *tx, &detail.cluster_id, detail.updated_at).await?;
        tx.commit().await?;
        Ok(detail)
    }

    async fn delete_cluster_detail(&self, detail_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let detail = get_detail(&mut *tx, detail_id)
            .await?
            .ok_or_else(|| VaultError::not_found("cluster detail", detail_id))?;
        sqlx::query("DELETE FROM cluster_details WHERE id = $1")
            .bind(detail_id)
            .execute(&mut *tx)
            .await?;
        touch_cluster(&mut *tx, &detail.cluster_id, now()).await?;
        tx.commit().await?;
        Ok(())
    }

    // ========================================================================
    // Relationships
    // ========================================================================

    async fn link_memory_to_cluster(
        &self,
        memory_id: &str,
        cluster_id: &str,
    ) -> Result<MemoryEntry> {
        let mut tx = self.pool.begin().await?;
        let mut memory = get_memory(&mut *tx, memory_id)
            .await?
            .ok_or_else(|| VaultError::not_found("memory", memory_id))?;
        if !cluster_exists(&mut *tx, cluster_id).await? {
            return Err(VaultError::not_found("cluster", cluster_id));
        }
        sqlx::query(r#"UPDATE memories SET "clusterId" = $1 WHERE id = $2"#)
            .bind(cluster_id)
            .bind(memory_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        memory.cluster_id = Some(cluster_id.to_string());
        Ok(reveal_memory(self.envelope(), memory))
    }

    async fn unlink_memory_from_cluster(&self, memory_id: &str) -> Result<MemoryEntry> {
        let row = sqlx::query_as::<_, MemoryRow>(&format!(
            r#"UPDATE memories SET "clusterId" = NULL WHERE id = $1 RETURNING {}"#,
            MEMORY_COLUMNS
        ))
        .bind(memory_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| VaultError::not_found("memory", memory_id))?;
        Ok(reveal_memory(self.envelope(), MemoryEntry::from(row)))
    }

    async fn get_memories_by_cluster(&self, cluster_id: &str) -> Result<Vec<MemoryEntry>> {
        let rows = sqlx::query_as::<_, MemoryRow>(&format!(
            r#"SELECT {} FROM memories WHERE "clusterId" = $1 ORDER BY "timestamp" ASC, seq ASC"#,
            MEMORY_COLUMNS
        ))
        .bind(cluster_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| reveal_memory(self.envelope(), MemoryEntry::from(row)))
            .collect())
    }

    // ========================================================================
    // Statistics and similarity
    // ========================================================================

    async fn get_stats(&self) -> Result<StorageStats> {
        let tag_counts: HashMap<String, i64> = sqlx::query_as::<_, (String, i64)>(
            "SELECT tag, COUNT(*) FROM memories, jsonb_array_elements_text(tags) AS tag GROUP BY tag",
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .collect();

        let context_counts: HashMap<String, i64> = sqlx::query_as::<_, (String, i64)>(
            "SELECT context, COUNT(*) FROM memories GROUP BY context",
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .collect();

        let (oldest, newest): (Option<DateTime<Utc>>, Option<DateTime<Utc>>) =
            sqlx::query_as(r#"SELECT MIN("timestamp"), MAX("timestamp") FROM memories"#)
                .fetch_one(&self.pool)
                .await?;

        let sealed = |table: &str| {
            format!(
                "SELECT COUNT(*) FROM {} WHERE metadata->'{}' = 'true'::jsonb",
                table, ENCRYPTED_FLAG
            )
        };

        Ok(StorageStats {
            memory_count: self.count("SELECT COUNT(*) FROM memories").await?,
            doc_count: self.count("SELECT COUNT(*) FROM docs").await?,
            cluster_count: self.count("SELECT COUNT(*) FROM details_clusters").await?,
            detail_count: self.count("SELECT COUNT(*) FROM cluster_details").await?,
            linked_memories: self
                .count(r#"SELECT COUNT(*) FROM memories WHERE "clusterId" IS NOT NULL"#)
                .await?,
            encrypted_memories: self.count(&sealed("memories")).await?,
            encrypted_docs: self.count(&sealed("docs")).await?,
            memories_with_embedding: self
                .count("SELECT COUNT(*) FROM memories WHERE embedding IS NOT NULL")
                .await?,
            docs_with_embedding: self
                .count("SELECT COUNT(*) FROM docs WHERE embedding IS NOT NULL")
                .await?,
            tag_counts,
            context_counts,
            oldest_memory: oldest,
            newest_memory: newest,
        })
    }

    async fn semantic_search_memories(&self, query: SemanticQuery) -> Result<Vec<ScoredMemory>> {
        query.validate()?;
        let rows = sqlx::query_as::<_, MemoryRow>(&format!(
            "SELECT {} FROM memories WHERE embedding IS NOT NULL ORDER BY seq ASC",
            MEMORY_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        let candidates = rows
            .into_iter()
            .map(MemoryEntry::from)
            .filter_map(|m| m.embedding.clone().map(|v| (m, v)))
            .collect();
        Ok(
            rank_by_similarity(&query.vector, candidates, query.limit, query.min_score)
                .into_iter()
                .map(|(entry, score)| ScoredMemory {
                    entry: reveal_memory(self.envelope(), entry),
                    score,
                })
                .collect(),
        )
    }

    async fn semantic_search_docs(&self, query: SemanticQuery) -> Result<Vec<ScoredDoc>> {
        query.validate()?;
        let rows = sqlx::query_as::<_, DocRow>(&format!(
            "SELECT {} FROM docs WHERE embedding IS NOT NULL ORDER BY seq ASC",
            DOC_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        let candidates = rows
            .into_iter()
            .map(DocEntry::from)
            .filter_map(|d| d.embedding.clone().map(|v| (d, v)))
            .collect();
        Ok(
            rank_by_similarity(&query.vector, candidates, query.limit, query.min_score)
                .into_iter()
                .map(|(entry, score)| ScoredDoc {
                    entry: reveal_doc(self.envelope(), entry),
                    score,
                })
                .collect(),
        )
    }
}

#[async_trait]
impl MigrationTarget for PostgresBackend {
    async fn ensure_embedding_column(&self, table: EntityTable) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (
                SELECT 1 FROM information_schema.columns
                WHERE table_schema = current_schema() AND table_name = $1 AND column_name = 'embedding'
            )",
        )
        .bind(table.as_str())
        .fetch_one(&self.pool)
        .await?;
        if exists {
            return Ok(false);
        }
        sqlx::query(&format!(
            "ALTER TABLE {} ADD COLUMN IF NOT EXISTS embedding JSONB",
            table
        ))
        .execute(&self.pool)
        .await?;
        Ok(true)
    }

    async fn rows_missing_embedding(&self, table: EntityTable) -> Result<Vec<PendingRow>> {
        let rows = sqlx::query_as::<_, PendingRowPg>(&format!(
            "SELECT id, content, metadata FROM {} WHERE embedding IS NULL ORDER BY seq ASC",
            table
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| PendingRow {
                id: row.id,
                content: row.content,
                metadata: row.metadata.0,
            })
            .collect())
    }

    async fn write_embedding(
        &self,
        table: EntityTable,
        id: &str,
        embedding: &[f32],
    ) -> Result<()> {
        sqlx::query(&format!("UPDATE {} SET embedding = $1 WHERE id = $2", table))
            .bind(Json(embedding))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn rows_unsealed(&self, table: EntityTable) -> Result<Vec<PendingRow>> {
        let rows = sqlx::query_as::<_, PendingRowPg>(&format!(
            "SELECT id, content, metadata FROM {}
             WHERE metadata->'{}' IS DISTINCT FROM 'true'::jsonb
             ORDER BY seq ASC",
            table, ENCRYPTED_FLAG
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| PendingRow {
                id: row.id,
                content: row.content,
                metadata: row.metadata.0,
            })
            .collect())
    }

    async fn write_sealed(
        &self,
        table: EntityTable,
        id: &str,
        content: &str,
        metadata: &Metadata,
    ) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE {} SET content = $1, metadata = $2 WHERE id = $3",
            table
        ))
        .bind(content)
        .bind(Json(metadata))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
