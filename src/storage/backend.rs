//! Storage provider contract
//!
//! Every backend implements [`StorageProvider`]; the readiness gate and the
//! rest of the crate depend only on this trait. Backends that take part in
//! startup backfill also implement [`MigrationTarget`].
//!
//! Bulk updates and deletes take a [`Selector`], so a backend never has to
//! decide whether an empty filter means "everything": that decision is made
//! once, at the boundary, with an explicit force flag.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

use crate::error::{Result, VaultError};
use crate::types::{
    ClusterChanges, ClusterDeletion, ClusterDetail, ClusterQuery, CreateClusterInput,
    DetailChanges, DetailInput, DetailsCluster, DocEntry, DocFilter, DocPatch, DocQuery,
    MemoryEntry, MemoryFilter, MemoryPatch, MemoryQuery, Metadata, NewDoc, NewMemory,
    ScoredDoc, ScoredMemory, Selector, SemanticQuery,
};

/// What a backend can do beyond the required surface
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendCapabilities {
    /// `semantic_search_memories` / `semantic_search_docs` are implemented
    pub semantic_search: bool,
    /// Cluster deletion detaches memories and drops details atomically
    pub transactional_cluster_delete: bool,
    /// Searches bump access counters
    pub access_tracking: bool,
    /// A timed-out call is abandoned by the database, not just by the caller
    pub cancellable_calls: bool,
}

/// Static description of an opened backend
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageInfo {
    /// "sqlite" or "postgres"
    pub backend: String,
    /// File path or redacted connection URL
    pub location: String,
    /// e.g. "sqlite-wal", "sqlite-delete", "postgres"
    pub storage_mode: String,
    pub schema_version: i32,
    pub encryption_enabled: bool,
    pub embedding_model: Option<String>,
    pub db_size_bytes: Option<i64>,
    pub capabilities: BackendCapabilities,
}

/// Aggregate counts over the stored data
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    pub memory_count: i64,
    pub doc_count: i64,
    pub cluster_count: i64,
    pub detail_count: i64,
    /// Memories whose `clusterId` is set
    pub linked_memories: i64,
    pub encrypted_memories: i64,
    pub encrypted_docs: i64,
    pub memories_with_embedding: i64,
    pub docs_with_embedding: i64,
    /// Memories per tag
    pub tag_counts: HashMap<String, i64>,
    /// Memories per context
    pub context_counts: HashMap<String, i64>,
    pub oldest_memory: Option<DateTime<Utc>>,
    pub newest_memory: Option<DateTime<Utc>>,
}

/// The storage provider contract
///
/// Reads return plaintext: sealed content is opened before it leaves a
/// backend. Writes seal content first when encryption is configured.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Short backend identifier used in errors and logs
    fn backend_name(&self) -> &'static str;

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities::default()
    }

    /// The backfill surface, if this backend takes part in startup migration
    fn migration_target(&self) -> Option<&dyn MigrationTarget> {
        None
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Create tables and indexes. Idempotent, runs on every start.
    async fn initialize(&self) -> Result<()>;

    /// Flush and release resources
    async fn close(&self) -> Result<()>;

    async fn storage_info(&self) -> Result<StorageInfo>;

    // ========================================================================
    // Memories
    // ========================================================================

    async fn add_memory(&self, memory: NewMemory) -> Result<MemoryEntry>;

    /// Substring, tag, context and importance filtering, then sort, then limit.
    ///
    /// Returned rows get their access counters bumped in the background.
    async fn search_memories(&self, query: MemoryQuery) -> Result<Vec<MemoryEntry>>;

    /// Newest first
    async fn get_recent_memories(&self, limit: usize) -> Result<Vec<MemoryEntry>>;

    /// Oldest first, insertion order for equal timestamps
    async fn get_all_memories(&self) -> Result<Vec<MemoryEntry>>;

    /// Returns the number of deleted rows
    async fn delete_memories(&self, selector: Selector<MemoryFilter>) -> Result<usize>;

    /// Returns the number of updated rows
    async fn update_memories(
        &self,
        selector: Selector<MemoryFilter>,
        patch: MemoryPatch,
    ) -> Result<usize>;

    // ========================================================================
    // Docs
    // ========================================================================

    async fn add_doc(&self, doc: NewDoc) -> Result<DocEntry>;

    async fn search_docs(&self, query: DocQuery) -> Result<Vec<DocEntry>>;

    async fn get_recent_docs(&self, limit: usize) -> Result<Vec<DocEntry>>;

    async fn get_all_docs(&self) -> Result<Vec<DocEntry>>;

    async fn delete_docs(&self, selector: Selector<DocFilter>) -> Result<usize>;

    async fn update_docs(&self, selector: Selector<DocFilter>, patch: DocPatch) -> Result<usize>;

    // ========================================================================
    // Clusters and details
    // ========================================================================

    async fn create_cluster(&self, input: CreateClusterInput) -> Result<DetailsCluster>;

    /// The cluster with its details ordered by creation
    async fn get_cluster(&self, id: &str) -> Result<Option<DetailsCluster>>;

    async fn list_clusters(&self, query: ClusterQuery) -> Result<Vec<DetailsCluster>>;

    async fn update_cluster(&self, id: &str, changes: ClusterChanges) -> Result<DetailsCluster>;

    /// Detach referencing memories, drop the cluster's details and the cluster itself
    async fn delete_cluster(&self, id: &str) -> Result<ClusterDeletion>;

    async fn add_cluster_detail(
        &self,
        cluster_id: &str,
        detail: DetailInput,
    ) -> Result<ClusterDetail>;

    async fn update_cluster_detail(
        &self,
        detail_id: &str,
        changes: DetailChanges,
    ) -> Result<ClusterDetail>;

    async fn delete_cluster_detail(&self, detail_id: &str) -> Result<()>;

    // ========================================================================
    // Relationships
    // ========================================================================

    /// Point a memory at a cluster, replacing any previous link
    async fn link_memory_to_cluster(&self, memory_id: &str, cluster_id: &str)
        -> Result<MemoryEntry>;

    async fn unlink_memory_from_cluster(&self, memory_id: &str) -> Result<MemoryEntry>;

    async fn get_memories_by_cluster(&self, cluster_id: &str) -> Result<Vec<MemoryEntry>>;

    // ========================================================================
    // Statistics and similarity
    // ========================================================================

    async fn get_stats(&self) -> Result<StorageStats>;

    async fn semantic_search_memories(&self, _query: SemanticQuery) -> Result<Vec<ScoredMemory>> {
        Err(VaultError::NotImplemented {
            backend: self.backend_name(),
            operation: "semantic_search_memories",
        })
    }

    async fn semantic_search_docs(&self, _query: SemanticQuery) -> Result<Vec<ScoredDoc>> {
        Err(VaultError::NotImplemented {
            backend: self.backend_name(),
            operation: "semantic_search_docs",
        })
    }
}

/// Entity tables that carry content, embeddings and envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityTable {
    Memories,
    Docs,
}

impl EntityTable {
    pub const ALL: [EntityTable; 2] = [EntityTable::Memories, EntityTable::Docs];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityTable::Memories => "memories",
            EntityTable::Docs => "docs",
        }
    }
}

impl std::fmt::Display for EntityTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row as stored, before any decryption
#[derive(Debug, Clone)]
pub struct PendingRow {
    pub id: String,
    pub content: String,
    pub metadata: Metadata,
}

/// Per-row operations used by the backfill engine
#[async_trait]
pub trait MigrationTarget: Send + Sync {
    /// Add the nullable `embedding` column if missing. Returns true when it was added.
    async fn ensure_embedding_column(&self, table: EntityTable) -> Result<bool>;

    async fn rows_missing_embedding(&self, table: EntityTable) -> Result<Vec<PendingRow>>;

    async fn write_embedding(&self, table: EntityTable, id: &str, embedding: &[f32])
        -> Result<()>;

    /// Rows whose metadata does not carry a true encryption flag
    async fn rows_unsealed(&self, table: EntityTable) -> Result<Vec<PendingRow>>;

    /// Replace content and metadata of one row with their sealed form
    async fn write_sealed(
        &self,
        table: EntityTable,
        id: &str,
        content: &str,
        metadata: &Metadata,
    ) -> Result<()>;
}

/// Reject a zero limit on the list operations
pub(crate) fn require_limit(limit: usize) -> Result<usize> {
    if limit == 0 {
        return Err(VaultError::InvalidInput(
            "limit must be greater than zero".to_string(),
        ));
    }
    Ok(limit)
}
