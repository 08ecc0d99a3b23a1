//! SQLite implementation of the storage provider contract
//!
//! Wraps [`Storage`] and delegates to the functions in `queries.rs` and
//! `cluster_queries.rs`. Every call goes through [`Storage::call`], so calls
//! are serialized on the single connection and can be cancelled.

use async_trait::async_trait;
use std::sync::Arc;

use super::backend::{
    require_limit, BackendCapabilities, EntityTable, MigrationTarget, PendingRow, StorageInfo,
    StorageProvider, StorageStats,
};
use super::cluster_queries;
use super::connection::Storage;
use super::migrations::{self, run_migrations};
use super::queries;
use super::records::{
    doc_matches_query, doc_query, doc_record, format_ts, memory_matches_query, memory_query,
    memory_record, new_id, now, patch_cluster, patch_detail, patch_doc, patch_memory, reveal_doc,
    reveal_memory, written_doc, written_memory, ContentChange,
};
use crate::config::SqliteConfig;
use crate::crypto::EnvelopeService;
use crate::embedding::{rank_by_similarity, EmbeddingService};
use crate::error::{Result, VaultError};
use crate::types::{
    ClusterChanges, ClusterDeletion, ClusterDetail, ClusterQuery, CreateClusterInput,
    DetailChanges, DetailInput, DetailsCluster, DocEntry, DocFilter, DocPatch, DocQuery,
    MemoryEntry, MemoryFilter, MemoryPatch, MemoryQuery, Metadata, NewDoc, NewMemory, ScoredDoc,
    ScoredMemory, Selector, SemanticQuery,
};

/// SQLite-based storage backend
pub struct SqliteBackend {
    storage: Storage,
    envelope: Option<Arc<EnvelopeService>>,
    embeddings: Arc<EmbeddingService>,
}

impl SqliteBackend {
    /// Open the database file. Tables are created by [`StorageProvider::initialize`].
    pub fn open(
        config: SqliteConfig,
        envelope: Option<Arc<EnvelopeService>>,
        embeddings: Arc<EmbeddingService>,
    ) -> Result<Self> {
        Ok(Self {
            storage: Storage::open(config)?,
            envelope,
            embeddings,
        })
    }

    /// In-memory database (useful for testing)
    pub fn in_memory(
        envelope: Option<Arc<EnvelopeService>>,
        embeddings: Arc<EmbeddingService>,
    ) -> Result<Self> {
        Self::open(SqliteConfig::in_memory(), envelope, embeddings)
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    fn envelope(&self) -> Option<&EnvelopeService> {
        self.envelope.as_deref()
    }

    /// Sealed content can only be substring-matched after decryption
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

    fn track_memory_access(&self, found: &[MemoryEntry]) {
        if found.is_empty() {
            return;
        }
        let ids: Vec<String> = found.iter().map(|m| m.id.clone()).collect();
        let at = format_ts(&now());
        self.storage
            .spawn_detached("memory access tracking", move |conn| {
                queries::touch_memories(conn, &ids, &at)
            });
    }

    fn track_doc_access(&self, found: &[DocEntry]) {
        if found.is_empty() {
            return;
        }
        let ids: Vec<String> = found.iter().map(|d| d.id.clone()).collect();
        self.storage
            .spawn_detached("doc access tracking", move |conn| {
                queries::touch_docs(conn, &ids)
            });
    }
}

#[async_trait]
impl StorageProvider for SqliteBackend {
    fn backend_name(&self) -> &'static str {
        "sqlite"
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
        if let Some(warning) = self.storage.storage_mode_warning() {
            tracing::warn!("{}", warning);
        }
        self.storage.call(|conn| run_migrations(conn)).await?;
        tracing::info!(
            "SQLite backend ready at {} ({})",
            self.storage.db_path(),
            self.storage.mode_label()
        );
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.storage.checkpoint().await?;
        tracing::info!("SQLite backend closed");
        Ok(())
    }

    async fn storage_info(&self) -> Result<StorageInfo> {
        let schema_version = self
            .storage
            .call(|conn| migrations::schema_version(conn))
            .await?;
        let db_size_bytes = self.storage.db_size().await.ok();
        Ok(StorageInfo {
            backend: self.backend_name().to_string(),
            location: self.storage.db_path().to_string(),
            storage_mode: self.storage.mode_label().to_string(),
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

        let row = stored.clone();
        self.storage
            .call(move |conn| queries::insert_memory(conn, &row))
            .await?;

        Ok(written_memory(stored, plaintext))
    }

    async fn search_memories(&self, query: MemoryQuery) -> Result<Vec<MemoryEntry>> {
        query.validate()?;
        let filter = query.as_filter();
        let reveal_filter = self.needs_reveal_filter(filter.query.as_deref());
        let direction = query.sort_order.sql();
        let order = format!("{} {}, rowid {}", query.sort_by.column(), direction, direction);
        let sql_limit = if reveal_filter { None } else { query.limit };

        let stored = self
            .storage
            .call(move |conn| {
                queries::select_memories(conn, Some(&filter), !reveal_filter, &order, sql_limit)
            })
            .await?;

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
        let stored = self
            .storage
            .call(move |conn| {
                queries::select_memories(conn, None, true, "timestamp DESC, rowid DESC", Some(limit))
            })
            .await?;
        Ok(stored
            .into_iter()
            .map(|m| reveal_memory(self.envelope(), m))
            .collect())
    }

    async fn get_all_memories(&self) -> Result<Vec<MemoryEntry>> {
        let stored = self
            .storage
            .call(|conn| {
                queries::select_memories(conn, None, true, "timestamp ASC, rowid ASC", None)
            })
            .await?;
        Ok(stored
            .into_iter()
            .map(|m| reveal_memory(self.envelope(), m))
            .collect())
    }

    async fn delete_memories(&self, selector: Selector<MemoryFilter>) -> Result<usize> {
        let filter = selector.filter().cloned();
        let reveal_filter = self.needs_reveal_filter(memory_query(filter.as_ref()));
        let envelope = self.envelope.clone();

        let deleted = self
            .storage
            .call(move |conn| {
                if !reveal_filter {
                    return queries::delete_memories(conn, filter.as_ref());
                }
                let tx = conn.transaction()?;
                let query = memory_query(filter.as_ref());
                let ids: Vec<String> =
                    queries::select_memories(&tx, filter.as_ref(), false, "rowid ASC", None)?
                        .into_iter()
                        .map(|m| reveal_memory(envelope.as_deref(), m))
                        .filter(|m| memory_matches_query(m, query))
                        .map(|m| m.id)
                        .collect();
                let deleted = queries::delete_by_ids(&tx, EntityTable::Memories, &ids)?;
                tx.commit()?;
                Ok(deleted)
            })
            .await?;

        tracing::info!("Deleted {} memories", deleted);
        Ok(deleted)
    }

    async fn update_memories(
        &self,
        selector: Selector<MemoryFilter>,
        patch: MemoryPatch,
    ) -> Result<usize> {
        let content = self.content_change(patch.content.as_ref()).await;
        let filter = selector.filter().cloned();
        let reveal_filter = self.needs_reveal_filter(memory_query(filter.as_ref()));
        let envelope = self.envelope.clone();

        self.storage
            .call(move |conn| {
                let tx = conn.transaction()?;
                if let Some(Some(cluster_id)) = &patch.cluster_id {
                    if !cluster_queries::cluster_exists(&tx, cluster_id)? {
                        return Err(VaultError::not_found("cluster", cluster_id.clone()));
                    }
                }

                let query = memory_query(filter.as_ref());
                let candidates = queries::select_memories(
                    &tx,
                    filter.as_ref(),
                    !reveal_filter,
                    "rowid ASC",
                    None,
                )?;
                let mut updated = 0;
                for mut stored in candidates {
                    if reveal_filter {
                        let revealed = reveal_memory(envelope.as_deref(), stored.clone());
                        if !memory_matches_query(&revealed, query) {
                            continue;
                        }
                    }
                    patch_memory(&mut stored, &patch, content.as_ref(), envelope.as_deref())?;
                    updated += queries::write_memory(&tx, &stored)?;
                }
                tx.commit()?;
                Ok(updated)
            })
            .await
    }

    // ========================================================================
    // Docs
    // ========================================================================

    async fn add_doc(&self, doc: NewDoc) -> Result<DocEntry> {
        let embedding = self.embeddings.embed_text(&doc.content).await;
        let plaintext = doc.content.clone();
        let stored = doc_record(doc, self.envelope(), embedding)?;

        let row = stored.clone();
        self.storage
            .call(move |conn| queries::insert_doc(conn, &row))
            .await?;

        Ok(written_doc(stored, plaintext))
    }

    async fn search_docs(&self, query: DocQuery) -> Result<Vec<DocEntry>> {
        query.validate()?;
        let filter = query.as_filter();
        let reveal_filter = self.needs_reveal_filter(filter.query.as_deref());
        let direction = query.sort_order.sql();
        let order = format!("{} {}, rowid {}", query.sort_by.column(), direction, direction);
        let sql_limit = if reveal_filter { None } else { query.limit };

        let stored = self
            .storage
            .call(move |conn| {
                queries::select_docs(conn, Some(&filter), !reveal_filter, &order, sql_limit)
            })
            .await?;

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
        let stored = self
            .storage
            .call(move |conn| {
                queries::select_docs(conn, None, true, "timestamp DESC, rowid DESC", Some(limit))
            })
            .await?;
        Ok(stored.into_iter().map(|d| reveal_doc(self.envelope(), d)).collect())
    }

    async fn get_all_docs(&self) -> Result<Vec<DocEntry>> {
        let stored = self
            .storage
            .call(|conn| queries::select_docs(conn, None, true, "timestamp ASC, rowid ASC", None))
            .await?;
        Ok(stored.into_iter().map(|d| reveal_doc(self.envelope(), d)).collect())
    }

    async fn delete_docs(&self, selector: Selector<DocFilter>) -> Result<usize> {
        let filter = selector.filter().cloned();
        let reveal_filter = self.needs_reveal_filter(doc_query(filter.as_ref()));
        let envelope = self.envelope.clone();

        let deleted = self
            .storage
            .call(move |conn| {
                if !reveal_filter {
                    return queries::delete_docs(conn, filter.as_ref());
                }
                let tx = conn.transaction()?;
                let query = doc_query(filter.as_ref());
                let ids: Vec<String> =
                    queries::select_docs(&tx, filter.as_ref(), false, "rowid ASC", None)?
                        .into_iter()
                        .map(|d| reveal_doc(envelope.as_deref(), d))
                        .filter(|d| doc_matches_query(d, query))
                        .map(|d| d.id)
                        .collect();
                let deleted = queries::delete_by_ids(&tx, EntityTable::Docs, &ids)?;
                tx.commit()?;
                Ok(deleted)
            })
            .await?;

        tracing::info!("Deleted {} docs", deleted);
        Ok(deleted)
    }

    async fn update_docs(&self, selector: Selector<DocFilter>, patch: DocPatch) -> Result<usize> {
        let content = self.content_change(patch.content.as_ref()).await;
        let filter = selector.filter().cloned();
        let reveal_filter = self.needs_reveal_filter(doc_query(filter.as_ref()));
        let envelope = self.envelope.clone();

        self.storage
            .call(move |conn| {
                let tx = conn.transaction()?;
                let query = doc_query(filter.as_ref());
                let candidates =
                    queries::select_docs(&tx, filter.as_ref(), !reveal_filter, "rowid ASC", None)?;
                let mut updated = 0;
                for mut stored in candidates {
                    if reveal_filter {
                        let revealed = reveal_doc(envelope.as_deref(), stored.clone());
                        if !doc_matches_query(&revealed, query) {
                            continue;
                        }
                    }
                    patch_doc(&mut stored, &patch, content.as_ref(), envelope.as_deref())?;
                    updated += queries::write_doc(&tx, &stored)?;
                }
                tx.commit()?;
                Ok(updated)
            })
            .await
    }

    // ========================================================================
    // Clusters and details
    // ========================================================================

    async fn create_cluster(&self, input: CreateClusterInput) -> Result<DetailsCluster> {
        input.validate()?;
        let now = now();
        let id = new_id();
        let details = input
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
            tags: crate::types::normalize_tags(input.tags),
            created_at: now,
            updated_at: now,
            metadata: input.metadata,
            details,
        };

        let row = cluster.clone();
        self.storage
            .call(move |conn| cluster_queries::insert_cluster(conn, &row))
            .await?;
        Ok(cluster)
    }

    async fn get_cluster(&self, id: &str) -> Result<Option<DetailsCluster>> {
        let id = id.to_string();
        self.storage
            .call(move |conn| cluster_queries::get_cluster(conn, &id))
            .await
    }

    async fn list_clusters(&self, query: ClusterQuery) -> Result<Vec<DetailsCluster>> {
        if let Some(limit) = query.limit {
            require_limit(limit)?;
        }
        self.storage
            .call(move |conn| cluster_queries::list_clusters(conn, &query))
            .await
    }

    async fn update_cluster(&self, id: &str, changes: ClusterChanges) -> Result<DetailsCluster> {
        changes.validate()?;
        let id = id.to_string();
        self.storage
            .call(move |conn| {
                let mut cluster = cluster_queries::get_cluster(conn, &id)?
                    .ok_or_else(|| VaultError::not_found("cluster", id))?;
                patch_cluster(&mut cluster, changes);
                cluster_queries::write_cluster(conn, &cluster)?;
                Ok(cluster)
            })
            .await
    }

    async fn delete_cluster(&self, id: &str) -> Result<ClusterDeletion> {
        let id = id.to_string();
        let deletion = self
            .storage
            .call(move |conn| cluster_queries::delete_cluster(conn, &id))
            .await?;
        tracing::info!(
            "Deleted cluster {} ({} details removed, {} memories detached)",
            deletion.cluster_id,
            deletion.deleted_details,
            deletion.detached_memories
        );
        Ok(deletion)
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

        let row = detail.clone();
        self.storage
            .call(move |conn| {
                let tx = conn.transaction()?;
                if !cluster_queries::cluster_exists(&tx, &row.cluster_id)? {
                    return Err(VaultError::not_found("cluster", row.cluster_id.clone()));
                }
                cluster_queries::insert_detail(&tx, &row)?;
                cluster_queries::touch_cluster(&tx, &row.cluster_id, &format_ts(&row.created_at))?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(detail)
    }

    async fn update_cluster_detail(
        &self,
        detail_id: &str,
        changes: DetailChanges,
    ) -> Result<ClusterDetail> {
        changes.validate()?;
        let detail_id = detail_id.to_string();
        self.storage
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut detail = cluster_queries::get_detail(&tx, &detail_id)?
                    .ok_or_else(|| VaultError::not_found("cluster detail", detail_id))?;
                patch_detail(&mut detail, changes)?;
                cluster_queries::write_detail(&tx, &detail)?;
                cluster_queries::touch_cluster(
                    &tx,
                    &detail.cluster_id,
                    &format_ts(&detail.updated_at),
                )?;
                tx.commit()?;
                Ok(detail)
            })
            .await
    }

    async fn delete_cluster_detail(&self, detail_id: &str) -> Result<()> {
        let detail_id = detail_id.to_string();
        self.storage
            .call(move |conn| {
                let tx = conn.transaction()?;
                let detail = cluster_queries::get_detail(&tx, &detail_id)?
                    .ok_or_else(|| VaultError::not_found("cluster detail", detail_id.clone()))?;
                cluster_queries::delete_detail(&tx, &detail_id)?;
                cluster_queries::touch_cluster(&tx, &detail.cluster_id, &format_ts(&now()))?;
                tx.commit()?;
                Ok(())
            })
            .await
    }

    // ========================================================================
    // Relationships
    // ========================================================================

    async fn link_memory_to_cluster(
        &self,
        memory_id: &str,
        cluster_id: &str,
    ) -> Result<MemoryEntry> {
        let memory_id = memory_id.to_string();
        let cluster_id = cluster_id.to_string();
        let stored = self
            .storage
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut memory = queries::get_memory(&tx, &memory_id)?
                    .ok_or_else(|| VaultError::not_found("memory", memory_id.clone()))?;
                if !cluster_queries::cluster_exists(&tx, &cluster_id)? {
                    return Err(VaultError::not_found("cluster", cluster_id));
                }
                queries::set_memory_cluster(&tx, &memory_id, Some(&cluster_id))?;
                tx.commit()?;
                memory.cluster_id = Some(cluster_id);
                Ok(memory)
            })
            .await?;
        Ok(reveal_memory(self.envelope(), stored))
    }

    async fn unlink_memory_from_cluster(&self, memory_id: &str) -> Result<MemoryEntry> {
        let memory_id = memory_id.to_string();
        let stored = self
            .storage
            .call(move |conn| {
                if queries::set_memory_cluster(conn, &memory_id, None)? == 0 {
                    return Err(VaultError::not_found("memory", memory_id));
                }
                queries::get_memory(conn, &memory_id)?
                    .ok_or_else(|| VaultError::not_found("memory", memory_id))
            })
            .await?;
        Ok(reveal_memory(self.envelope(), stored))
    }

    async fn get_memories_by_cluster(&self, cluster_id: &str) -> Result<Vec<MemoryEntry>> {
        let cluster_id = cluster_id.to_string();
        let stored = self
            .storage
            .call(move |conn| queries::memories_by_cluster(conn, &cluster_id))
            .await?;
        Ok(stored
            .into_iter()
            .map(|m| reveal_memory(self.envelope(), m))
            .collect())
    }

    // ========================================================================
    // Statistics and similarity
    // ========================================================================

    async fn get_stats(&self) -> Result<StorageStats> {
        self.storage.call(|conn| queries::stats(conn)).await
    }

    async fn semantic_search_memories(&self, query: SemanticQuery) -> Result<Vec<ScoredMemory>> {
        query.validate()?;
        let stored = self
            .storage
            .call(|conn| queries::select_memories(conn, None, true, "rowid ASC", None))
            .await?;
        let candidates = stored
            .into_iter()
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
        let stored = self
            .storage
            .call(|conn| queries::select_docs(conn, None, true, "rowid ASC", None))
            .await?;
        let candidates = stored
            .into_iter()
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
impl MigrationTarget for SqliteBackend {
    async fn ensure_embedding_column(&self, table: EntityTable) -> Result<bool> {
        self.storage
            .call(move |conn| migrations::ensure_column(conn, table.as_str(), "embedding", "TEXT"))
            .await
    }

    async fn rows_missing_embedding(&self, table: EntityTable) -> Result<Vec<PendingRow>> {
        self.storage
            .call(move |conn| queries::rows_missing_embedding(conn, table))
            .await
    }

    async fn write_embedding(
        &self,
        table: EntityTable,
        id: &str,
        embedding: &[f32],
    ) -> Result<()> {
        let id = id.to_string();
        let embedding = embedding.to_vec();
        self.storage
            .call(move |conn| queries::write_embedding(conn, table, &id, &embedding))
            .await
    }

    async fn rows_unsealed(&self, table: EntityTable) -> Result<Vec<PendingRow>> {
        self.storage
            .call(move |conn| queries::rows_unsealed(conn, table))
            .await
    }

    async fn write_sealed(
        &self,
        table: EntityTable,
        id: &str,
        content: &str,
        metadata: &Metadata,
    ) -> Result<()> {
        let id = id.to_string();
        let content = content.to_string();
        let metadata = metadata.clone();
        self.storage
            .call(move |conn| queries::write_sealed(conn, table, &id, &content, &metadata))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::types::{AddMemoryInput, MemoryChanges};

    async fn backend(encrypted: bool) -> SqliteBackend {
        let envelope = encrypted.then(|| Arc::new(EnvelopeService::new(KeyPair::generate())));
        let backend =
            SqliteBackend::in_memory(envelope, Arc::new(EmbeddingService::disabled())).unwrap();
        backend.initialize().await.unwrap();
        backend
    }

    fn memory(content: &str, tags: &[&str]) -> NewMemory {
        NewMemory::try_from(AddMemoryInput {
            content: content.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_search_sorts_then_limits() {
        let backend = backend(false).await;
        for (content, importance) in [("alpha note", 3), ("beta note", 9), ("gamma note", 6)] {
            let mut m = memory(content, &[]);
            m.importance = crate::types::Importance::new(importance).unwrap();
            backend.add_memory(m).await.unwrap();
        }

        let found = backend
            .search_memories(MemoryQuery {
                query: Some("note".into()),
                sort_by: crate::types::MemorySortField::Importance,
                limit: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        let contents: Vec<_> = found.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["beta note", "gamma note"]);
    }

    #[tokio::test]
    async fn test_encrypted_search_matches_plaintext() {
        let backend = backend(true).await;
        backend.add_memory(memory("the launch code is blue", &[])).await.unwrap();
        backend.add_memory(memory("unrelated", &[])).await.unwrap();

        let found = backend
            .search_memories(MemoryQuery {
                query: Some("LAUNCH".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].content, "the launch code is blue");
        assert!(found[0].is_encrypted());
    }

    #[tokio::test]
    async fn test_encrypted_update_by_query() {
        let backend = backend(true).await;
        backend.add_memory(memory("draft: plan", &[])).await.unwrap();
        backend.add_memory(memory("final", &[])).await.unwrap();

        let selector = Selector::new(
            MemoryFilter {
                query: Some("draft".into()),
                ..Default::default()
            },
            false,
            "update_memories",
        )
        .unwrap();
        let patch = MemoryPatch::try_from(MemoryChanges {
            content: Some("reviewed: plan".into()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(backend.update_memories(selector, patch).await.unwrap(), 1);

        let all = backend.get_all_memories().await.unwrap();
        assert_eq!(all[0].content, "reviewed: plan");
        assert_eq!(all[1].content, "final");
    }

    #[tokio::test]
    async fn test_update_rejects_unknown_cluster() {
        let backend = backend(false).await;
        let m = backend.add_memory(memory("x", &[])).await.unwrap();
        let selector = Selector::new(
            MemoryFilter {
                id: Some(m.id),
                ..Default::default()
            },
            false,
            "update_memories",
        )
        .unwrap();
        let patch = MemoryPatch::try_from(MemoryChanges {
            cluster_id: Some(Some("ghost".into())),
            ..Default::default()
        })
        .unwrap();
        let err = backend.update_memories(selector, patch).await.unwrap_err();
        assert!(matches!(err, VaultError::NotFound { entity: "cluster", .. }));
    }

    #[tokio::test]
    async fn test_detail_changes_refresh_cluster() {
        let backend = backend(false).await;
        let cluster = backend
            .create_cluster(CreateClusterInput {
                name: "Trip".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let detail = backend
            .add_cluster_detail(
                &cluster.id,
                DetailInput {
                    key: "hotel".into(),
                    value: "Grand".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let refreshed = backend.get_cluster(&cluster.id).await.unwrap().unwrap();
        assert!(refreshed.updated_at > cluster.updated_at);
        assert_eq!(refreshed.details, vec![detail.clone()]);

        backend.delete_cluster_detail(&detail.id).await.unwrap();
        let err = backend.delete_cluster_detail(&detail.id).await.unwrap_err();
        assert!(matches!(err, VaultError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_semantic_search_ranks_by_similarity() {
        let embeddings = Arc::new(EmbeddingService::new(crate::config::EmbeddingConfig::default()));
        let backend = SqliteBackend::in_memory(None, embeddings.clone()).unwrap();
        backend.initialize().await.unwrap();
        backend.add_memory(memory("rust borrow checker lifetimes", &[])).await.unwrap();
        backend.add_memory(memory("banana bread recipe", &[])).await.unwrap();

        let vector = embeddings.embed_text("rust lifetimes").await.unwrap();
        let found = backend
            .semantic_search_memories(SemanticQuery::new(vector, 1))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].entry.content, "rust borrow checker lifetimes");
    }
}
