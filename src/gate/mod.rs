//! Readiness gate in front of the storage backend
//!
//! [`VaultStore`] is the entry point a service talks to. It owns the backend
//! and moves forward through three states:
//!
//! - **Uninitialized / Initializing**: `add_memory` is validated and appended
//!   to the write-ahead log, everything else waits up to `ready_wait` and then
//!   fails with [`VaultError::NotReady`].
//! - **Ready**: every call goes straight to the backend.
//!
//! The switch to Ready happens inside the drain, while the log lock is held,
//! so a write racing the drain either lands in the log before it is replayed
//! or waits and goes to the backend afterwards.

pub mod wal;

use chrono::Utc;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Mutex};

use crate::config::{expand_path, BackendConfig, QueueConfig, VaultConfig};
use crate::crypto::EnvelopeService;
use crate::embedding::EmbeddingService;
use crate::error::{Result, VaultError};
use crate::storage::{
    run_backfill, BackfillReport, SqliteBackend, StorageInfo, StorageProvider, StorageStats,
};
use crate::types::{
    AddDocInput, AddMemoryInput, AddMemoryOutcome, ClusterChanges, ClusterDeletion,
    ClusterDetail, ClusterQuery, CreateClusterInput, DeleteDocsInput, DeleteMemoriesInput,
    DetailChanges, DetailInput, DetailsCluster, DocEntry, DocPatch, DocQuery, MemoryEntry,
    MemoryPatch, MemoryQuery, NewDoc, NewMemory, ScoredDoc, ScoredMemory, Selector,
    SemanticQuery, UpdateDocsInput, UpdateMemoriesInput,
};
use wal::{LogLine, WriteAheadLog};

/// Lifecycle of the store, forward-only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadinessState {
    Uninitialized,
    Initializing,
    Ready,
}

/// Outcome of replaying the write-ahead log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub applied: usize,
    pub skipped: usize,
}

/// Gated front door to a storage backend
pub struct VaultStore {
    backend: Arc<dyn StorageProvider>,
    embeddings: Arc<EmbeddingService>,
    envelope: Option<Arc<EnvelopeService>>,
    queue: QueueConfig,
    state: watch::Sender<ReadinessState>,
    wal: Mutex<WriteAheadLog>,
    draining: AtomicBool,
}

/// Construct the backend selected by `config`
pub fn build_backend(
    config: &BackendConfig,
    envelope: Option<Arc<EnvelopeService>>,
    embeddings: Arc<EmbeddingService>,
) -> Result<Arc<dyn StorageProvider>> {
    match config {
        BackendConfig::Sqlite(sqlite) => Ok(Arc::new(SqliteBackend::open(
            sqlite.clone(),
            envelope,
            embeddings,
        )?)),
        #[cfg(feature = "postgres")]
        BackendConfig::Postgres(postgres) => Ok(Arc::new(
            crate::storage::PostgresBackend::connect(postgres.clone(), envelope, embeddings)?,
        )),
        #[cfg(not(feature = "postgres"))]
        BackendConfig::Postgres(_) => Err(VaultError::Config(
            "PostgreSQL backend requires the 'postgres' feature to be enabled".to_string(),
        )),
    }
}

impl VaultStore {
    /// Wrap an already constructed backend. The store starts uninitialized.
    pub fn new(
        backend: Arc<dyn StorageProvider>,
        embeddings: Arc<EmbeddingService>,
        envelope: Option<Arc<EnvelopeService>>,
        queue: QueueConfig,
    ) -> Self {
        let wal = WriteAheadLog::new(expand_path(&queue.wal_path));
        let (state, _) = watch::channel(ReadinessState::Uninitialized);
        Self {
            backend,
            embeddings,
            envelope,
            queue,
            state,
            wal: Mutex::new(wal),
            draining: AtomicBool::new(false),
        }
    }

    /// Build services and backend from configuration, without touching storage yet
    pub fn open(config: VaultConfig) -> Result<Self> {
        let envelope = if config.encryption.enabled {
            let key_dir = expand_path(&config.encryption.key_dir);
            tracing::info!("At-rest encryption enabled (keys in {})", key_dir.display());
            Some(Arc::new(EnvelopeService::from_key_dir(&key_dir)?))
        } else {
            None
        };
        let embeddings = Arc::new(EmbeddingService::new(config.embedding));
        let backend = build_backend(&config.backend, envelope.clone(), embeddings.clone())?;
        Ok(Self::new(backend, embeddings, envelope, config.queue))
    }

    /// Open, initialize and drain: the store is Ready when this returns
    pub async fn bootstrap(config: VaultConfig) -> Result<(Arc<Self>, BackfillReport)> {
        let store = Arc::new(Self::open(config)?);
        let report = store.initialize().await?;
        Ok((store, report))
    }

    /// Initialize in the background; writes are queued meanwhile
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<Result<BackfillReport>> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let result = store.initialize().await;
            if let Err(e) = &result {
                tracing::error!("Storage initialization failed: {}", e);
            }
            result
        })
    }

    /// Create tables, backfill, drain the log, then open the gate
    pub async fn initialize(&self) -> Result<BackfillReport> {
        let started = self.state.send_if_modified(|state| {
            if *state == ReadinessState::Uninitialized {
                *state = ReadinessState::Initializing;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(VaultError::Storage(
                "store is already initializing or ready".to_string(),
            ));
        }

        tracing::info!("Initializing {} backend", self.backend.backend_name());
        self.backend.initialize().await?;

        let report = match self.backend.migration_target() {
            Some(target) => {
                run_backfill(target, &self.embeddings, self.envelope.as_deref()).await?
            }
            None => BackfillReport::default(),
        };

        self.drain().await?;
        Ok(report)
    }

    pub fn state(&self) -> ReadinessState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ReadinessState::Ready
    }

    /// Observe state transitions
    pub fn subscribe(&self) -> watch::Receiver<ReadinessState> {
        self.state.subscribe()
    }

    pub fn backend(&self) -> &Arc<dyn StorageProvider> {
        &self.backend
    }

    pub fn wal_path(&self) -> std::path::PathBuf {
        expand_path(&self.queue.wal_path)
    }

    /// Replay the write-ahead log in file order, truncate it, and switch to Ready.
    ///
    /// Lines that cannot be parsed, validated or applied are logged and
    /// skipped. Lines the backend rejected are copied to the rejected-lines
    /// file next to the log before it is truncated.
    pub async fn drain(&self) -> Result<DrainReport> {
        if self.draining.swap(true, Ordering::SeqCst) {
            tracing::debug!("Drain already in progress");
            return Ok(DrainReport::default());
        }
        let result = self.drain_locked().await;
        self.draining.store(false, Ordering::SeqCst);
        result
    }

    async fn drain_locked(&self) -> Result<DrainReport> {
        let wal = self.wal.lock().await;
        let lines = wal.read_lines().await?;
        let mut report = DrainReport::default();

        for (index, raw) in lines.iter().enumerate() {
            let memory = match LogLine::parse(raw)
                .and_then(LogLine::into_add_memory)
                .and_then(NewMemory::try_from)
            {
                Ok(memory) => memory,
                Err(e) => {
                    tracing::warn!("Skipping queued line {}: {}", index + 1, e);
                    report.skipped += 1;
                    continue;
                }
            };

            match self
                .timed("add_memory", self.backend.add_memory(memory))
                .await
            {
                Ok(_) => report.applied += 1,
                Err(e) => {
                    tracing::error!("Queued line {} was not applied: {}", index + 1, e);
                    if let Err(e) = wal.reject(raw).await {
                        tracing::warn!("Could not keep rejected line {}: {}", index + 1, e);
                    }
                    report.skipped += 1;
                }
            }
        }

        wal.truncate().await?;
        self.state.send_replace(ReadinessState::Ready);
        drop(wal);

        tracing::info!(
            "Storage ready: replayed {} queued writes ({} skipped)",
            report.applied,
            report.skipped
        );
        Ok(report)
    }

    /// Wait for Ready, re-checking at the poll interval until `ready_wait` elapses
    async fn wait_ready(&self) -> Result<()> {
        let mut rx = self.state.subscribe();
        let started = Instant::now();
        let deadline = self.queue.ready_wait();
        loop {
            if *rx.borrow_and_update() == ReadinessState::Ready {
                return Ok(());
            }
            let waited = started.elapsed();
            if waited >= deadline {
                return Err(VaultError::NotReady {
                    waited_ms: waited.as_millis() as u64,
                });
            }
            let slice = (deadline - waited).min(self.queue.poll_interval());
            let _ = tokio::time::timeout(slice, rx.changed()).await;
        }
    }

    /// Bound a backend call by `op_timeout`. Dropping the call cancels it.
    async fn timed<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let limit = self.queue.op_timeout();
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("{} timed out after {:?}", operation, limit);
                Err(VaultError::Timeout {
                    operation,
                    after_ms: limit.as_millis() as u64,
                })
            }
        }
    }

    async fn forward<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        self.wait_ready().await?;
        self.timed(operation, call).await
    }

    // ========================================================================
    // Memories
    // ========================================================================

    /// Store a memory, or queue it while the backend is starting
    pub async fn add_memory(&self, input: AddMemoryInput) -> Result<AddMemoryOutcome> {
        let memory = NewMemory::try_from(input.clone())?;
        if !self.is_ready() {
            let wal = self.wal.lock().await;
            // The drain flips to Ready while holding this lock
            if !self.is_ready() {
                let queued_at = Utc::now();
                wal.append(&LogLine::add_memory(queued_at, &input)?).await?;
                tracing::debug!("Queued add_memory at {}", queued_at);
                return Ok(AddMemoryOutcome::Queued { queued_at });
            }
        }
        let stored = self
            .timed("add_memory", self.backend.add_memory(memory))
            .await?;
        Ok(AddMemoryOutcome::Stored(stored))
    }

    pub async fn search_memories(&self, query: MemoryQuery) -> Result<Vec<MemoryEntry>> {
        self.forward("search_memories", self.backend.search_memories(query))
            .await
    }

    pub async fn get_recent_memories(&self, limit: usize) -> Result<Vec<MemoryEntry>> {
        self.forward("get_recent_memories", self.backend.get_recent_memories(limit))
            .await
    }

    pub async fn get_all_memories(&self) -> Result<Vec<MemoryEntry>> {
        self.forward("get_all_memories", self.backend.get_all_memories())
            .await
    }

    pub async fn delete_memories(&self, input: DeleteMemoriesInput) -> Result<usize> {
        let selector = Selector::new(input.filter, input.force, "delete_memories")?;
        self.forward("delete_memories", self.backend.delete_memories(selector))
            .await
    }

    pub async fn update_memories(&self, input: UpdateMemoriesInput) -> Result<usize> {
        let patch = MemoryPatch::try_from(input.changes)?;
        let selector = Selector::new(input.filter, input.force, "update_memories")?;
        self.forward("update_memories", self.backend.update_memories(selector, patch))
            .await
    }

    // ========================================================================
    // Docs
    // ========================================================================

    pub async fn add_doc(&self, input: AddDocInput) -> Result<DocEntry> {
        let doc = NewDoc::try_from(input)?;
        self.forward("add_doc", self.backend.add_doc(doc)).await
    }

    pub async fn search_docs(&self, query: DocQuery) -> Result<Vec<DocEntry>> {
        self.forward("search_docs", self.backend.search_docs(query))
            .await
    }

    pub async fn get_recent_docs(&self, limit: usize) -> Result<Vec<DocEntry>> {
        self.forward("get_recent_docs", self.backend.get_recent_docs(limit))
            .await
    }

    pub async fn get_all_docs(&self) -> Result<Vec<DocEntry>> {
        self.forward("get_all_docs", self.backend.get_all_docs()).await
    }

    pub async fn delete_docs(&self, input: DeleteDocsInput) -> Result<usize> {
        let selector = Selector::new(input.filter, input.force, "delete_docs")?;
        self.forward("delete_docs", self.backend.delete_docs(selector))
            .await
    }

    pub async fn update_docs(&self, input: UpdateDocsInput) -> Result<usize> {
        let patch = DocPatch::try_from(input.changes)?;
        let selector = Selector::new(input.filter, input.force, "update_docs")?;
        self.forward("update_docs", self.backend.update_docs(selector, patch))
            .await
    }

    // ========================================================================
    // Clusters and relationships
    // ========================================================================

    pub async fn create_cluster(&self, input: CreateClusterInput) -> Result<DetailsCluster> {
        self.forward("create_cluster", self.backend.create_cluster(input))
            .await
    }

    pub async fn get_cluster(&self, id: &str) -> Result<Option<DetailsCluster>> {
        self.forward("get_cluster", self.backend.get_cluster(id)).await
    }

    pub async fn list_clusters(&self, query: ClusterQuery) -> Result<Vec<DetailsCluster>> {
        self.forward("list_clusters", self.backend.list_clusters(query))
            .await
    }

    pub async fn update_cluster(&self, id: &str, changes: ClusterChanges) -> Result<DetailsCluster> {
        self.forward("update_cluster", self.backend.update_cluster(id, changes))
            .await
    }

    pub async fn delete_cluster(&self, id: &str) -> Result<ClusterDeletion> {
        self.forward("delete_cluster", self.backend.delete_cluster(id))
            .await
    }

    pub async fn add_cluster_detail(
        &self,
        cluster_id: &str,
        detail: DetailInput,
    ) -> Result<ClusterDetail> {
        self.forward(
            "add_cluster_detail",
            self.backend.add_cluster_detail(cluster_id, detail),
        )
        .await
    }

    pub async fn update_cluster_detail(
        &self,
        detail_id: &str,
        changes: DetailChanges,
    ) -> Result<ClusterDetail> {
        self.forward(
            "update_cluster_detail",
            self.backend.update_cluster_detail(detail_id, changes),
        )
        .await
    }

    pub async fn delete_cluster_detail(&self, detail_id: &str) -> Result<()> {
        self.forward(
            "delete_cluster_detail",
            self.backend.delete_cluster_detail(detail_id),
        )
        .await
    }

    pub async fn link_memory_to_cluster(
        &self,
        memory_id: &str,
        cluster_id: &str,
    ) -> Result<MemoryEntry> {
        self.forward(
            "link_memory_to_cluster",
            self.backend.link_memory_to_cluster(memory_id, cluster_id),
        )
        .await
    }

    pub async fn unlink_memory_from_cluster(&self, memory_id: &str) -> Result<MemoryEntry> {
        self.forward(
            "unlink_memory_from_cluster",
            self.backend.unlink_memory_from_cluster(memory_id),
        )
        .await
    }

    pub async fn get_memories_by_cluster(&self, cluster_id: &str) -> Result<Vec<MemoryEntry>> {
        self.forward(
            "get_memories_by_cluster",
            self.backend.get_memories_by_cluster(cluster_id),
        )
        .await
    }

    // ========================================================================
    // Statistics and similarity
    // ========================================================================

    pub async fn get_stats(&self) -> Result<StorageStats> {
        self.forward("get_stats", self.backend.get_stats()).await
    }

    pub async fn storage_info(&self) -> Result<StorageInfo> {
        self.forward("storage_info", self.backend.storage_info())
            .await
    }

    pub async fn semantic_search_memories(&self, query: SemanticQuery) -> Result<Vec<ScoredMemory>> {
        self.forward(
            "semantic_search_memories",
            self.backend.semantic_search_memories(query),
        )
        .await
    }

    pub async fn semantic_search_docs(&self, query: SemanticQuery) -> Result<Vec<ScoredDoc>> {
        self.forward(
            "semantic_search_docs",
            self.backend.semantic_search_docs(query),
        )
        .await
    }

    /// Embed `text` with the configured model and rank memories against it
    pub async fn find_similar_memories(&self, text: &str, limit: usize) -> Result<Vec<ScoredMemory>> {
        let vector = self.embeddings.embed_text(text).await.ok_or_else(|| {
            VaultError::Embedding("no embedding model available".to_string())
        })?;
        self.semantic_search_memories(SemanticQuery::new(vector, limit))
            .await
    }

    /// Flush and release the backend
    pub async fn close(&self) -> Result<()> {
        self.backend.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingConfig;
    use std::time::Duration;

    fn queue(dir: &std::path::Path, ready_wait_ms: u64) -> QueueConfig {
        QueueConfig {
            wal_path: dir.join("queue.jsonl").to_string_lossy().to_string(),
            ready_wait_ms,
            poll_interval_ms: 5,
            op_timeout_ms: 5_000,
        }
    }

    fn store(dir: &std::path::Path, ready_wait_ms: u64) -> VaultStore {
        let embeddings = Arc::new(EmbeddingService::new(EmbeddingConfig::disabled()));
        let backend = Arc::new(SqliteBackend::in_memory(None, embeddings.clone()).unwrap());
        VaultStore::new(backend, embeddings, None, queue(dir, ready_wait_ms))
    }

    #[tokio::test]
    async fn test_state_moves_forward_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 50);
        assert_eq!(store.state(), ReadinessState::Uninitialized);

        store.initialize().await.unwrap();
        assert!(store.is_ready());
        assert!(store.initialize().await.is_err());
        assert!(store.is_ready());
    }

    #[tokio::test]
    async fn test_queued_write_is_validated_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 50);
        let err = store
            .add_memory(AddMemoryInput {
                content: "too important".into(),
                importance: Some(15),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::InvalidInput(_)));
        assert!(!dir.path().join("queue.jsonl").exists());
    }

    #[tokio::test]
    async fn test_waiters_released_by_ready() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store(dir.path(), 2_000));
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.get_all_memories().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.initialize().await.unwrap();
        assert!(waiter.await.unwrap().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bad_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 50);
        store
            .add_memory(AddMemoryInput {
                content: "kept".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        {
            use tokio::io::AsyncWriteExt;
            let mut file = tokio::fs::OpenOptions::new()
                .append(true)
                .open(store.wal_path())
                .await
                .unwrap();
            file.write_all(b"{not json}\n").await.unwrap();
        }

        store.initialize().await.unwrap();
        let all = store.get_all_memories().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].content, "kept");
    }
}
