//! Startup backfill for rows written before a derived field existed
//!
//! Runs once per bootstrap, after the schema is in place and before the
//! readiness gate opens. Every step only touches rows that still need work, so
//! running it again over a fully backfilled dataset writes nothing.

use serde::Serialize;

use super::backend::{EntityTable, MigrationTarget, PendingRow};
use crate::crypto::EnvelopeService;
use crate::embedding::EmbeddingService;
use crate::error::{Result, VaultError};
use crate::types::is_sealed;

/// What a backfill pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillReport {
    /// Tables that gained an `embedding` column
    pub columns_added: Vec<String>,
    pub embedded: usize,
    pub embed_failures: usize,
    pub encrypted: usize,
    pub encrypt_failures: usize,
    /// Set when no embedder was available
    pub embedding_skipped: bool,
}

impl BackfillReport {
    /// Rows rewritten by this pass
    pub fn writes(&self) -> usize {
        self.embedded + self.encrypted
    }
}

/// Run every backfill step against `target`.
///
/// Only listing rows can fail the pass; per-row failures are logged and
/// counted in the report.
pub async fn run_backfill(
    target: &dyn MigrationTarget,
    embeddings: &EmbeddingService,
    envelope: Option<&EnvelopeService>,
) -> Result<BackfillReport> {
    let mut report = BackfillReport::default();

    for table in EntityTable::ALL {
        if target.ensure_embedding_column(table).await? {
            tracing::info!("Added embedding column to {}", table);
            report.columns_added.push(table.to_string());
        }
    }

    match embeddings.ready().await {
        Some(embedder) => {
            for table in EntityTable::ALL {
                for row in target.rows_missing_embedding(table).await? {
                    let written = match plaintext(envelope, &row) {
                        Ok(content) => {
                            match embeddings.try_embed(embedder.as_ref(), &content).await {
                                Ok(vector) => {
                                    target.write_embedding(table, &row.id, &vector).await
                                }
                                Err(e) => Err(e),
                            }
                        }
                        Err(e) => Err(e),
                    };
                    match written {
                        Ok(()) => report.embedded += 1,
                        Err(e) => {
                            tracing::error!("Embedding backfill failed for {} {}: {}", table, row.id, e);
                            report.embed_failures += 1;
                        }
                    }
                }
            }
        }
        None => {
            tracing::warn!("No embedding model available, skipping embedding backfill");
            report.embedding_skipped = true;
        }
    }

    if let Some(service) = envelope {
        for table in EntityTable::ALL {
            for row in target.rows_unsealed(table).await? {
                let mut metadata = row.metadata;
                let sealed = match service.seal_record(&row.content, &mut metadata) {
                    Ok(content) => target.write_sealed(table, &row.id, &content, &metadata).await,
                    Err(e) => Err(e),
                };
                match sealed {
                    Ok(()) => report.encrypted += 1,
                    Err(e) => {
                        tracing::error!("Encryption backfill failed for {} {}: {}", table, row.id, e);
                        report.encrypt_failures += 1;
                    }
                }
            }
        }
    }

    tracing::info!(
        "Backfill complete: {} embedded ({} failed), {} sealed ({} failed)",
        report.embedded,
        report.embed_failures,
        report.encrypted,
        report.encrypt_failures
    );
    Ok(report)
}

/// Content to embed. A sealed row that cannot be opened is an error, never
/// its ciphertext.
fn plaintext(envelope: Option<&EnvelopeService>, row: &PendingRow) -> Result<String> {
    if !is_sealed(&row.metadata) {
        return Ok(row.content.clone());
    }
    match envelope {
        Some(service) => service.open_record(&row.content, &row.metadata),
        None => Err(VaultError::Encryption(
            "row is sealed but encryption is not configured".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingConfig;
    use crate::crypto::KeyPair;
    use crate::storage::backend::StorageProvider;
    use crate::storage::SqliteBackend;
    use std::sync::Arc;

    /// Rows as an older release would have left them: no vector, no envelope
    fn seed_plain_rows(backend: &SqliteBackend) {
        backend
            .storage()
            .with_connection(|conn| {
                conn.execute_batch(
                    r#"INSERT INTO memories (id, content, tags, context, importance, timestamp, lastAccessed, accessCount, metadata)
                       VALUES ('m1', 'legacy memory about rust', '[]', '', 5, '2025-01-01T00:00:00.000000Z', '2025-01-01T00:00:00.000000Z', 0, '{}');
                       INSERT INTO docs (id, url, title, content, tags, timestamp, lastFetched, accessCount, metadata)
                       VALUES ('d1', NULL, 'Guide', 'legacy doc', '[]', '2025-01-01T00:00:00.000000Z', '2025-01-01T00:00:00.000000Z', 0, '{}');"#,
                )?;
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_backfill_embeds_and_seals_once() {
        let envelope = Arc::new(EnvelopeService::new(KeyPair::generate()));
        let embeddings = Arc::new(EmbeddingService::new(EmbeddingConfig::default()));
        let backend = SqliteBackend::in_memory(Some(envelope.clone()), embeddings.clone()).unwrap();
        backend.initialize().await.unwrap();
        seed_plain_rows(&backend);

        let first = run_backfill(&backend, &embeddings, Some(envelope.as_ref())).await.unwrap();
        assert_eq!(first.embedded, 2);
        assert_eq!(first.encrypted, 2);
        assert!(!first.embedding_skipped);

        let second = run_backfill(&backend, &embeddings, Some(envelope.as_ref())).await.unwrap();
        assert_eq!(second.writes(), 0);
        assert!(second.columns_added.is_empty());

        let all = backend.get_all_memories().await.unwrap();
        assert_eq!(all[0].content, "legacy memory about rust");
        assert!(all[0].is_encrypted());
        assert!(all[0].embedding.is_some());

        let raw: String = backend
            .storage()
            .with_connection(|conn| {
                Ok(conn.query_row("SELECT metadata FROM docs WHERE id = 'd1'", [], |row| row.get(0))?)
            })
            .unwrap();
        assert!(is_sealed(&serde_json::from_str(&raw).unwrap()));
    }

    #[tokio::test]
    async fn test_missing_embedder_skips_without_failing() {
        let embeddings = Arc::new(EmbeddingService::disabled());
        let backend = SqliteBackend::in_memory(None, embeddings.clone()).unwrap();
        backend.initialize().await.unwrap();
        seed_plain_rows(&backend);

        let report = run_backfill(&backend, &embeddings, None).await.unwrap();
        assert!(report.embedding_skipped);
        assert_eq!(report.writes(), 0);
    }

    struct FlakyEmbedder;

    #[async_trait::async_trait]
    impl crate::embedding::Embedder for FlakyEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            if text.contains("doc") {
                return Err(crate::error::VaultError::Embedding("upstream 503".to_string()));
            }
            Ok(vec![0.5; 4])
        }

        fn dimensions(&self) -> usize {
            4
        }

        fn model_name(&self) -> &str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn test_row_failures_are_counted_not_fatal() {
        let embeddings = Arc::new(EmbeddingService::with_embedder(
            EmbeddingConfig::default(),
            Arc::new(FlakyEmbedder),
        ));
        let backend = SqliteBackend::in_memory(None, embeddings.clone()).unwrap();
        backend.initialize().await.unwrap();
        seed_plain_rows(&backend);

        let report = run_backfill(&backend, &embeddings, None).await.unwrap();
        assert_eq!(report.embedded, 1);
        assert_eq!(report.embed_failures, 1);

        // The failed row is picked up again next time
        let again = run_backfill(&backend, &embeddings, None).await.unwrap();
        assert_eq!(again.embedded, 0);
        assert_eq!(again.embed_failures, 1);
    }

    #[derive(Default)]
    struct RecordingEmbedder {
        seen: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl crate::embedding::Embedder for RecordingEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.seen.lock().unwrap().push(text.to_string());
            Ok(vec![0.25; 4])
        }

        fn dimensions(&self) -> usize {
            4
        }

        fn model_name(&self) -> &str {
            "recording"
        }
    }

    #[tokio::test]
    async fn test_unopenable_sealed_row_is_not_embedded() {
        let key = Arc::new(EnvelopeService::new(KeyPair::generate()));
        let backend =
            SqliteBackend::in_memory(Some(key.clone()), Arc::new(EmbeddingService::disabled()))
                .unwrap();
        backend.initialize().await.unwrap();
        let input = crate::types::AddMemoryInput {
            content: "sealed secret".to_string(),
            ..Default::default()
        };
        backend
            .add_memory(crate::types::NewMemory::try_from(input).unwrap())
            .await
            .unwrap();

        let recorder = Arc::new(RecordingEmbedder::default());
        let embeddings =
            EmbeddingService::with_embedder(EmbeddingConfig::default(), recorder.clone());

        let without_key = run_backfill(&backend, &embeddings, None).await.unwrap();
        assert_eq!(without_key.embedded, 0);
        assert_eq!(without_key.embed_failures, 1);

        let wrong_key = EnvelopeService::new(KeyPair::generate());
        let mismatched = run_backfill(&backend, &embeddings, Some(&wrong_key)).await.unwrap();
        assert_eq!(mismatched.embedded, 0);
        assert_eq!(mismatched.embed_failures, 1);
        assert!(recorder.seen.lock().unwrap().is_empty());
        assert!(backend.get_all_memories().await.unwrap()[0].embedding.is_none());

        let right_key = run_backfill(&backend, &embeddings, Some(key.as_ref())).await.unwrap();
        assert_eq!(right_key.embedded, 1);
        assert_eq!(*recorder.seen.lock().unwrap(), vec!["sealed secret".to_string()]);
    }
}
