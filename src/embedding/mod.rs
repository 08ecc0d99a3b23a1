//! Embedding collaborator
//!
//! Supports multiple embedding backends:
//! - TF-IDF feature hashing (no external dependencies, default)
//! - OpenAI-compatible API - requires `openai` feature
//!
//! The collaborator is an explicitly constructed [`EmbeddingService`] that is
//! handed to the backends (write path) and to the backfill engine. It
//! initializes its embedder once, on first use, and may report itself
//! unavailable; callers then persist records without a vector.

#[cfg(feature = "openai")]
mod openai;
mod tfidf;

#[cfg(feature = "openai")]
pub use openai::OpenAIEmbedder;
pub use tfidf::TfIdfEmbedder;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::config::EmbeddingConfig;
use crate::error::{Result, VaultError};

/// Trait for embedding generators
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate embedding for a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Get embedding dimensions
    fn dimensions(&self) -> usize;

    /// Get model name
    fn model_name(&self) -> &str;
}

/// Create an embedder from configuration
///
/// - `"tfidf"`: always available
/// - `"openai"`: requires the `openai` feature and an API key
/// - `"none"`: embeddings disabled (returns `Ok(None)`)
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Option<Arc<dyn Embedder>>> {
    match config.model.as_str() {
        "none" | "" => Ok(None),
        "tfidf" => Ok(Some(Arc::new(TfIdfEmbedder::new(config.dimensions)))),
        #[cfg(feature = "openai")]
        "openai" => {
            let api_key = config.api_key.clone().ok_or_else(|| {
                VaultError::Config(
                    "OPENAI_API_KEY required when the embedding model is 'openai'".to_string(),
                )
            })?;
            Ok(Some(Arc::new(OpenAIEmbedder::with_config(
                api_key,
                config.base_url.clone(),
                config.embedding_model.clone(),
                Some(config.dimensions),
            ))))
        }
        #[cfg(not(feature = "openai"))]
        "openai" => Err(VaultError::Config(
            "OpenAI embeddings require the 'openai' feature to be enabled".to_string(),
        )),
        other => Err(VaultError::Config(format!(
            "Unknown embedding model: '{}'. Use 'tfidf', 'openai' or 'none'",
            other
        ))),
    }
}

/// Owned, lazily initialized embedding collaborator
pub struct EmbeddingService {
    config: EmbeddingConfig,
    embedder: OnceCell<Option<Arc<dyn Embedder>>>,
}

impl EmbeddingService {
    pub fn new(config: EmbeddingConfig) -> Self {
        Self {
            config,
            embedder: OnceCell::new(),
        }
    }

    /// A service that never produces vectors
    pub fn disabled() -> Self {
        Self::new(EmbeddingConfig::disabled())
    }

    /// Wrap an already constructed embedder
    pub fn with_embedder(config: EmbeddingConfig, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            config,
            embedder: OnceCell::new_with(Some(Some(embedder))),
        }
    }

    /// The ready embedder, initializing it on first call.
    ///
    /// Initialization failures are logged and reported as unavailable.
    pub async fn ready(&self) -> Option<Arc<dyn Embedder>> {
        self.embedder
            .get_or_init(|| async {
                match create_embedder(&self.config) {
                    Ok(Some(embedder)) => {
                        tracing::info!(
                            "Embedding model '{}' ready ({} dimensions)",
                            embedder.model_name(),
                            embedder.dimensions()
                        );
                        Some(embedder)
                    }
                    Ok(None) => {
                        tracing::info!("Embeddings disabled");
                        None
                    }
                    Err(e) => {
                        tracing::warn!("Embedding model unavailable: {}", e);
                        None
                    }
                }
            })
            .await
            .clone()
    }

    /// Embed record content. `None` when the collaborator is unavailable or fails.
    pub async fn embed_text(&self, text: &str) -> Option<Vec<f32>> {
        let embedder = self.ready().await?;
        match embedder
            .embed(&prepare_text(text, self.config.max_input_chars))
            .await
        {
            Ok(vector) => Some(vector),
            Err(e) => {
                tracing::warn!("Embedding failed, storing record without vector: {}", e);
                None
            }
        }
    }

    /// Embed with the error surfaced, for the backfill engine's per-row accounting
    pub async fn try_embed(&self, embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>> {
        let prepared = prepare_text(text, self.config.max_input_chars);
        if prepared.is_empty() {
            return Err(VaultError::Embedding("nothing to embed".to_string()));
        }
        embedder.embed(&prepared).await
    }

    pub fn config(&self) -> &EmbeddingConfig {
        &self.config
    }
}

/// Normalize text for embedding: collapse whitespace and truncate to `max_chars` characters
pub fn prepare_text(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match collapsed.char_indices().nth(max_chars) {
        Some((idx, _)) => collapsed[..idx].to_string(),
        None => collapsed,
    }
}

/// Cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

/// Score candidates against a query vector, keep those above `min_score`, best first
pub fn rank_by_similarity<T>(
    query: &[f32],
    candidates: Vec<(T, Vec<f32>)>,
    limit: usize,
    min_score: Option<f32>,
) -> Vec<(T, f32)> {
    let mut scored: Vec<(T, f32)> = candidates
        .into_iter()
        .filter(|(_, vector)| vector.len() == query.len())
        .map(|(item, vector)| {
            let score = cosine_similarity(query, &vector);
            (item, score)
        })
        .filter(|(_, score)| min_score.map_or(true, |min| *score >= min))
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(limit);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 0.001);

        let c = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &c).abs() < 0.001);

        let d = vec![-1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &d) + 1.0).abs() < 0.001);
    }

    #[test]
    fn test_prepare_text() {
        assert_eq!(prepare_text("  hello \n\t world  ", 100), "hello world");
        assert_eq!(prepare_text("abcdef", 3), "abc");
        // Truncation counts characters, not bytes
        assert_eq!(prepare_text("ééééé", 2), "éé");
    }

    #[test]
    fn test_rank_by_similarity() {
        let query = vec![1.0, 0.0];
        let candidates = vec![
            ("orthogonal", vec![0.0, 1.0]),
            ("same", vec![2.0, 0.0]),
            ("close", vec![1.0, 0.2]),
            ("wrong-dims", vec![1.0, 0.0, 0.0]),
        ];
        let ranked = rank_by_similarity(&query, candidates, 2, Some(0.5));
        let names: Vec<_> = ranked.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["same", "close"]);
    }

    #[tokio::test]
    async fn test_service_with_tfidf() {
        let service = EmbeddingService::new(EmbeddingConfig::default());
        let vector = service.embed_text("Hello world").await.unwrap();
        assert_eq!(vector.len(), 384);
    }

    #[tokio::test]
    async fn test_disabled_service_is_unavailable() {
        let service = EmbeddingService::disabled();
        assert!(service.ready().await.is_none());
        assert!(service.embed_text("anything").await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_model_is_unavailable_not_fatal() {
        let service = EmbeddingService::new(EmbeddingConfig {
            model: "word2vec".to_string(),
            ..Default::default()
        });
        assert!(service.ready().await.is_none());
    }
}
