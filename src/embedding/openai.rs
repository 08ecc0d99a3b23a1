//! OpenAI-compatible embeddings endpoint (OpenAI, OpenRouter, Azure, local gateways)

use async_trait::async_trait;
use serde::Deserialize;

use super::Embedder;
use crate::error::{Result, VaultError};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "text-embedding-3-small";

pub struct OpenAIEmbedder {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    dimensions: usize,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

impl OpenAIEmbedder {
    /// # Arguments
    /// * `base_url` - API base URL, e.g. "https://openrouter.ai/api/v1"
    /// * `dimensions` - expected output size; responses of any other size are rejected
    pub fn with_config(
        api_key: String,
        base_url: Option<String>,
        model: Option<String>,
        dimensions: Option<usize>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            dimensions: dimensions.unwrap_or(1536),
        }
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/embeddings", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            // OpenRouter requires HTTP-Referer
            .header("HTTP-Referer", "https://github.com/memvault")
            .header("X-Title", "memvault")
            .json(&serde_json::json!({
                "input": text,
                "model": self.model,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(VaultError::Embedding(format!(
                "Embedding API error {}: {}",
                status, body
            )));
        }

        let parsed: EmbeddingResponse = response.json().await?;
        let embedding = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| VaultError::Embedding("Empty embedding response".to_string()))?;

        if embedding.len() != self.dimensions {
            return Err(VaultError::Embedding(format!(
                "Embedding dimensions mismatch: expected {}, got {}. Set MEMVAULT_EMBEDDING_DIMENSIONS={} to match your model.",
                self.dimensions,
                embedding.len(),
                embedding.len()
            )));
        }

        Ok(embedding)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
