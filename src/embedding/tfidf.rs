//! Feature-hashing embedder
//!
//! Deterministic and local, so it is always available. Vectors are only
//! comparable with other vectors produced at the same dimensionality.

use async_trait::async_trait;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use crate::embedding::Embedder;
use crate::error::Result;

const BIGRAM_WEIGHT: f32 = 0.5;

pub struct TfIdfEmbedder {
    dimensions: usize,
}

impl TfIdfEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    fn tokenize(text: &str) -> Vec<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|s| s.chars().count() > 1)
            .map(String::from)
            .collect()
    }

    /// Bucket index and sign for a feature
    fn slot(&self, feature: &str) -> (usize, f32) {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        feature.hash(&mut hasher);
        let h = hasher.finish();
        let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
        ((h as usize) % self.dimensions, sign)
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        let tokens = Self::tokenize(text);
        let mut vector = vec![0.0_f32; self.dimensions];
        if tokens.is_empty() {
            return vector;
        }

        let mut counts: HashMap<&str, f32> = HashMap::new();
        for token in &tokens {
            *counts.entry(token.as_str()).or_insert(0.0) += 1.0;
        }

        let len = tokens.len() as f32;
        for (token, count) in counts {
            // Longer tokens are treated as rarer
            let idf = 1.0 + token.chars().count() as f32 * 0.1;
            let weight = (1.0 + count / len).ln() * idf;
            let (idx, sign) = self.slot(token);
            vector[idx] += weight * sign;
        }

        for pair in tokens.windows(2) {
            let (idx, sign) = self.slot(&format!("{}_{}", pair[0], pair[1]));
            vector[idx] += BIGRAM_WEIGHT * sign;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }
}

#[async_trait]
impl Embedder for TfIdfEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.vectorize(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        "tfidf"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::cosine_similarity;

    #[tokio::test]
    async fn test_deterministic() {
        let embedder = TfIdfEmbedder::new(384);
        let e1 = embedder.embed("hello world").await.unwrap();
        let e2 = embedder.embed("hello world").await.unwrap();
        assert_eq!(e1, e2);
    }

    #[tokio::test]
    async fn test_similar_text_scores_higher() {
        let embedder = TfIdfEmbedder::new(384);
        let e1 = embedder
            .embed("the quick brown fox jumps over the lazy dog")
            .await
            .unwrap();
        let e2 = embedder
            .embed("a quick brown fox leaps over a sleepy dog")
            .await
            .unwrap();
        let e3 = embedder
            .embed("quantum physics and thermodynamics")
            .await
            .unwrap();

        assert!(cosine_similarity(&e1, &e2) > cosine_similarity(&e1, &e3));
    }

    #[tokio::test]
    async fn test_empty_text_is_zero_vector() {
        let embedder = TfIdfEmbedder::new(64);
        let e = embedder.embed("").await.unwrap();
        assert_eq!(e.len(), 64);
        assert!(e.iter().all(|&x| x == 0.0));
    }

    #[tokio::test]
    async fn test_normalized() {
        let embedder = TfIdfEmbedder::new(384);
        let e = embedder
            .embed("this is a test sentence with multiple words")
            .await
            .unwrap();
        let norm: f32 = e.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 0.001);
    }
}
