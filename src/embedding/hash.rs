//! Offline feature-hashing embedder.
//!
//! Each token is hashed with SHA-256 into one of `dims` buckets with a
//! sign bit, and the result is L2-normalized. Texts that share words end
//! up with high cosine similarity. No model download, no network, fully
//! deterministic, which makes it the default provider and the one the
//! test suite runs against.
//!
//! Tokens are lower-cased alphanumeric runs. Runs containing non-ASCII
//! letters (CJK text has no spaces) additionally contribute every single
//! character and every adjacent character pair.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use semantic_kb_core::embedding::{l2_normalize, Embedder};
use semantic_kb_core::{KbError, Result};

pub const DEFAULT_HASH_DIMS: usize = 384;

pub struct HashEmbedder {
    model: String,
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            model: format!("hash-{}", dims),
            dims,
        }
    }

    fn bucket(&self, token: &str) -> (usize, f32) {
        let digest = Sha256::digest(token.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        let h = u64::from_le_bytes(bytes);
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        ((h % self.dims as u64) as usize, sign)
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_HASH_DIMS)
    }
}

pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for run in text.split(|c: char| !c.is_alphanumeric()) {
        if run.is_empty() {
            continue;
        }
        let run = run.to_lowercase();
        if !run.is_ascii() {
            let chars: Vec<char> = run.chars().collect();
            tokens.extend(chars.iter().map(|c| c.to_string()));
            tokens.extend(chars.windows(2).map(|w| w.iter().collect::<String>()));
        }
        tokens.push(run);
    }
    tokens
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let tokens = tokenize(text);
        if tokens.is_empty() {
            return Err(KbError::Embedding {
                reason: "text contains no tokens".to_string(),
            });
        }

        let mut v = vec![0.0f32; self.dims];
        for token in &tokens {
            let (idx, sign) = self.bucket(token);
            v[idx] += sign;
        }
        l2_normalize(&mut v);
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use semantic_kb_core::embedding::cosine_similarity;

    #[tokio::test]
    async fn test_deterministic_and_normalized() {
        let e = HashEmbedder::default();
        let a = e.embed("Apple pie recipe").await.unwrap();
        let b = e.embed("apple PIE recipe").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 384);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_shared_words_are_closer() {
        let e = HashEmbedder::new(256);
        let q = e.embed("electric sedan range").await.unwrap();
        let near = e.embed("an electric sedan with long range").await.unwrap();
        let far = e.embed("banana smoothie").await.unwrap();
        assert!(cosine_similarity(&q, &near) > cosine_similarity(&q, &far));
    }

    #[tokio::test]
    async fn test_no_tokens_is_per_text_error() {
        let e = HashEmbedder::default();
        match e.embed("  ... !!").await {
            Err(err @ KbError::Embedding { .. }) => assert!(!err.is_fatal()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_tokenize_cjk() {
        let tokens = tokenize("比亚迪 Han");
        assert!(tokens.contains(&"比亚迪".to_string()));
        assert!(tokens.contains(&"比亚".to_string()));
        assert!(tokens.contains(&"迪".to_string()));
        assert!(tokens.contains(&"han".to_string()));
    }
}
