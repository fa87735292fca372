//! Deterministic local embedder.
//!
//! Hashes whitespace-delimited tokens into a fixed number of buckets and
//! l2-normalizes the result. Useful as the default when no remote provider is
//! configured, and in tests where vectors must be reproducible. Similar texts
//! share tokens and therefore land near each other, which is enough for the
//! engine's ranking paths to be exercised realistically.

use crate::{Embedder, EmbeddingError};
use async_trait::async_trait;

pub struct HashEmbedder {
  dim: usize,
}

impl HashEmbedder {
  pub fn new(dim: usize) -> Self {
    Self { dim }
  }

  fn embed_one(&self, text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; self.dim];
    for token in text.split_whitespace() {
      let token = token.to_lowercase();
      let bucket = fnv1a(token.as_bytes()) as usize % self.dim;
      vector[bucket] += 1.0;
    }

    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
      for x in &mut vector {
        *x /= norm;
      }
    }
    vector
  }
}

#[async_trait]
impl Embedder for HashEmbedder {
  fn model_id(&self) -> &str {
    "hash-embedder"
  }

  fn dim(&self) -> usize {
    self.dim
  }

  async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    Ok(texts.iter().map(|t| self.embed_one(t)).collect())
  }
}

fn fnv1a(bytes: &[u8]) -> u64 {
  let mut hash: u64 = 0xcbf29ce484222325;
  for &b in bytes {
    hash ^= b as u64;
    hash = hash.wrapping_mul(0x100000001b3);
  }
  hash
}
