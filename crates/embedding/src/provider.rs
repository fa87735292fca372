use async_trait::async_trait;

/// Embedding capability consumed by the server. Concrete remote providers
/// (OpenAI, Cohere, local models) live outside the core; the server only
/// needs this seam plus the deterministic hash implementation for tests and
/// offline use.
#[async_trait]
pub trait Embedder: Send + Sync {
  /// Identifier of the underlying model
  fn model_id(&self) -> &str;

  /// Output dimension; must match the dataset's vector dimension
  fn dim(&self) -> usize;

  /// Embed a batch of texts, one vector per input
  async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
  /// Failure reported by the provider, message surfaced verbatim
  #[error("Provider error: {0}")]
  Provider(String),
  /// An attempt exceeded its deadline
  #[error("Embedding timed out")]
  Timeout,
}
