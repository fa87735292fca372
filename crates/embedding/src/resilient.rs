//! Bounded retry for plugged-in embedding providers.
//!
//! Remote embedders fail in bursts: rate limits, overloaded backends,
//! stalled connections. [`RetryingEmbedder`] puts a deadline on every
//! attempt and retries transient failures with a doubling, jittered delay.
//! The local hash embedder never needs this; the server applies the wrapper
//! to any embedder supplied from outside.

use crate::{Embedder, EmbeddingError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Retry schedule for one embed call
#[derive(Debug, Clone)]
pub struct RetryPolicy {
  /// Total attempts before giving up (the first try included)
  pub attempts: u32,
  /// Delay before the first retry; doubles with each further retry
  pub base_delay: Duration,
  /// Ceiling on the doubling delay
  pub max_delay: Duration,
  /// Deadline applied to each individual attempt
  pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      attempts: 3,
      base_delay: Duration::from_millis(200),
      max_delay: Duration::from_secs(5),
      attempt_timeout: Duration::from_secs(30),
    }
  }
}

impl RetryPolicy {
  /// Delay before retry number `retry` (0-based), with up to a quarter of
  /// jitter added so synchronized callers spread out.
  fn delay_before(&self, retry: u32) -> Duration {
    let doubled = self.base_delay.saturating_mul(1u32 << retry.min(16));
    let capped = doubled.min(self.max_delay);
    let quarter = (capped.as_millis() as u64) / 4;
    let jitter = if quarter == 0 { 0 } else { clock_jitter() % (quarter + 1) };
    capped + Duration::from_millis(jitter)
  }
}

// Sub-second clock noise; good enough to de-synchronize retries
fn clock_jitter() -> u64 {
  use std::time::{SystemTime, UNIX_EPOCH};
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.subsec_micros() as u64)
    .unwrap_or(0)
}

/// Whether an error class is worth another attempt
pub fn is_transient(error: &EmbeddingError) -> bool {
  match error {
    EmbeddingError::Timeout => true,
    EmbeddingError::Provider(message) => {
      let message = message.to_lowercase();
      message.contains("429")
        || message.contains("502")
        || message.contains("503")
        || message.contains("504")
        || message.contains("rate limit")
        || message.contains("overloaded")
        || message.contains("unavailable")
    }
  }
}

/// Wraps an embedder with per-attempt deadlines and bounded retries.
/// Permanent failures (bad model, bad input) surface on the first attempt.
pub struct RetryingEmbedder {
  inner: Arc<dyn Embedder>,
  policy: RetryPolicy,
}

impl RetryingEmbedder {
  pub fn new(inner: Arc<dyn Embedder>) -> Self {
    Self {
      inner,
      policy: RetryPolicy::default(),
    }
  }

  pub fn with_policy(inner: Arc<dyn Embedder>, policy: RetryPolicy) -> Self {
    Self { inner, policy }
  }

  async fn attempt(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    match tokio::time::timeout(self.policy.attempt_timeout, self.inner.embed(texts)).await {
      Ok(result) => result,
      Err(_) => Err(EmbeddingError::Timeout),
    }
  }
}

#[async_trait]
impl Embedder for RetryingEmbedder {
  fn model_id(&self) -> &str {
    self.inner.model_id()
  }

  fn dim(&self) -> usize {
    self.inner.dim()
  }

  async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let mut retry = 0;
    loop {
      match self.attempt(texts).await {
        Ok(vectors) => return Ok(vectors),
        Err(e) if is_transient(&e) && retry + 1 < self.policy.attempts => {
          let delay = self.policy.delay_before(retry);
          warn!("Embedding attempt {} failed ({}), next try in {:?}", retry + 1, e, delay);
          tokio::time::sleep(delay).await;
          retry += 1;
        }
        Err(e) => return Err(e),
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicU32, Ordering};

  struct FlakyEmbedder {
    failures: AtomicU32,
    hang: bool,
  }

  impl FlakyEmbedder {
    fn failing(n: u32) -> Arc<Self> {
      Arc::new(Self {
        failures: AtomicU32::new(n),
        hang: false,
      })
    }
  }

  #[async_trait]
  impl Embedder for FlakyEmbedder {
    fn model_id(&self) -> &str {
      "flaky"
    }

    fn dim(&self) -> usize {
      2
    }

    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
      if self.hang {
        tokio::time::sleep(Duration::from_secs(60)).await;
      }
      let failing = self
        .failures
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
      if failing {
        return Err(EmbeddingError::Provider("503 service unavailable".to_string()));
      }
      Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
    }
  }

  fn fast_policy(attempts: u32) -> RetryPolicy {
    RetryPolicy {
      attempts,
      base_delay: Duration::from_millis(1),
      max_delay: Duration::from_millis(4),
      attempt_timeout: Duration::from_millis(50),
    }
  }

  #[tokio::test]
  async fn test_transient_failures_retried() {
    let embedder = RetryingEmbedder::with_policy(FlakyEmbedder::failing(2), fast_policy(3));
    let vectors = embedder.embed(&["x"]).await.unwrap();
    assert_eq!(vectors, vec![vec![1.0, 0.0]]);
  }

  #[tokio::test]
  async fn test_gives_up_after_budget() {
    let embedder = RetryingEmbedder::with_policy(FlakyEmbedder::failing(10), fast_policy(3));
    assert!(matches!(embedder.embed(&["x"]).await, Err(EmbeddingError::Provider(_))));
  }

  #[tokio::test]
  async fn test_permanent_failure_not_retried() {
    struct BadModel;

    #[async_trait]
    impl Embedder for BadModel {
      fn model_id(&self) -> &str {
        "bad"
      }

      fn dim(&self) -> usize {
        2
      }

      async fn embed(&self, _texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Err(EmbeddingError::Provider("unknown model".to_string()))
      }
    }

    let embedder = RetryingEmbedder::with_policy(Arc::new(BadModel), fast_policy(5));
    let err = embedder.embed(&["x"]).await.unwrap_err();
    assert!(err.to_string().contains("unknown model"));
  }

  #[tokio::test]
  async fn test_stalled_attempt_times_out() {
    let inner = Arc::new(FlakyEmbedder {
      failures: AtomicU32::new(0),
      hang: true,
    });
    let embedder = RetryingEmbedder::with_policy(inner, fast_policy(1));
    assert!(matches!(embedder.embed(&["x"]).await, Err(EmbeddingError::Timeout)));
  }

  #[tokio::test]
  async fn test_wrapper_passes_through_identity() {
    let embedder = RetryingEmbedder::new(FlakyEmbedder::failing(0));
    assert_eq!(embedder.model_id(), "flaky");
    assert_eq!(embedder.dim(), 2);
  }

  #[test]
  fn test_is_transient_classes() {
    assert!(is_transient(&EmbeddingError::Timeout));
    assert!(is_transient(&EmbeddingError::Provider("HTTP 429 Too Many Requests".into())));
    assert!(is_transient(&EmbeddingError::Provider("backend overloaded".into())));
    assert!(!is_transient(&EmbeddingError::Provider("invalid model id".into())));
  }

  #[test]
  fn test_delay_doubles_and_caps() {
    let policy = RetryPolicy {
      attempts: 5,
      base_delay: Duration::from_millis(100),
      max_delay: Duration::from_millis(300),
      attempt_timeout: Duration::from_secs(1),
    };
    // Jitter adds at most a quarter on top of the capped delay
    assert!(policy.delay_before(0) >= Duration::from_millis(100));
    assert!(policy.delay_before(0) <= Duration::from_millis(125));
    assert!(policy.delay_before(1) >= Duration::from_millis(200));
    assert!(policy.delay_before(4) <= Duration::from_millis(375));
  }
}
