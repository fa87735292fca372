//! Security hook chain: authentication, authorization, rate limiting, audit.
//!
//! Hooks run in that order and are pure functions of the request plus the
//! caller identity. The config-backed implementations here are intentionally
//! small; deployments with real identity systems plug in their own
//! `Authenticator`/`Authorizer`.

use frame_core::SecurityConfig;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;
use thiserror::Error;
use tracing::info;

use crate::rpc::{FORBIDDEN, RATE_LIMITED, UNAUTHORIZED};

/// Who is calling
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallerIdentity {
  pub name: String,
}

impl CallerIdentity {
  pub fn anonymous() -> Self {
    Self {
      name: "anonymous".to_string(),
    }
  }
}

#[derive(Debug, Clone, Error)]
pub enum SecurityError {
  #[error("Authentication failed: {0}")]
  Unauthenticated(String),
  #[error("Not authorized to call {0}")]
  Forbidden(String),
  #[error("Rate limit exceeded for {0}")]
  RateLimited(String),
}

impl SecurityError {
  pub fn code(&self) -> i32 {
    match self {
      SecurityError::Unauthenticated(_) => UNAUTHORIZED,
      SecurityError::Forbidden(_) => FORBIDDEN,
      SecurityError::RateLimited(_) => RATE_LIMITED,
    }
  }
}

/// Credentials extracted from the transport
#[derive(Debug, Clone, Default)]
pub struct Credentials {
  pub bearer_token: Option<String>,
  pub api_key: Option<String>,
}

/// Maps credentials to a caller identity
pub trait Authenticator: Send + Sync {
  fn authenticate(&self, credentials: &Credentials) -> Result<CallerIdentity, SecurityError>;
}

/// Decides whether a caller may invoke a tool
pub trait Authorizer: Send + Sync {
  fn authorize(&self, caller: &CallerIdentity, tool: &str) -> Result<(), SecurityError>;
}

/// Bearer-token / API-key authenticator backed by the static config
pub struct ConfigAuthenticator {
  bearer_token: Option<String>,
  api_keys: HashMap<String, String>,
}

impl ConfigAuthenticator {
  pub fn new(config: &SecurityConfig) -> Self {
    Self {
      bearer_token: config.bearer_token.clone(),
      api_keys: config.api_keys.clone(),
    }
  }
}

impl Authenticator for ConfigAuthenticator {
  fn authenticate(&self, credentials: &Credentials) -> Result<CallerIdentity, SecurityError> {
    if let Some(key) = &credentials.api_key {
      return match self.api_keys.get(key) {
        Some(caller) => Ok(CallerIdentity { name: caller.clone() }),
        None => Err(SecurityError::Unauthenticated("unknown API key".to_string())),
      };
    }

    match (&self.bearer_token, &credentials.bearer_token) {
      (Some(expected), Some(given)) if expected == given => Ok(CallerIdentity {
        name: "bearer".to_string(),
      }),
      (Some(_), _) => Err(SecurityError::Unauthenticated("missing or wrong bearer token".to_string())),
      // No credentials configured: everyone is anonymous
      (None, _) => Ok(CallerIdentity::anonymous()),
    }
  }
}

/// Allow/deny-list authorizer backed by the static config
pub struct ConfigAuthorizer {
  allowed_tools: Vec<String>,
  denied_tools: Vec<String>,
}

impl ConfigAuthorizer {
  pub fn new(config: &SecurityConfig) -> Self {
    Self {
      allowed_tools: config.allowed_tools.clone(),
      denied_tools: config.denied_tools.clone(),
    }
  }
}

impl Authorizer for ConfigAuthorizer {
  fn authorize(&self, _caller: &CallerIdentity, tool: &str) -> Result<(), SecurityError> {
    if self.denied_tools.iter().any(|t| t == tool) {
      return Err(SecurityError::Forbidden(tool.to_string()));
    }
    if !self.allowed_tools.is_empty() && !self.allowed_tools.iter().any(|t| t == tool) {
      return Err(SecurityError::Forbidden(tool.to_string()));
    }
    Ok(())
  }
}

struct Bucket {
  tokens: f64,
  last_refill: Instant,
}

/// Token bucket per caller
pub struct RateLimiter {
  capacity: f64,
  refill_per_sec: f64,
  buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
  pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
    Self {
      capacity: capacity as f64,
      refill_per_sec,
      buckets: Mutex::new(HashMap::new()),
    }
  }

  /// Take one token; empty bucket means rate limited
  pub fn check(&self, caller: &CallerIdentity) -> Result<(), SecurityError> {
    if self.capacity <= 0.0 {
      return Ok(());
    }
    let mut buckets = self.buckets.lock().expect("rate limiter poisoned");
    let bucket = buckets.entry(caller.name.clone()).or_insert(Bucket {
      tokens: self.capacity,
      last_refill: Instant::now(),
    });

    let elapsed = bucket.last_refill.elapsed().as_secs_f64();
    bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
    bucket.last_refill = Instant::now();

    if bucket.tokens < 1.0 {
      return Err(SecurityError::RateLimited(caller.name.clone()));
    }
    bucket.tokens -= 1.0;
    Ok(())
  }
}

/// Emits one audit line per evaluated call
#[derive(Default)]
pub struct AuditLog;

impl AuditLog {
  pub fn record(&self, caller: &CallerIdentity, tool: &str, allowed: bool) {
    info!(caller = %caller.name, tool = %tool, allowed = allowed, "audit");
  }
}

/// The ordered hook chain
pub struct SecurityChain {
  enabled: bool,
  authenticator: Box<dyn Authenticator>,
  authorizer: Box<dyn Authorizer>,
  limiter: RateLimiter,
  audit: AuditLog,
}

impl SecurityChain {
  pub fn from_config(config: &SecurityConfig) -> Self {
    Self {
      enabled: config.enabled,
      authenticator: Box::new(ConfigAuthenticator::new(config)),
      authorizer: Box::new(ConfigAuthorizer::new(config)),
      limiter: RateLimiter::new(config.rate_limit_capacity, config.rate_limit_refill_per_sec),
      audit: AuditLog,
    }
  }

  /// A disabled chain that admits everyone
  pub fn disabled() -> Self {
    Self::from_config(&SecurityConfig::default())
  }

  pub fn with_hooks(authenticator: Box<dyn Authenticator>, authorizer: Box<dyn Authorizer>, limiter: RateLimiter) -> Self {
    Self {
      enabled: true,
      authenticator,
      authorizer,
      limiter,
      audit: AuditLog,
    }
  }

  /// Evaluate the chain for one request
  pub fn check(&self, tool: &str, credentials: &Credentials) -> Result<CallerIdentity, SecurityError> {
    if !self.enabled {
      return Ok(CallerIdentity::anonymous());
    }

    let caller = self.authenticator.authenticate(credentials)?;
    if let Err(e) = self.authorizer.authorize(&caller, tool) {
      self.audit.record(&caller, tool, false);
      return Err(e);
    }
    if let Err(e) = self.limiter.check(&caller) {
      self.audit.record(&caller, tool, false);
      return Err(e);
    }
    self.audit.record(&caller, tool, true);
    Ok(caller)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn config_with(bearer: Option<&str>) -> SecurityConfig {
    SecurityConfig {
      enabled: true,
      bearer_token: bearer.map(String::from),
      rate_limit_capacity: 100,
      rate_limit_refill_per_sec: 100.0,
      ..Default::default()
    }
  }

  #[test]
  fn test_disabled_chain_admits_everyone() {
    let chain = SecurityChain::disabled();
    let caller = chain.check("document_create", &Credentials::default()).unwrap();
    assert_eq!(caller, CallerIdentity::anonymous());
  }

  #[test]
  fn test_bearer_token() {
    let chain = SecurityChain::from_config(&config_with(Some("secret")));

    let ok = chain.check("document_get", &Credentials {
      bearer_token: Some("secret".to_string()),
      api_key: None,
    });
    assert!(ok.is_ok());

    let err = chain.check("document_get", &Credentials::default()).unwrap_err();
    assert!(matches!(err, SecurityError::Unauthenticated(_)));
    assert_eq!(err.code(), UNAUTHORIZED);
  }

  #[test]
  fn test_api_key_identity() {
    let mut config = config_with(None);
    config.api_keys.insert("k-123".to_string(), "ci-bot".to_string());
    let chain = SecurityChain::from_config(&config);

    let caller = chain
      .check("document_get", &Credentials {
        bearer_token: None,
        api_key: Some("k-123".to_string()),
      })
      .unwrap();
    assert_eq!(caller.name, "ci-bot");

    let err = chain
      .check("document_get", &Credentials {
        bearer_token: None,
        api_key: Some("wrong".to_string()),
      })
      .unwrap_err();
    assert!(matches!(err, SecurityError::Unauthenticated(_)));
  }

  #[test]
  fn test_deny_list() {
    let mut config = config_with(None);
    config.denied_tools = vec!["document_delete".to_string()];
    let chain = SecurityChain::from_config(&config);

    assert!(chain.check("document_get", &Credentials::default()).is_ok());
    let err = chain.check("document_delete", &Credentials::default()).unwrap_err();
    assert_eq!(err.code(), FORBIDDEN);
  }

  #[test]
  fn test_allow_list() {
    let mut config = config_with(None);
    config.allowed_tools = vec!["search_documents".to_string()];
    let chain = SecurityChain::from_config(&config);

    assert!(chain.check("search_documents", &Credentials::default()).is_ok());
    assert!(chain.check("document_delete", &Credentials::default()).is_err());
  }

  #[test]
  fn test_rate_limit_empties_bucket() {
    let limiter = RateLimiter::new(2, 0.0);
    let caller = CallerIdentity::anonymous();

    assert!(limiter.check(&caller).is_ok());
    assert!(limiter.check(&caller).is_ok());
    let err = limiter.check(&caller).unwrap_err();
    assert_eq!(err.code(), RATE_LIMITED);
  }

  #[test]
  fn test_rate_limit_per_caller() {
    let limiter = RateLimiter::new(1, 0.0);
    assert!(limiter.check(&CallerIdentity { name: "a".to_string() }).is_ok());
    // A different caller has their own bucket
    assert!(limiter.check(&CallerIdentity { name: "b".to_string() }).is_ok());
    assert!(limiter.check(&CallerIdentity { name: "a".to_string() }).is_err());
  }
}
