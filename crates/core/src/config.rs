//! Configuration for the ContextFrame server and CLI.
//!
//! Config priority: `CONTEXTFRAME_CONFIG` path > user config
//! (~/.config/contextframe/config.toml) > defaults. `CONTEXTFRAME_DATASET_PATH`
//! overrides the dataset URI regardless of which config file loaded.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Transport selection for `serve`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
  #[default]
  Http,
  Stdio,
}

/// Server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
  /// Bind host for the HTTP transport
  pub host: String,

  /// Bind port for the HTTP transport
  pub port: u16,

  /// Transport to use when not given on the command line
  pub transport: Transport,

  /// Per-request deadline in seconds
  pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      host: "127.0.0.1".to_string(),
      port: 8834,
      transport: Transport::Http,
      request_timeout_secs: 30,
    }
  }
}

/// Dataset settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
  /// Dataset URI (file://, s3://, gs://, az://)
  #[serde(skip_serializing_if = "Option::is_none")]
  pub uri: Option<String>,

  /// Vector dimension used when creating datasets
  pub vector_dim: usize,

  /// Storage options forwarded to the backend (credentials, regions, ...)
  #[serde(skip_serializing_if = "HashMap::is_empty")]
  pub storage_options: HashMap<String, String>,
}

impl Default for DatasetConfig {
  fn default() -> Self {
    Self {
      uri: None,
      vector_dim: 384,
      storage_options: HashMap::new(),
    }
  }
}

/// Search defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
  /// Default number of results
  pub default_limit: usize,

  /// Create missing FTS indices on first text search
  pub auto_index: bool,
}

impl Default for SearchConfig {
  fn default() -> Self {
    Self {
      default_limit: 10,
      auto_index: true,
    }
  }
}

/// Security hook settings. All hooks are disabled by default; the chain runs
/// authentication, authorization, rate limiting, and audit in that order.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SecurityConfig {
  /// Master switch for the security chain
  pub enabled: bool,

  /// Static bearer token accepted on the HTTP transport
  #[serde(skip_serializing_if = "Option::is_none")]
  pub bearer_token: Option<String>,

  /// Per-caller API keys: key -> caller name
  #[serde(skip_serializing_if = "HashMap::is_empty")]
  pub api_keys: HashMap<String, String>,

  /// Tools a caller may invoke; empty means all tools
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub allowed_tools: Vec<String>,

  /// Tools denied to every caller (applied after allowed_tools)
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub denied_tools: Vec<String>,

  /// Token-bucket capacity per caller
  pub rate_limit_capacity: u32,

  /// Token-bucket refill per second
  pub rate_limit_refill_per_sec: f64,
}

/// Import/export settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
  /// Records per storage append during batch import
  pub batch_size: usize,
}

impl Default for TransferConfig {
  fn default() -> Self {
    Self { batch_size: 100 }
  }
}

/// ContextFrame configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  pub server: ServerConfig,
  pub dataset: DatasetConfig,
  pub search: SearchConfig,
  pub security: SecurityConfig,
  pub transfer: TransferConfig,
}

impl Config {
  /// Load configuration from the environment-selected file, falling back to
  /// the user config and then defaults. The `CONTEXTFRAME_DATASET_PATH` env
  /// var overrides the dataset URI last.
  pub fn load() -> Self {
    let mut config = Self::load_file().unwrap_or_default();
    if let Ok(uri) = std::env::var("CONTEXTFRAME_DATASET_PATH")
      && !uri.is_empty()
    {
      config.dataset.uri = Some(uri);
    }
    config
  }

  fn load_file() -> Option<Self> {
    for path in [Self::env_config_path(), Self::user_config_path()].into_iter().flatten() {
      if path.exists()
        && let Ok(content) = std::fs::read_to_string(&path)
      {
        match toml::from_str(&content) {
          Ok(config) => return Some(config),
          Err(e) => {
            tracing::warn!("Ignoring malformed config {:?}: {}", path, e);
          }
        }
      }
    }
    None
  }

  fn env_config_path() -> Option<PathBuf> {
    std::env::var("CONTEXTFRAME_CONFIG").ok().map(PathBuf::from)
  }

  /// The user-level config path
  pub fn user_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("XDG_CONFIG_HOME") {
      return Some(PathBuf::from(path).join("contextframe").join("config.toml"));
    }
    dirs::config_dir().map(|p| p.join("contextframe").join("config.toml"))
  }
}
