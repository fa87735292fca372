use frame_core::filter::FilterError;
use frame_core::validation::ValidationError;
use lancedb::{Connection, DistanceType, connect};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::schema::{FRAMES_TABLE, frames_schema, vector_dim_of};

#[derive(Error, Debug)]
pub enum DbError {
  #[error("LanceDB error: {0}")]
  Lance(#[from] lancedb::Error),
  #[error("Arrow error: {0}")]
  Arrow(#[from] arrow::error::ArrowError),
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("Not found: {0}")]
  NotFound(String),
  #[error("Duplicate uuid: {0}")]
  DuplicateUuid(String),
  #[error("Schema mismatch: {0}")]
  SchemaMismatch(String),
  #[error("Dimension mismatch: expected {expected}, got {actual}")]
  DimensionMismatch { expected: usize, actual: usize },
  #[error("Filter error: {0}")]
  Filter(#[from] FilterError),
  #[error("Validation error: {0}")]
  Validation(#[from] ValidationError),
  #[error("Version conflict: expected {expected}, dataset is at {actual}")]
  Conflict { expected: u64, actual: u64 },
  #[error("Blob scan attempted: {0}")]
  BlobScan(String),
  #[error("Dataset is read-only: {0}")]
  ReadOnly(String),
  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Vector distance metric, fixed per dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Metric {
  #[default]
  Cosine,
  L2,
  Dot,
}

impl Metric {
  pub fn as_str(&self) -> &'static str {
    match self {
      Metric::Cosine => "cosine",
      Metric::L2 => "l2",
      Metric::Dot => "dot",
    }
  }
}

impl From<Metric> for DistanceType {
  fn from(metric: Metric) -> Self {
    match metric {
      Metric::Cosine => DistanceType::Cosine,
      Metric::L2 => DistanceType::L2,
      Metric::Dot => DistanceType::Dot,
    }
  }
}

impl std::str::FromStr for Metric {
  type Err = String;

  fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "cosine" => Ok(Metric::Cosine),
      "l2" | "euclidean" => Ok(Metric::L2),
      "dot" => Ok(Metric::Dot),
      _ => Err(format!("Unknown metric: {}", s)),
    }
  }
}

/// A versioned, self-contained store of records at a URI.
///
/// Wraps a single LanceDB table named `frames` under the dataset directory.
/// Writers serialize on the commit lock; readers run against the snapshot
/// their query starts on.
pub struct Dataset {
  pub uri: String,
  pub connection: Connection,
  pub vector_dim: usize,
  pub metric: Metric,
  table: lancedb::Table,
  /// Set when checked out at a historical version; all writes are rejected
  read_only: bool,
  commit: Mutex<()>,
}

impl Dataset {
  /// Create a new dataset at `uri` with vector dimension `dim`.
  ///
  /// Fails if the dataset already holds a frames table.
  pub async fn create(uri: &str, dim: usize, storage_options: &HashMap<String, String>) -> Result<Self> {
    let connection = connect_to(uri, storage_options).await?;

    let existing = connection.table_names().execute().await?;
    if existing.contains(&FRAMES_TABLE.to_string()) {
      return Err(DbError::SchemaMismatch(format!("dataset already exists at {}", uri)));
    }

    info!("Creating dataset at {} (dim {})", uri, dim);
    connection
      .create_empty_table(FRAMES_TABLE, frames_schema(dim))
      .execute()
      .await?;
    let table = connection.open_table(FRAMES_TABLE).execute().await?;

    Ok(Self {
      uri: uri.to_string(),
      connection,
      vector_dim: dim,
      metric: Metric::Cosine,
      table,
      read_only: false,
      commit: Mutex::new(()),
    })
  }

  /// Open an existing dataset, recovering the vector dimension from the
  /// stored schema.
  pub async fn open(uri: &str, storage_options: &HashMap<String, String>) -> Result<Self> {
    let connection = connect_to(uri, storage_options).await?;
    let table = connection
      .open_table(FRAMES_TABLE)
      .execute()
      .await
      .map_err(|e| match e {
        lancedb::Error::TableNotFound { .. } => DbError::NotFound(format!("dataset at {}", uri)),
        other => DbError::Lance(other),
      })?;

    let schema = table.schema().await?;
    let vector_dim = vector_dim_of(&schema)
      .ok_or_else(|| DbError::SchemaMismatch("frames table has no fixed-size vector column".to_string()))?;

    debug!("Opened dataset at {} (dim {})", uri, vector_dim);
    Ok(Self {
      uri: uri.to_string(),
      connection,
      vector_dim,
      metric: Metric::Cosine,
      table,
      read_only: false,
      commit: Mutex::new(()),
    })
  }

  /// Open a dataset pinned at a historical version. The handle is read-only.
  pub async fn open_at_version(uri: &str, version: u64, storage_options: &HashMap<String, String>) -> Result<Self> {
    let mut dataset = Self::open(uri, storage_options).await?;
    dataset.table.checkout(version).await?;
    dataset.read_only = true;
    Ok(dataset)
  }

  /// The underlying frames table
  pub(crate) fn table(&self) -> &lancedb::Table {
    &self.table
  }

  /// Whether this handle is pinned at a historical version
  pub fn is_read_only(&self) -> bool {
    self.read_only
  }

  pub(crate) fn ensure_writable(&self) -> Result<()> {
    if self.read_only {
      return Err(DbError::ReadOnly(self.uri.clone()));
    }
    Ok(())
  }

  /// Acquire the exclusive commit lock for the duration of a version bump
  pub(crate) async fn commit_lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
    self.commit.lock().await
  }

  /// Current manifest version
  pub async fn version(&self) -> Result<u64> {
    Ok(self.table.version().await?)
  }

  /// Release the connection. Dropping the handle has the same effect; this
  /// exists for callers that want the close to be explicit.
  pub fn close(self) {
    debug!("Closing dataset at {}", self.uri);
  }

  /// Pin this handle at a historical version. Writes are rejected until
  /// `checkout_latest` is called.
  pub async fn checkout(&mut self, version: u64) -> Result<()> {
    self.table.checkout(version).await?;
    self.read_only = true;
    Ok(())
  }

  /// Return to the latest version and re-enable writes
  pub async fn checkout_latest(&mut self) -> Result<()> {
    self.table.checkout_latest().await?;
    self.read_only = false;
    Ok(())
  }
}

async fn connect_to(uri: &str, storage_options: &HashMap<String, String>) -> Result<Connection> {
  let target = normalize_uri(uri);
  let mut builder = connect(&target);
  for (key, value) in storage_options {
    builder = builder.storage_option(key.clone(), value.clone());
  }
  builder.execute().await.map_err(DbError::Lance)
}

/// `file://` URIs become plain local paths; object-store URIs pass through.
pub fn normalize_uri(uri: &str) -> String {
  match uri.strip_prefix("file://") {
    Some(path) => path.to_string(),
    None => uri.to_string(),
  }
}

/// Classes of storage failure worth retrying
pub(crate) fn is_transient(error: &DbError) -> bool {
  match error {
    DbError::Lance(e) => {
      let msg = e.to_string();
      msg.contains("connection reset")
        || msg.contains("timed out")
        || msg.contains("temporarily unavailable")
        || msg.contains("502")
        || msg.contains("503")
        || msg.contains("504")
    }
    _ => false,
  }
}

pub(crate) const STORAGE_RETRIES: u32 = 3;

/// Retry a storage operation with exponential backoff on transient failures
pub(crate) async fn retry_storage<T, F, Fut>(what: &str, mut f: F) -> Result<T>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T>>,
{
  let mut attempt = 0;
  loop {
    match f().await {
      Ok(value) => return Ok(value),
      Err(e) if is_transient(&e) && attempt < STORAGE_RETRIES => {
        let backoff = Duration::from_millis(100 * 2u64.pow(attempt));
        warn!("{} failed ({}), retrying in {:?}", what, e, backoff);
        tokio::time::sleep(backoff).await;
        attempt += 1;
      }
      Err(e) => return Err(e),
    }
  }
}
