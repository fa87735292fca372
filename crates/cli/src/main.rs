use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use db::{Dataset, DbError};
use frame_core::{Config, Filter, Record, Transport};
use server::{Router, SecurityChain, ToolHandler};
use std::collections::HashMap;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod exit;

#[derive(Parser)]
#[command(name = "contextframe")]
#[command(about = "Document datasets with vector search, collections, and an MCP server")]
struct Cli {
  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Start the MCP server
  Serve {
    /// Transport: http or stdio
    #[arg(long)]
    transport: Option<String>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// Dataset URI (file://, s3://, gs://, az://)
    #[arg(long)]
    dataset: Option<String>,
  },
  /// Dataset management
  Dataset {
    #[command(subcommand)]
    command: DatasetCommands,
  },
  /// Record operations
  Record {
    #[command(subcommand)]
    command: RecordCommands,
  },
  /// Search a dataset
  Search {
    /// Search mode: text, vector, or hybrid
    mode: String,
    /// Dataset URI
    uri: String,
    /// Query text (embedded for vector and hybrid modes)
    query: String,
    #[arg(short, long, default_value = "10")]
    limit: usize,
    /// Restricted SQL filter expression
    #[arg(long)]
    filter: Option<String>,
  },
}

#[derive(Subcommand)]
enum DatasetCommands {
  /// Create an empty dataset
  Create {
    uri: String,
    /// Vector dimension, fixed for the dataset's lifetime
    #[arg(long)]
    dim: Option<usize>,
  },
  /// Show version, row count, fragments, and indices
  Info { uri: String },
  /// Rewrite small fragments
  Compact {
    uri: String,
    #[arg(long, default_value = "1048576")]
    target_rows: usize,
  },
}

#[derive(Subcommand)]
enum RecordCommands {
  /// Add a record
  Add {
    uri: String,
    #[arg(long)]
    title: String,
    #[arg(long)]
    text: Option<String>,
    #[arg(long)]
    uuid: Option<String>,
  },
  /// Fetch a record by uuid
  Get {
    uri: String,
    uuid: String,
    /// Include the binary payload (base64)
    #[arg(long)]
    blob: bool,
  },
  /// Replace a record's title/text
  Update {
    uri: String,
    uuid: String,
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    text: Option<String>,
  },
  /// Delete a record (idempotent)
  Delete { uri: String, uuid: String },
}

#[tokio::main]
async fn main() {
  let cli = Cli::parse();
  let stderr_logs = matches!(
    &cli.command,
    Commands::Serve { transport, .. } if transport.as_deref() == Some("stdio")
  );
  init_logging(stderr_logs);

  match run(cli).await {
    Ok(()) => {}
    Err(e) => {
      eprintln!("error: {:#}", e);
      std::process::exit(exit::code_for(&e));
    }
  }
}

/// Console logging; forced onto stderr for the stdio transport, where stdout
/// carries response frames.
fn init_logging(stderr_only: bool) {
  let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
  if stderr_only {
    tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_writer(std::io::stderr)
      .init();
  } else {
    tracing_subscriber::fmt().with_env_filter(filter).init();
  }
}

async fn run(cli: Cli) -> Result<()> {
  let config = Config::load();

  match cli.command {
    Commands::Serve {
      transport,
      host,
      port,
      dataset,
    } => {
      let uri = dataset
        .or_else(|| config.dataset.uri.clone())
        .context("no dataset URI; pass --dataset or set CONTEXTFRAME_DATASET_PATH")?;
      let dataset = Arc::new(Dataset::open(&uri, &config.dataset.storage_options).await?);
      let config = Arc::new(config);
      let security = Arc::new(SecurityChain::from_config(&config.security));
      let router = Arc::new(Router::new(ToolHandler::new(dataset, config.clone())));

      let transport = match transport.as_deref() {
        Some("http") => Transport::Http,
        Some("stdio") => Transport::Stdio,
        Some(other) => anyhow::bail!("unknown transport: {} (expected http or stdio)", other),
        None => config.server.transport,
      };
      match transport {
        Transport::Http => {
          let host = host.unwrap_or_else(|| config.server.host.clone());
          let port = port.unwrap_or(config.server.port);
          server::serve_http(router, security, &host, port).await?;
        }
        Transport::Stdio => server::serve_stdio(router).await?,
      }
      Ok(())
    }

    Commands::Dataset { command } => match command {
      DatasetCommands::Create { uri, dim } => {
        let dim = dim.unwrap_or(config.dataset.vector_dim);
        Dataset::create(&uri, dim, &config.dataset.storage_options).await?;
        println!("Created dataset at {} (dim {})", uri, dim);
        Ok(())
      }
      DatasetCommands::Info { uri } => {
        let dataset = Dataset::open(&uri, &config.dataset.storage_options).await?;
        let stats = dataset.stats().await?;
        println!("{}", serde_json::to_string_pretty(&stats)?);
        Ok(())
      }
      DatasetCommands::Compact { uri, target_rows } => {
        let dataset = Dataset::open(&uri, &config.dataset.storage_options).await?;
        dataset.compact(target_rows).await?;
        println!("Compacted {}", uri);
        Ok(())
      }
    },

    Commands::Record { command } => match command {
      RecordCommands::Add { uri, title, text, uuid } => {
        let dataset = Dataset::open(&uri, &config.dataset.storage_options).await?;
        let mut record = Record::new(title);
        if let Some(uuid) = uuid {
          record = record.with_uuid(uuid);
        }
        if let Some(text) = text {
          record = record.with_text(text);
        }
        dataset.add(&record).await?;
        println!("{}", record.uuid);
        Ok(())
      }
      RecordCommands::Get { uri, uuid, blob } => {
        let dataset = Dataset::open(&uri, &config.dataset.storage_options).await?;
        match dataset.get(&uuid, blob).await? {
          Some(record) => {
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
          }
          None => Err(DbError::NotFound(format!("record {}", uuid)).into()),
        }
      }
      RecordCommands::Update { uri, uuid, title, text } => {
        let dataset = Dataset::open(&uri, &config.dataset.storage_options).await?;
        let mut record = dataset
          .get(&uuid, true)
          .await?
          .ok_or_else(|| DbError::NotFound(format!("record {}", uuid)))?;
        if let Some(title) = title {
          record.title = title;
        }
        if let Some(text) = text {
          record.text_content = Some(text);
        }
        record.updated_at = chrono::Utc::now().date_naive().format(frame_core::DATE_FORMAT).to_string();
        dataset.update_record(&uuid, &record).await?;
        println!("Updated {}", uuid);
        Ok(())
      }
      RecordCommands::Delete { uri, uuid } => {
        let dataset = Dataset::open(&uri, &config.dataset.storage_options).await?;
        dataset.delete_record(&uuid).await?;
        println!("Deleted {}", uuid);
        Ok(())
      }
    },

    Commands::Search {
      mode,
      uri,
      query,
      limit,
      filter,
    } => {
      let dataset = Dataset::open(&uri, &config.dataset.storage_options).await?;
      let filter = filter.map(|f| Filter::parse(&f)).transpose()?;
      let embedder = embedding::HashEmbedder::new(dataset.vector_dim);

      let hits = match mode.as_str() {
        "text" => {
          dataset
            .search_text(&query, limit, filter.as_ref(), config.search.auto_index)
            .await?
        }
        "vector" => {
          let vector = embed_query(&embedder, &query).await?;
          dataset.search_vector(&vector, limit, filter.as_ref()).await?
        }
        "hybrid" => {
          let vector = embed_query(&embedder, &query).await?;
          dataset
            .search_hybrid(&query, &vector, limit, filter.as_ref(), config.search.auto_index)
            .await?
        }
        other => anyhow::bail!("unknown search mode: {} (expected text, vector, or hybrid)", other),
      };

      for hit in hits {
        println!("{:.4}  {}  {}", hit.score, hit.record.uuid, hit.record.title);
      }
      Ok(())
    }
  }
}

async fn embed_query(embedder: &embedding::HashEmbedder, query: &str) -> Result<Vec<f32>> {
  use embedding::Embedder as _;
  let mut vectors = embedder.embed(&[query]).await.context("embedding query")?;
  vectors.pop().context("embedder returned no vector")
}
