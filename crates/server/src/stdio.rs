//! Stdio transport: line-delimited JSON-RPC frames on stdin/stdout.
//!
//! Single-threaded by contract: one request is processed at a time so frame
//! ordering on the stream is preserved. Log output must go to stderr or a
//! file; anything the server prints on stdout is a response frame.

use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use crate::ServerError;
use crate::router::Router;
use crate::rpc::{PARSE_ERROR, Request, Response};

/// Serve requests from stdin until EOF
pub async fn serve_stdio(router: Arc<Router>) -> Result<(), ServerError> {
  let stdin = tokio::io::stdin();
  let mut stdout = tokio::io::stdout();
  let mut reader = BufReader::new(stdin);
  let mut line = String::new();

  loop {
    line.clear();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
      debug!("stdin closed, shutting down");
      break;
    }

    let trimmed = line.trim();
    if trimmed.is_empty() {
      continue;
    }

    let response = match serde_json::from_str::<Request>(trimmed) {
      Ok(request) => router.handle(request).await,
      Err(e) => {
        warn!("Invalid request JSON: {}", e);
        Response::error(None, PARSE_ERROR, &format!("Parse error: {}", e))
      }
    };

    let json = serde_json::to_string(&response)?;
    stdout.write_all(json.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;
  }

  Ok(())
}
