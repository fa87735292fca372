//! HTTP transport: one JSON-RPC endpoint plus the SSE progress stream.
//!
//! `POST /mcp/v1/jsonrpc` carries `{jsonrpc, method, params, id}` bodies.
//! `GET /mcp/v1/sse/progress/{task_id}` streams progress frames for async
//! tools. Requests run on the multi-threaded runtime; a client disconnect
//! drops the request future, cancelling in-flight work cooperatively.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use futures::Stream;
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::ServerError;
use crate::router::Router;
use crate::rpc::{PARSE_ERROR, Request, Response};
use crate::security::{Credentials, SecurityChain};
use crate::tasks::{ProgressEvent, TaskState};

#[derive(Clone)]
struct AppState {
  router: Arc<Router>,
  security: Arc<SecurityChain>,
}

/// Bind and serve the HTTP transport until the process terminates
pub async fn serve_http(
  router: Arc<Router>,
  security: Arc<SecurityChain>,
  host: &str,
  port: u16,
) -> Result<(), ServerError> {
  let state = AppState { router, security };
  let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

  let app = axum::Router::new()
    .route("/mcp/v1/jsonrpc", post(handle_jsonrpc))
    .route("/mcp/v1/sse/progress/{task_id}", get(handle_progress))
    .layer(cors)
    .with_state(state);

  let listener = tokio::net::TcpListener::bind((host, port)).await?;
  info!("MCP server listening on http://{}:{}", host, port);
  axum::serve(listener, app).await?;
  Ok(())
}

async fn handle_jsonrpc(State(state): State<AppState>, headers: HeaderMap, body: String) -> Json<Response> {
  let request: Request = match serde_json::from_str(&body) {
    Ok(request) => request,
    Err(e) => {
      warn!("Invalid request JSON: {}", e);
      return Json(Response::error(None, PARSE_ERROR, &format!("Parse error: {}", e)));
    }
  };

  let credentials = credentials_from_headers(&headers);
  if let Err(e) = state.security.check(&request.method, &credentials) {
    return Json(Response::error_with(
      request.id,
      e.code(),
      &e.to_string(),
      "security",
      &request.method,
    ));
  }

  Json(state.router.handle(request).await)
}

fn credentials_from_headers(headers: &HeaderMap) -> Credentials {
  let bearer_token = headers
    .get("authorization")
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.strip_prefix("Bearer "))
    .map(String::from);
  let api_key = headers
    .get("x-api-key")
    .and_then(|v| v.to_str().ok())
    .map(String::from);
  Credentials { bearer_token, api_key }
}

async fn handle_progress(
  State(state): State<AppState>,
  Path(task_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
  let Some((status, receiver)) = state.router.handler().tasks.subscribe(&task_id) else {
    return Err(StatusCode::NOT_FOUND);
  };

  // A task that already finished yields its stored terminal event; otherwise
  // the live channel is drained until a terminal frame arrives. Intermediate
  // frames may be dropped for lagging consumers (bounded broadcast), but the
  // terminal frame always lands.
  let initial = if status.state == TaskState::Running {
    None
  } else {
    Some(ProgressEvent {
      event: match status.state {
        TaskState::Complete => "complete".to_string(),
        _ => "error".to_string(),
      },
      task_id: status.task_id.clone(),
      percent: Some(status.percent),
      message: status.message.clone(),
    })
  };

  let stream = futures::stream::unfold(
    (receiver, initial, false),
    |(mut receiver, initial, done)| async move {
      if done {
        return None;
      }
      if let Some(event) = initial {
        return Some((sse_event(&event), (receiver, None, true)));
      }
      loop {
        match receiver.recv().await {
          Ok(event) => {
            let terminal = event.event != "progress";
            return Some((sse_event(&event), (receiver, None, terminal)));
          }
          Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
            warn!("SSE consumer lagged, skipped {} events", skipped);
            continue;
          }
          Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
        }
      }
    },
  );

  Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn sse_event(event: &ProgressEvent) -> Result<Event, Infallible> {
  let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
  Ok(Event::default().event(event.event.clone()).data(data))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_credentials_extraction() {
    let mut headers = HeaderMap::new();
    headers.insert("authorization", "Bearer secret-token".parse().unwrap());
    headers.insert("x-api-key", "k-1".parse().unwrap());

    let credentials = credentials_from_headers(&headers);
    assert_eq!(credentials.bearer_token.as_deref(), Some("secret-token"));
    assert_eq!(credentials.api_key.as_deref(), Some("k-1"));
  }

  #[test]
  fn test_credentials_absent() {
    let credentials = credentials_from_headers(&HeaderMap::new());
    assert!(credentials.bearer_token.is_none());
    assert!(credentials.api_key.is_none());
  }
}
