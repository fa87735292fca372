pub mod http;
pub mod registry;
pub mod router;
pub mod rpc;
pub mod security;
pub mod stdio;
pub mod tasks;
pub mod tools;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("JSON error: {0}")]
  Json(#[from] serde_json::Error),
}

pub use http::serve_http;
pub use registry::{ToolDef, builtin_tools, find_tool};
pub use router::Router;
pub use rpc::{Request, Response, RpcError};
pub use security::{CallerIdentity, Credentials, SecurityChain};
pub use stdio::serve_stdio;
pub use tasks::{ProgressEvent, TaskManager, TaskState, TaskStatus};
pub use tools::ToolHandler;
