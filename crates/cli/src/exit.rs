//! Process exit codes: 0 success, 2 invalid args (clap's own), 3 dataset not
//! found, 4 permission denied, 5 network error, 1 anything else.

use db::DbError;

pub const INVALID_ARGS: i32 = 2;
pub const NOT_FOUND: i32 = 3;
pub const PERMISSION_DENIED: i32 = 4;
pub const NETWORK: i32 = 5;

pub fn code_for(error: &anyhow::Error) -> i32 {
  if let Some(db_error) = error.downcast_ref::<DbError>() {
    return match db_error {
      DbError::NotFound(_) => NOT_FOUND,
      DbError::Validation(_) | DbError::Filter(_) | DbError::DimensionMismatch { .. } => INVALID_ARGS,
      DbError::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
      DbError::Lance(e) => storage_code(&e.to_string()),
      _ => 1,
    };
  }
  if let Some(io_error) = error.downcast_ref::<std::io::Error>() {
    return match io_error.kind() {
      std::io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
      std::io::ErrorKind::NotFound => NOT_FOUND,
      std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::ConnectionReset => NETWORK,
      _ => 1,
    };
  }
  if error.downcast_ref::<frame_core::FilterError>().is_some() {
    return INVALID_ARGS;
  }
  1
}

fn storage_code(message: &str) -> i32 {
  let lower = message.to_lowercase();
  if lower.contains("permission") || lower.contains("access denied") || lower.contains("forbidden") {
    PERMISSION_DENIED
  } else if lower.contains("connection") || lower.contains("timed out") || lower.contains("dns") {
    NETWORK
  } else if lower.contains("not found") {
    NOT_FOUND
  } else {
    1
  }
}
