use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse failure class the server attaches to an error frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    RateLimited,
    Internal,
}

/// Error payload carried on the wire inside `ServerEvent::Error`. Also a
/// proper error type so consumers can bubble it with `?`.
#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[error("{code:?}: {message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}
