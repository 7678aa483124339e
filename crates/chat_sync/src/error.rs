use thiserror::Error;

/// Failures of the duplex channel itself. These never propagate past the
/// connection manager as caller-visible errors; they collapse into
/// [`crate::connection::ConnectionState`].
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no transport channel is available")]
    Unavailable,
    #[error("transport credential rejected: {0}")]
    AuthRejected(String),
    #[error("transport channel closed")]
    Closed,
    #[error("transport protocol error: {0}")]
    Protocol(String),
    #[error("transport i/o error: {0}")]
    Io(String),
}

impl TransportError {
    pub fn is_auth(&self) -> bool {
        match self {
            Self::AuthRejected(_) => true,
            Self::Protocol(message) | Self::Io(message) => is_auth_error_message(message),
            _ => false,
        }
    }
}

/// Terminal outcome of a single send attempt. Surfaced to the immediate
/// caller of `send_message`, which alone decides whether to retry or fall
/// back to the request/response path.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("no usable transport; use the request/response fallback")]
    TransportUnavailable,
    #[error("send not acknowledged within {0} ms")]
    AckTimeout(u64),
    #[error("server refused the send: {0}")]
    AckRejected(String),
    #[error("send cancelled before acknowledgement")]
    Cancelled,
}

pub(crate) fn is_auth_error_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("unauthorized")
        || lower.contains("invalid token")
        || lower.contains("credential rejected")
        || lower.contains("401")
        || lower.contains("403")
}

#[cfg(test)]
#[path = "tests/error_tests.rs"]
mod tests;
