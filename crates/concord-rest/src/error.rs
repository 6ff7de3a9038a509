//! Error types for the REST dispatcher.

/// Errors produced by the REST dispatcher.
///
/// Rate limits (429) never surface here: they are absorbed by the
/// dispatcher and appear to callers only as added latency.
#[derive(Debug, thiserror::Error)]
pub enum RestError {
    /// Structured error from the remote API (body carried an error code).
    ///
    /// Never retried automatically.
    #[error("API error {code} on {method} {path}: {message}")]
    Api {
        /// Machine-readable error code from the response body.
        code: i64,
        /// Human-readable message from the response body.
        message: String,
        /// HTTP status of the response.
        status: u16,
        /// Request method.
        method: String,
        /// Request path (unnormalized).
        path: String,
    },

    /// HTTP-level failure without a structured error body.
    #[error("HTTP {status} on {method} {path}")]
    Http {
        /// HTTP status of the response.
        status: u16,
        /// Raw response body.
        body: String,
        /// Request method.
        method: String,
        /// Request path (unnormalized).
        path: String,
    },

    /// A single attempt exceeded the hard request timeout.
    #[error("request timed out (>{timeout_ms}ms) on {method} {path}")]
    Timeout {
        /// The attempt timeout in milliseconds.
        timeout_ms: u64,
        /// Request method.
        method: String,
        /// Request path (unnormalized).
        path: String,
    },

    /// Transport-level failure from the HTTP client.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// A success-path body failed to parse as JSON. Terminal, not retried.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The call was dropped before it could be dispatched.
    #[error("request dropped before dispatch")]
    Dropped,
}

impl RestError {
    /// HTTP status associated with this error, if any.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } | Self::Http { status, .. } => Some(*status),
            Self::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}
