//! Error types for the gateway client.

use concord_rest::RestError;

/// Errors produced by the gateway shard and cluster.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// `WebSocket` transport error.
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    /// REST failure while fetching gateway connection info.
    #[error("REST error: {0}")]
    Rest(#[from] RestError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// `WebSocket` connection closed with a code.
    #[error("Connection closed with code {0}")]
    Closed(u16),

    /// Authentication failed (close code 4004 or HTTP 401).
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// Unrecoverable close code from the gateway. Never retried.
    #[error("Unrecoverable close code: {0}")]
    UnrecoverableClose(u16),

    /// The gateway did not send a Hello payload in time.
    #[error("Timed out waiting for Hello from gateway")]
    HelloTimeout,

    /// Protocol violation from the gateway.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The event consumer went away; there is nobody left to serve.
    #[error("Cluster shut down")]
    Shutdown,
}

impl From<tokio_tungstenite::tungstenite::Error> for GatewayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

impl GatewayError {
    /// `true` for failures that must never be retried.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed | Self::UnrecoverableClose(_) | Self::Shutdown
        )
    }
}
