// Error types shared by the transport, scheduler and capture layers

use thiserror::Error;

/// Result type for pipeline client operations
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur inside the recognition pipeline client
///
/// None of these are fatal to the process. Transport errors trigger a
/// reconnect, per-call errors are turned into sentinel values by the caller,
/// and precondition errors are retried on the next scheduler tick.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("HTTP {status}: {message}")]
    HttpStatus { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Session not ready: submission requires an active session id")]
    SessionNotReady,

    #[error("Capture failed: {0}")]
    Capture(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ClientError {
    /// Precondition violations are caller mistakes rather than I/O failures.
    pub fn is_precondition(&self) -> bool {
        matches!(self, ClientError::SessionNotReady)
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ClientError::Timeout(e.to_string())
        } else if let Some(status) = e.status() {
            ClientError::HttpStatus {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else if e.is_decode() {
            ClientError::UnexpectedResponse(e.to_string())
        } else {
            ClientError::Network(e.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::WebSocket(e.to_string())
    }
}
