// Transports to the recognition backend
//
// - `websocket`: stateful session with handshake, asynchronous task pushes and
//   automatic reconnect
// - `http`: stateless request/response calls returning sentinel values on failure,
//   plus session-bound commits for hybrid mode
// - `reconnect`: pluggable reconnect delay policies
//
// The traits at the bottom are the seams the scheduler drives; both transports
// implement the ones that fit them.

pub mod http;
pub mod reconnect;
pub mod websocket;

pub use http::{HttpRecognitionClient, HybridSubmitter, SessionCommitClient};
pub use reconnect::{ExponentialBackoff, FixedInterval, ReconnectPolicy};
pub use websocket::WebSocketTransport;

use crate::error::ClientResult;
use crate::types::{DetectionBox, Image, Task};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of one logical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Closed,
    Connecting,
    HandshakeSent,
    Ready,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Closed => write!(f, "closed"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::HandshakeSent => write!(f, "handshake_sent"),
            SessionState::Ready => write!(f, "ready"),
        }
    }
}

/// Session identity as seen by the client
///
/// `client_id` is stable across reconnects; everything else is reset on every
/// disconnect and filled in by the next handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub client_id: String,
    pub session_id: Option<String>,
    pub server_name: Option<String>,
    pub server_id: Option<String>,
    pub state: SessionState,
}

impl Session {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            session_id: None,
            server_name: None,
            server_id: None,
            state: SessionState::Closed,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }
}

/// Why a connection ended
#[derive(Debug, Clone, PartialEq)]
pub enum CloseReason {
    /// The physical connection could not be opened
    ConnectFailed(String),
    /// First reply was not a valid handshake acknowledgement
    ProtocolViolation(String),
    /// The server pushed a close-session message
    ServerRequested { code: i64, reason: String },
    /// WebSocket close frame from the server
    ServerClosed { code: u16, reason: String },
    /// Read/write failure or stream end
    Transport(String),
    /// Local shutdown; no reconnect follows
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::ConnectFailed(e) => write!(f, "connect failed: {}", e),
            CloseReason::ProtocolViolation(e) => write!(f, "protocol violation: {}", e),
            CloseReason::ServerRequested { code, reason } => {
                write!(f, "server requested closure: {} {}", code, reason)
            }
            CloseReason::ServerClosed { code, reason } => {
                write!(f, "closed by server: {} {}", code, reason)
            }
            CloseReason::Transport(e) => write!(f, "transport error: {}", e),
            CloseReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Events published by the WebSocket transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Ready(Session),
    TaskUpdate(Task),
    Closed(CloseReason),
}

/// Cheap per-frame operation
#[async_trait]
pub trait Detector: Send + Sync {
    async fn detect(&self, image: &Image) -> ClientResult<DetectionBox>;
}

/// Expensive operation guarded by single-flight admission
#[async_trait]
pub trait Recognizer: Send + Sync {
    async fn recognize(&self, image: &Image, region: DetectionBox) -> ClientResult<Task>;
}

/// Submission used by the decoupled loop
///
/// Returns a task when the submission itself answers with one (HTTP commit),
/// `None` when results only arrive later as pushes.
#[async_trait]
pub trait Submitter: Send + Sync {
    async fn submit(&self, image: Image) -> ClientResult<Option<Task>>;
}
