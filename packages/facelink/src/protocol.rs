// Wire protocol for the stateful WebSocket session
//
// Every text frame is a JSON envelope `{"op": <int>, "data": <object>}`.
// Image submissions are two frames: an `ImageRequest` envelope followed
// immediately by one binary frame with the raw image bytes. There is no
// correlation id; the server pairs the binary frame with the preceding
// envelope on the same connection.

use crate::error::{ClientError, ClientResult};
use crate::types::Task;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Server-initiated session closure
pub const OP_CLOSE_SESSION: i64 = 1;
/// Handshake, used in both directions with different payloads
pub const OP_HANDSHAKE: i64 = 2;
/// Server push carrying a full task
pub const OP_TASK_UPDATE: i64 = 4;
/// Client image submission metadata
pub const OP_IMAGE_REQUEST: i64 = 5;

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    op: i64,
    #[serde(default)]
    data: Value,
    // Some servers put the close-session fields next to `op` instead of in `data`
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    reason: Option<String>,
}

/// Messages sent by the client
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Handshake {
        agent: String,
        client_id: String,
    },
    ImageRequest {
        content_length: usize,
        content_type: String,
    },
}

impl ClientMessage {
    pub fn op(&self) -> i64 {
        match self {
            ClientMessage::Handshake { .. } => OP_HANDSHAKE,
            ClientMessage::ImageRequest { .. } => OP_IMAGE_REQUEST,
        }
    }

    pub fn encode(&self) -> ClientResult<String> {
        let data = match self {
            ClientMessage::Handshake { agent, client_id } => json!({
                "agent": agent,
                "clientId": client_id,
            }),
            ClientMessage::ImageRequest {
                content_length,
                content_type,
            } => json!({
                "contentLength": content_length,
                "contentType": content_type,
            }),
        };

        Ok(serde_json::to_string(&json!({ "op": self.op(), "data": data }))?)
    }
}

/// Handshake acknowledgement payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerHandshake {
    #[serde(default)]
    pub server_id: Option<String>,
    #[serde(default)]
    pub server_name: String,
    pub session_id: String,
}

/// Messages received from the server
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    CloseSession { code: i64, reason: String },
    Handshake(ServerHandshake),
    TaskUpdate(Box<Task>),
    /// Operation code this client does not understand; ignored by the transport
    Unknown { op: i64, data: Value },
}

impl ServerMessage {
    pub fn op(&self) -> i64 {
        match self {
            ServerMessage::CloseSession { .. } => OP_CLOSE_SESSION,
            ServerMessage::Handshake(_) => OP_HANDSHAKE,
            ServerMessage::TaskUpdate(_) => OP_TASK_UPDATE,
            ServerMessage::Unknown { op, .. } => *op,
        }
    }

    pub fn decode(text: &str) -> ClientResult<Self> {
        let envelope: RawEnvelope = serde_json::from_str(text)?;

        match envelope.op {
            OP_CLOSE_SESSION => {
                let code = envelope
                    .code
                    .or_else(|| envelope.data.get("code").and_then(Value::as_i64))
                    .unwrap_or(0);
                let reason = envelope
                    .reason
                    .or_else(|| {
                        envelope
                            .data
                            .get("reason")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                    })
                    .unwrap_or_default();
                Ok(ServerMessage::CloseSession { code, reason })
            }
            OP_HANDSHAKE => serde_json::from_value(envelope.data)
                .map(ServerMessage::Handshake)
                .map_err(|e| ClientError::Protocol(format!("Malformed handshake reply: {}", e))),
            OP_TASK_UPDATE => serde_json::from_value(envelope.data)
                .map(|task| ServerMessage::TaskUpdate(Box::new(task)))
                .map_err(|e| ClientError::Protocol(format!("Malformed task update: {}", e))),
            op => Ok(ServerMessage::Unknown {
                op,
                data: envelope.data,
            }),
        }
    }
}
