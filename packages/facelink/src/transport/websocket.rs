// Stateful WebSocket transport
//
// One background task owns the physical connection and is the only writer of
// session state. It runs the state machine
//
//   Closed -> Connecting -> HandshakeSent -> Ready -> Closed -> ...
//
// and reconnects after every close using the configured `ReconnectPolicy`.
// The public handle only reads session snapshots (watch channel), queues image
// submissions (mpsc) and hands out event subscriptions (broadcast).

use super::reconnect::ReconnectPolicy;
use super::{CloseReason, Session, SessionState, Submitter, TransportEvent};
use crate::config::WebSocketConfig;
use crate::error::{ClientError, ClientResult};
use crate::protocol::{ClientMessage, ServerHandshake, ServerMessage};
use crate::types::{Image, Task};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

const EVENT_CAPACITY: usize = 256;

/// Close reason sent when the first reply is not a handshake acknowledgement
pub const HANDSHAKE_VIOLATION_REASON: &str = "Expecting handshake response";
/// Close reason sent after a server close-session push
pub const SERVER_REQUESTED_REASON: &str = "Server requested closure";

enum Command {
    SendImage(Image),
}

/// Handle to a reconnecting WebSocket session
///
/// Dropping the handle cancels the background connection task.
pub struct WebSocketTransport {
    client_id: String,
    endpoint: String,
    session_rx: watch::Receiver<Session>,
    command_tx: mpsc::UnboundedSender<Command>,
    events_tx: broadcast::Sender<TransportEvent>,
    cancel_token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketTransport {
    /// Start connecting with the policy from `config`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(config: &WebSocketConfig) -> Self {
        Self::with_policy(config, config.reconnect_policy())
    }

    pub fn with_policy(config: &WebSocketConfig, policy: Box<dyn ReconnectPolicy>) -> Self {
        let client_id = uuid::Uuid::new_v4().to_string();
        let (session_tx, session_rx) = watch::channel(Session::new(client_id.clone()));
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let cancel_token = CancellationToken::new();

        let actor = ConnectionActor {
            endpoint: config.endpoint.clone(),
            agent: config.agent.clone(),
            client_id: client_id.clone(),
            connect_timeout: config.connect_timeout(),
            handshake_timeout: config.handshake_timeout(),
            policy,
            attempt: 0,
            session_tx,
            events_tx: events_tx.clone(),
            command_rx,
            cancel_token: cancel_token.clone(),
        };

        let handle = tokio::spawn(actor.run());

        Self {
            client_id,
            endpoint: config.endpoint.clone(),
            session_rx,
            command_tx,
            events_tx,
            cancel_token,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Identifier sent in every handshake; stable across reconnects
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Current session snapshot
    pub fn session(&self) -> Session {
        self.session_rx.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.session_rx.borrow().state
    }

    /// Session id of the current connection, only while `Ready`
    pub fn session_id(&self) -> Option<String> {
        let session = self.session_rx.borrow();
        if session.is_ready() {
            session.session_id.clone()
        } else {
            None
        }
    }

    pub fn watch_session(&self) -> watch::Receiver<Session> {
        self.session_rx.clone()
    }

    /// Subscribe to ready/task-update/closed events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events_tx.subscribe()
    }

    /// Wait until the session is `Ready`
    pub async fn wait_ready(&self, timeout: Duration) -> ClientResult<Session> {
        let mut rx = self.session_rx.clone();
        let wait = async move {
            rx.wait_for(Session::is_ready)
                .await
                .map(|session| session.clone())
                .map_err(|_| ClientError::ChannelClosed)
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ClientError::Timeout(format!("session not ready after {:?}", timeout)))?
    }

    /// Submit an image for processing.
    ///
    /// Silently dropped unless the session is `Ready`; delivery is never
    /// guaranteed and results arrive later, if at all, as task updates.
    /// Returns whether the request was queued.
    pub fn send_image_request(&self, image: Image) -> bool {
        if !self.session_rx.borrow().is_ready() {
            debug!("Session not ready, dropping image request");
            return false;
        }

        self.command_tx.send(Command::SendImage(image)).is_ok()
    }

    /// Close the connection and stop reconnecting
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("WebSocket transport task join error: {}", e);
            }
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

#[async_trait]
impl Submitter for WebSocketTransport {
    async fn submit(&self, image: Image) -> ClientResult<Option<Task>> {
        self.send_image_request(image);
        Ok(None)
    }
}

/// Background task owning the physical connection
struct ConnectionActor {
    endpoint: String,
    agent: String,
    client_id: String,
    connect_timeout: Duration,
    handshake_timeout: Duration,
    policy: Box<dyn ReconnectPolicy>,
    attempt: u32,
    session_tx: watch::Sender<Session>,
    events_tx: broadcast::Sender<TransportEvent>,
    command_rx: mpsc::UnboundedReceiver<Command>,
    cancel_token: CancellationToken,
}

impl ConnectionActor {
    async fn run(mut self) {
        loop {
            if self.cancel_token.is_cancelled() {
                break;
            }

            self.set_state(SessionState::Connecting);
            info!("Connecting to WebSocket: {}", self.endpoint);

            let reason = self.connect_and_serve().await;
            self.mark_closed(&reason);

            if reason == CloseReason::Shutdown || self.cancel_token.is_cancelled() {
                break;
            }

            // Submissions queued while the session was going down are dropped
            while self.command_rx.try_recv().is_ok() {}

            let delay = self.policy.delay(self.attempt);
            self.attempt = self.attempt.saturating_add(1);
            info!("WebSocket disconnected, reconnecting in {:?}...", delay);

            tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(SessionState::Closed);
        debug!("WebSocket transport task ended");
    }

    async fn connect_and_serve(&mut self) -> CloseReason {
        let connect = tokio::time::timeout(self.connect_timeout, connect_async(self.endpoint.as_str()));

        let ws_stream = tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => return CloseReason::Shutdown,
            result = connect => match result {
                Ok(Ok((stream, _))) => stream,
                Ok(Err(e)) => return CloseReason::ConnectFailed(e.to_string()),
                Err(_) => {
                    return CloseReason::ConnectFailed(format!(
                        "timed out after {:?}",
                        self.connect_timeout
                    ))
                }
            }
        };

        let (mut write, mut read) = ws_stream.split();

        let hello = ClientMessage::Handshake {
            agent: self.agent.clone(),
            client_id: self.client_id.clone(),
        };
        let hello = match hello.encode() {
            Ok(json) => json,
            Err(e) => return CloseReason::Transport(format!("Failed to encode handshake: {}", e)),
        };
        if let Err(e) = write.send(Message::Text(hello.into())).await {
            return CloseReason::Transport(e.to_string());
        }
        self.set_state(SessionState::HandshakeSent);

        let ack = match self.await_handshake(&mut read).await {
            Ok(ack) => ack,
            Err(reason) => {
                if let CloseReason::ProtocolViolation(detail) = &reason {
                    error!("Server failed to complete handshake: {}", detail);
                    let _ = write
                        .send(close_message(CloseCode::Protocol, HANDSHAKE_VIOLATION_REASON))
                        .await;
                }
                return reason;
            }
        };

        let session = self.mark_ready(ack);
        info!(
            "Session ready: server={} session={}",
            session.server_name.as_deref().unwrap_or("-"),
            session.session_id.as_deref().unwrap_or("-")
        );

        self.serve(&mut write, &mut read).await
    }

    /// Read the first application message, which must acknowledge the handshake
    async fn await_handshake(&self, read: &mut WsRead) -> Result<ServerHandshake, CloseReason> {
        let first = tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => return Err(CloseReason::Shutdown),
            result = tokio::time::timeout(self.handshake_timeout, next_text(read)) => match result {
                Ok(text) => text?,
                Err(_) => {
                    return Err(CloseReason::ProtocolViolation(format!(
                        "no handshake reply within {:?}",
                        self.handshake_timeout
                    )))
                }
            }
        };

        match ServerMessage::decode(&first) {
            Ok(ServerMessage::Handshake(ack)) => Ok(ack),
            Ok(other) => Err(CloseReason::ProtocolViolation(format!(
                "expected handshake reply, got op {}",
                other.op()
            ))),
            Err(e) => Err(CloseReason::ProtocolViolation(e.to_string())),
        }
    }

    async fn serve(&mut self, write: &mut WsWrite, read: &mut WsRead) -> CloseReason {
        loop {
            tokio::select! {
                biased;

                _ = self.cancel_token.cancelled() => {
                    let _ = write.send(close_message(CloseCode::Normal, "Client shutdown")).await;
                    return CloseReason::Shutdown;
                }

                command = self.command_rx.recv() => match command {
                    Some(Command::SendImage(image)) => {
                        if let Err(e) = write_image_request(write, image).await {
                            return CloseReason::Transport(e.to_string());
                        }
                    }
                    None => return CloseReason::Shutdown,
                },

                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => match ServerMessage::decode(&text) {
                        Ok(ServerMessage::TaskUpdate(task)) => {
                            let _ = self.events_tx.send(TransportEvent::TaskUpdate(*task));
                        }
                        Ok(ServerMessage::CloseSession { code, reason }) => {
                            error!("Server requested session closure: {} {}", code, reason);
                            let _ = write
                                .send(close_message(CloseCode::Normal, SERVER_REQUESTED_REASON))
                                .await;
                            return CloseReason::ServerRequested { code, reason };
                        }
                        Ok(ServerMessage::Handshake(_)) => {
                            warn!("Ignoring repeated handshake reply on ready session");
                        }
                        Ok(ServerMessage::Unknown { op, .. }) => {
                            warn!("Message handling not implemented for op {}", op);
                        }
                        Err(e) => {
                            error!("Failed to parse WebSocket message: {}", e);
                        }
                    },
                    Some(Ok(Message::Binary(_))) => {
                        warn!("Received binary WebSocket message (not supported)");
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.to_string()))
                            .unwrap_or((1005, String::new()));
                        info!("WebSocket closed by server: {} {}", code, reason);
                        return CloseReason::ServerClosed { code, reason };
                    }
                    Some(Ok(_)) => {
                        // Ping/Pong are answered by tungstenite
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error: {}", e);
                        return CloseReason::Transport(e.to_string());
                    }
                    None => return CloseReason::Transport("stream ended".to_string()),
                },
            }
        }
    }

    fn set_state(&self, state: SessionState) {
        self.session_tx.send_modify(|session| session.state = state);
    }

    fn mark_ready(&mut self, ack: ServerHandshake) -> Session {
        self.session_tx.send_modify(|session| {
            session.session_id = Some(ack.session_id);
            session.server_name = Some(ack.server_name);
            session.server_id = ack.server_id;
            session.state = SessionState::Ready;
        });
        self.attempt = 0;

        let session = self.session_tx.borrow().clone();
        let _ = self.events_tx.send(TransportEvent::Ready(session.clone()));
        session
    }

    fn mark_closed(&self, reason: &CloseReason) {
        if *reason != CloseReason::Shutdown {
            error!("WebSocket closed: {}", reason);
        }

        self.session_tx.send_modify(|session| {
            session.session_id = None;
            session.server_name = None;
            session.server_id = None;
            session.state = SessionState::Closed;
        });
        let _ = self.events_tx.send(TransportEvent::Closed(reason.clone()));
    }
}

/// Next text frame, skipping control frames
async fn next_text(read: &mut WsRead) -> Result<String, CloseReason> {
    while let Some(message) = read.next().await {
        match message {
            Ok(Message::Text(text)) => return Ok(text.to_string()),
            Ok(Message::Binary(_)) => {
                return Err(CloseReason::ProtocolViolation(
                    "binary frame before handshake reply".to_string(),
                ))
            }
            Ok(Message::Close(frame)) => {
                let (code, reason) = frame
                    .map(|f| (u16::from(f.code), f.reason.to_string()))
                    .unwrap_or((1005, String::new()));
                return Err(CloseReason::ServerClosed { code, reason });
            }
            Ok(_) => continue,
            Err(e) => return Err(CloseReason::Transport(e.to_string())),
        }
    }

    Err(CloseReason::Transport("stream ended".to_string()))
}

/// Metadata envelope followed immediately by the raw image frame
async fn write_image_request(write: &mut WsWrite, image: Image) -> ClientResult<()> {
    let metadata = ClientMessage::ImageRequest {
        content_length: image.len(),
        content_type: image.content_type.clone(),
    }
    .encode()?;

    write.feed(Message::Text(metadata.into())).await?;
    write.feed(Message::Binary(image.data)).await?;
    write.flush().await?;
    Ok(())
}

fn close_message(code: CloseCode, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }))
}
