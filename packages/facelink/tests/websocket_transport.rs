// WebSocket transport against an in-process mock backend

use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Json, Router};
use facelink::config::{BackoffConfig, HttpConfig, WebSocketConfig};
use facelink::transport::websocket::{HANDSHAKE_VIOLATION_REASON, SERVER_REQUESTED_REASON};
use facelink::transport::{HybridSubmitter, SessionCommitClient, WebSocketTransport};
use facelink::{
    ClientConfig, ClientError, CloseReason, FileCaptureSource, Image, Pipeline, PipelineMode,
    RenderSnapshot, Renderer, SessionState, Stage, Submitter, TransportEvent,
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

type ServerSocket = WebSocketStream<TcpStream>;

const WAIT: Duration = Duration::from_secs(5);

/// Accept connections forever, handing each one to `handler` with its index
async fn spawn_server<F, Fut>(handler: F) -> String
where
    F: Fn(usize, ServerSocket) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut index = 0;
        while let Ok((stream, _)) = listener.accept().await {
            if let Ok(ws) = accept_async(stream).await {
                tokio::spawn(handler(index, ws));
                index += 1;
            }
        }
    });

    format!("ws://{}", addr)
}

fn config(endpoint: String) -> WebSocketConfig {
    WebSocketConfig {
        endpoint,
        retry_ms: 50,
        backoff: BackoffConfig::Fixed,
        connect_timeout_ms: 2000,
        handshake_timeout_ms: 2000,
        agent: "facelink-test".to_string(),
    }
}

async fn next_json(ws: &mut ServerSocket) -> Value {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            other => panic!("expected text frame, got {:?}", other),
        }
    }
}

async fn send_json(ws: &mut ServerSocket, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

async fn acknowledge(ws: &mut ServerSocket, session_id: &str) -> Value {
    let hello = next_json(ws).await;
    send_json(
        ws,
        json!({
            "op": 2,
            "data": {"serverId": "srv-1", "serverName": "mock-edge", "sessionId": session_id}
        }),
    )
    .await;
    hello
}

/// Keep the connection open until the client goes away
async fn drain(mut ws: ServerSocket) {
    while let Some(Ok(_)) = ws.next().await {}
}

#[tokio::test]
async fn test_ready_after_handshake() {
    let (hello_tx, mut hello_rx) = mpsc::unbounded_channel();
    let endpoint = spawn_server(move |_, mut ws| {
        let hello_tx = hello_tx.clone();
        async move {
            let hello = acknowledge(&mut ws, "session-1").await;
            hello_tx.send(hello).unwrap();
            drain(ws).await;
        }
    })
    .await;

    let transport = WebSocketTransport::connect(&config(endpoint));
    let session = transport.wait_ready(WAIT).await.unwrap();

    assert_eq!(session.state, SessionState::Ready);
    assert_eq!(session.session_id.as_deref(), Some("session-1"));
    assert_eq!(session.server_name.as_deref(), Some("mock-edge"));
    assert_eq!(session.server_id.as_deref(), Some("srv-1"));
    assert_eq!(transport.session_id().as_deref(), Some("session-1"));

    let hello = hello_rx.recv().await.unwrap();
    assert_eq!(hello["op"], 2);
    assert_eq!(hello["data"]["agent"], "facelink-test");
    assert_eq!(hello["data"]["clientId"], transport.client_id());

    transport.shutdown().await;
    assert_eq!(transport.state(), SessionState::Closed);
    assert!(transport.session_id().is_none());
}

#[tokio::test]
async fn test_bad_handshake_closes_and_reconnects() {
    let (close_tx, mut close_rx) = mpsc::unbounded_channel();
    let endpoint = spawn_server(move |index, mut ws| {
        let close_tx = close_tx.clone();
        async move {
            if index == 0 {
                let _hello = next_json(&mut ws).await;
                // Task update instead of a handshake reply
                send_json(&mut ws, json!({"op": 4, "data": {"faces": []}})).await;
                if let Some(Ok(Message::Close(Some(frame)))) = ws.next().await {
                    close_tx
                        .send((u16::from(frame.code), frame.reason.to_string()))
                        .unwrap();
                }
            } else {
                acknowledge(&mut ws, "session-2").await;
                drain(ws).await;
            }
        }
    })
    .await;

    let transport = WebSocketTransport::connect(&config(endpoint));
    let session = transport.wait_ready(WAIT).await.unwrap();
    assert_eq!(session.session_id.as_deref(), Some("session-2"));

    let (code, reason) = tokio::time::timeout(WAIT, close_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(code, 1002);
    assert_eq!(reason, HANDSHAKE_VIOLATION_REASON);

    transport.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_replaces_session_id() {
    let (hello_tx, mut hello_rx) = mpsc::unbounded_channel();
    let endpoint = spawn_server(move |index, mut ws| {
        let hello_tx = hello_tx.clone();
        async move {
            let session_id = format!("session-{}", index + 1);
            let hello = acknowledge(&mut ws, &session_id).await;
            hello_tx.send(hello["data"]["clientId"].clone()).unwrap();
            if index == 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
                let _ = ws.close(None).await;
            } else {
                drain(ws).await;
            }
        }
    })
    .await;

    let transport = WebSocketTransport::connect(&config(endpoint));
    let first = transport.wait_ready(WAIT).await.unwrap();
    assert_eq!(first.session_id.as_deref(), Some("session-1"));

    let mut events = transport.subscribe();
    let mut session_rx = transport.watch_session();
    let second = tokio::time::timeout(
        WAIT,
        session_rx.wait_for(|s| s.session_id.as_deref() == Some("session-2")),
    )
    .await
    .unwrap()
    .unwrap()
    .clone();
    assert!(second.is_ready());
    assert_eq!(second.client_id, first.client_id);

    // Closed is published before the next Ready
    let mut saw_closed = false;
    while let Ok(event) = events.try_recv() {
        match event {
            TransportEvent::Closed(reason) => {
                assert!(matches!(reason, CloseReason::ServerClosed { .. }));
                saw_closed = true;
            }
            TransportEvent::Ready(session) => {
                assert!(saw_closed);
                assert_eq!(session.session_id.as_deref(), Some("session-2"));
            }
            TransportEvent::TaskUpdate(_) => {}
        }
    }
    assert!(saw_closed);

    // Same client id on both handshakes
    let id1 = hello_rx.recv().await.unwrap();
    let id2 = hello_rx.recv().await.unwrap();
    assert_eq!(id1, id2);

    transport.shutdown().await;
}

#[tokio::test]
async fn test_image_request_is_envelope_then_binary() {
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
    let endpoint = spawn_server(move |_, mut ws| {
        let frames_tx = frames_tx.clone();
        async move {
            acknowledge(&mut ws, "session-1").await;
            while let Some(Ok(message)) = ws.next().await {
                if message.is_text() || message.is_binary() {
                    frames_tx.send(message).unwrap();
                }
            }
        }
    })
    .await;

    let transport = WebSocketTransport::connect(&config(endpoint));
    transport.wait_ready(WAIT).await.unwrap();
    assert!(transport.send_image_request(Image::jpeg(vec![1u8, 2, 3])));

    let first = tokio::time::timeout(WAIT, frames_rx.recv()).await.unwrap().unwrap();
    let second = tokio::time::timeout(WAIT, frames_rx.recv()).await.unwrap().unwrap();

    let envelope: Value = serde_json::from_str(first.to_text().unwrap()).unwrap();
    assert_eq!(envelope["op"], 5);
    assert_eq!(envelope["data"]["contentLength"], 3);
    assert_eq!(envelope["data"]["contentType"], "image/jpeg");
    assert_eq!(second.into_data().as_ref(), &[1u8, 2, 3]);

    transport.shutdown().await;
}

#[tokio::test]
async fn test_task_update_push_is_published() {
    let endpoint = spawn_server(|_, mut ws| async move {
        acknowledge(&mut ws, "session-1").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        // Unknown ops are ignored without dropping the session
        send_json(&mut ws, json!({"op": 9, "data": {}})).await;
        send_json(
            &mut ws,
            json!({"op": 4, "data": {
                "timestamp": "2024-01-01T00:00:00Z",
                "faces": [{"id": "f1", "position": {"x1": 1, "y1": 2, "x2": 3, "y2": 4},
                           "searchResults": [{"distance": 0.91, "label": 12}]}],
                "taskSearch": {"_time": 31, "state": "Completed"}
            }}),
        )
        .await;
        drain(ws).await;
    })
    .await;

    let transport = WebSocketTransport::connect(&config(endpoint));
    let mut events = transport.subscribe();
    transport.wait_ready(WAIT).await.unwrap();

    let task = tokio::time::timeout(WAIT, async {
        loop {
            if let TransportEvent::TaskUpdate(task) = events.recv().await.unwrap() {
                return task;
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(task.face_count(), 1);
    assert_eq!(task.faces[0].top_match().unwrap().label, 12);
    assert_eq!(task.stage(), Stage::Stage2);
    assert!(transport.session().is_ready());

    transport.shutdown().await;
}

#[tokio::test]
async fn test_close_session_is_answered_and_reconnects() {
    let (close_tx, mut close_rx) = mpsc::unbounded_channel();
    let endpoint = spawn_server(move |index, mut ws| {
        let close_tx = close_tx.clone();
        async move {
            acknowledge(&mut ws, &format!("session-{}", index + 1)).await;
            if index == 0 {
                send_json(&mut ws, json!({"op": 1, "code": 4001, "reason": "evicted"})).await;
                if let Some(Ok(Message::Close(Some(frame)))) = ws.next().await {
                    close_tx
                        .send((u16::from(frame.code), frame.reason.to_string()))
                        .unwrap();
                }
            } else {
                drain(ws).await;
            }
        }
    })
    .await;

    let transport = WebSocketTransport::connect(&config(endpoint));
    let mut events = transport.subscribe();

    let reason = tokio::time::timeout(WAIT, async {
        loop {
            if let TransportEvent::Closed(reason) = events.recv().await.unwrap() {
                return reason;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(
        reason,
        CloseReason::ServerRequested {
            code: 4001,
            reason: "evicted".to_string()
        }
    );

    let (code, text) = tokio::time::timeout(WAIT, close_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(code, 1000);
    assert_eq!(text, SERVER_REQUESTED_REASON);

    let mut session_rx = transport.watch_session();
    tokio::time::timeout(
        WAIT,
        session_rx.wait_for(|s| s.session_id.as_deref() == Some("session-2")),
    )
    .await
    .unwrap()
    .unwrap();

    transport.shutdown().await;
}

#[tokio::test]
async fn test_image_request_dropped_without_session() {
    // Bind and drop to get a port nobody listens on
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let transport = WebSocketTransport::connect(&config(format!("ws://{}", addr)));
    assert!(!transport.send_image_request(Image::jpeg(vec![1u8])));
    assert!(transport.wait_ready(Duration::from_millis(300)).await.is_err());
    assert!(transport.session_id().is_none());

    transport.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_starts_within_retry_interval() {
    let endpoint = spawn_server(|index, mut ws| async move {
        acknowledge(&mut ws, &format!("session-{}", index + 1)).await;
        if index == 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = ws.close(None).await;
        } else {
            drain(ws).await;
        }
    })
    .await;

    let retry = Duration::from_millis(200);
    let transport = WebSocketTransport::connect(&WebSocketConfig {
        retry_ms: retry.as_millis() as u64,
        ..config(endpoint)
    });
    let mut session_rx = transport.watch_session();
    transport.wait_ready(WAIT).await.unwrap();

    let (closed_at, connecting_at) = tokio::time::timeout(WAIT, async {
        let mut closed_at = None;
        loop {
            session_rx.changed().await.unwrap();
            let state = session_rx.borrow_and_update().state;
            match (state, closed_at) {
                (SessionState::Closed, None) => closed_at = Some(Instant::now()),
                (SessionState::Connecting, Some(closed)) => return (closed, Instant::now()),
                _ => {}
            }
        }
    })
    .await
    .unwrap();

    let gap = connecting_at - closed_at;
    assert!(gap >= Duration::from_millis(100), "reconnected too early: {:?}", gap);
    assert!(gap <= retry + Duration::from_millis(300), "reconnect took {:?}", gap);

    transport.shutdown().await;
}

struct NullRenderer;

impl Renderer for NullRenderer {
    fn render(&mut self, _snapshot: &RenderSnapshot) {}
}

fn capture_dir(dir: &Path) -> Arc<FileCaptureSource> {
    std::fs::write(dir.join("frame.jpg"), [0xFFu8, 0xD8, 0xFF, 0xE0]).unwrap();
    Arc::new(FileCaptureSource::open(dir).unwrap())
}

#[tokio::test]
async fn test_push_pipeline_stores_pushes_until_ttl() {
    let endpoint = spawn_server(|_, mut ws| async move {
        acknowledge(&mut ws, "session-1").await;
        // Wait for the first submission before pushing
        let _envelope = next_json(&mut ws).await;
        send_json(
            &mut ws,
            json!({"op": 4, "data": {
                "timestamp": "t1",
                "faces": [{"id": "f1", "position": {"x1": 1, "y1": 2, "x2": 3, "y2": 4},
                           "searchResults": [{"distance": 0.91, "label": 12}]}],
                "taskSearch": {"state": "Completed"}
            }}),
        )
        .await;
        drain(ws).await;
    })
    .await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = ClientConfig {
        mode: PipelineMode::Push,
        websocket: config(endpoint),
        ..Default::default()
    };
    config.scheduler.submit_period_ms = 20;
    config.store.ttl_ms = 300;

    let mut pipeline = Pipeline::new(config, capture_dir(dir.path())).unwrap();
    pipeline.start(Box::new(NullRenderer)).unwrap();

    let mut snapshots = pipeline.store().subscribe();
    tokio::time::timeout(WAIT, snapshots.wait_for(|s| s.get(Stage::Stage2).is_some()))
        .await
        .unwrap()
        .unwrap();
    let stored_at = Instant::now();

    let model = pipeline.read_model();
    let stage2 = model.stage2.as_ref().unwrap();
    assert_eq!(stage2.task.timestamp.as_deref(), Some("t1"));
    assert_eq!(stage2.task.faces[0].top_match().unwrap().label, 12);
    // Push submissions return nothing to store directly
    assert!(model.stage1.is_none());
    assert!(model.session.as_ref().unwrap().is_ready());

    tokio::time::timeout(WAIT, snapshots.wait_for(|s| s.get(Stage::Stage2).is_none()))
        .await
        .unwrap()
        .unwrap();
    assert!(stored_at.elapsed() <= Duration::from_millis(300) + Duration::from_secs(1));
    assert!(pipeline.read_model().stage2.is_none());

    pipeline.stop().await;
}

#[derive(Clone, Default)]
struct Commits(Arc<Mutex<Vec<String>>>);

async fn commit(State(commits): State<Commits>, headers: HeaderMap) -> Json<Value> {
    let session_id = headers
        .get("x-websocket-session-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    commits.0.lock().push(session_id);

    Json(json!({
        "timestamp": "committed",
        "faces": [{"id": "f", "position": {"x1": 1, "y1": 1, "x2": 5, "y2": 5}}],
        "taskDetection": {"state": "Completed"}
    }))
}

async fn spawn_commit_backend() -> (String, Commits) {
    let commits = Commits::default();
    let app = Router::new()
        .route("/commit", post(commit))
        .with_state(commits.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}/commit", addr), commits)
}

#[tokio::test]
async fn test_hybrid_pipeline_commits_once_ready() {
    let release = Arc::new(Notify::new());
    let server_release = release.clone();
    let endpoint = spawn_server(move |_, mut ws| {
        let release = server_release.clone();
        async move {
            let _hello = next_json(&mut ws).await;
            // Hold the handshake reply until the test allows it
            release.notified().await;
            send_json(
                &mut ws,
                json!({"op": 2, "data": {"serverName": "mock-edge", "sessionId": "session-h"}}),
            )
            .await;
            drain(ws).await;
        }
    })
    .await;
    let (commit_url, commits) = spawn_commit_backend().await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = ClientConfig {
        mode: PipelineMode::Hybrid,
        websocket: config(endpoint),
        http: HttpConfig {
            commit: commit_url,
            ..Default::default()
        },
        ..Default::default()
    };
    config.scheduler.submit_period_ms = 20;
    let http = config.http.clone();

    let mut pipeline = Pipeline::new(config, capture_dir(dir.path())).unwrap();
    pipeline.start(Box::new(NullRenderer)).unwrap();
    let transport = pipeline.transport().unwrap().clone();

    // Several submission periods pass without a session
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!transport.session().is_ready());
    assert!(commits.0.lock().is_empty());
    assert!(pipeline.is_running());

    let submitter = HybridSubmitter::new(SessionCommitClient::new(&http).unwrap(), transport.clone());
    assert!(matches!(
        submitter.submit(Image::jpeg(vec![1u8])).await,
        Err(ClientError::SessionNotReady)
    ));

    release.notify_one();

    let mut snapshots = pipeline.store().subscribe();
    tokio::time::timeout(WAIT, snapshots.wait_for(|s| s.get(Stage::Stage1).is_some()))
        .await
        .unwrap()
        .unwrap();

    let stage1 = pipeline.read_model().stage1.unwrap();
    assert_eq!(stage1.task.timestamp.as_deref(), Some("committed"));
    assert!(commits.0.lock().iter().all(|id| id == "session-h"));
    assert!(!commits.0.lock().is_empty());

    pipeline.stop().await;
}
