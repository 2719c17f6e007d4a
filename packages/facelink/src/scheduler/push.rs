// Decoupled (push) mode
//
// Submission and rendering run on independent periods and never wait for each
// other. Results arrive as transport pushes with no correlation to the
// submission that caused them; the forwarder applies them to the store in
// arrival order.

use super::RepeatingTask;
use crate::capture::CaptureSource;
use crate::render::{FrameRateCounter, RenderSnapshot, Renderer};
use crate::store::ResultStore;
use crate::transport::{Submitter, TransportEvent};
use crate::types::Stage;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Capture and submit every `period`, whether or not earlier results arrived.
///
/// A task returned directly by the submitter is stored as Stage1.
pub fn spawn_submission_loop(
    capture: Arc<dyn CaptureSource>,
    submitter: Arc<dyn Submitter>,
    store: ResultStore,
    period: Duration,
    cancel_token: CancellationToken,
) -> RepeatingTask {
    RepeatingTask::spawn("submit", period, cancel_token, move |token| {
        let capture = capture.clone();
        let submitter = submitter.clone();
        let store = store.clone();
        async move {
            let image = capture.capture().await?;
            trace!("Submitting {} byte frame", image.len());

            if let Some(task) = submitter.submit(image).await? {
                if token.is_cancelled() {
                    debug!("Shutdown during submission, discarding reply");
                } else {
                    store.put(Stage::Stage1, task);
                }
            }
            Ok(())
        }
    })
}

/// Refresh the renderer every `period`. No network activity.
///
/// `model` builds the snapshot for the given frame rate; the rate is also
/// published on `frame_rate_tx` once per second.
pub fn spawn_render_loop<M>(
    mut renderer: Box<dyn Renderer>,
    model: M,
    frame_rate_tx: watch::Sender<u32>,
    period: Duration,
    cancel_token: CancellationToken,
) -> RepeatingTask
where
    M: Fn(u32) -> RenderSnapshot + Send + 'static,
{
    let mut counter = FrameRateCounter::new();

    RepeatingTask::spawn("render", period, cancel_token, move |_| {
        if let Some(rate) = counter.tick() {
            frame_rate_tx.send_replace(rate);
        }
        renderer.render(&model(counter.rate()));
        std::future::ready(Ok(()))
    })
}

/// Apply pushed tasks to the store, classified by stage
pub fn spawn_update_forwarder(
    mut events: broadcast::Receiver<TransportEvent>,
    store: ResultStore,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel_token.cancelled() => break,
                event = events.recv() => event,
            };

            match event {
                Ok(TransportEvent::TaskUpdate(task)) => {
                    let stage = task.stage();
                    trace!("Task update with {} face(s) -> {}", task.face_count(), stage);
                    store.put(stage, task);
                }
                Ok(TransportEvent::Ready(session)) => {
                    info!(
                        "Receiving pushes for session {}",
                        session.session_id.as_deref().unwrap_or("-")
                    );
                }
                Ok(TransportEvent::Closed(reason)) => {
                    debug!("Push stream interrupted: {}", reason);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Dropped {} transport events (forwarder lagging)", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("Update forwarder stopped");
    })
}
