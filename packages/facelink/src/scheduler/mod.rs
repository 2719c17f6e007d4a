// Scheduler - rate-bounded loops driving capture and submission
//
// Every loop is a `RepeatingTask`: a spawned task that owns a cancellation
// token, checks it before each iteration and re-arms its timer only after the
// iteration has finished. A failing iteration is logged and the next one runs
// at the normal period.
//
// - `coupled`: capture, detect, store Stage1, then single-flight recognition
// - `push`: unconditional submission, render refresh and push forwarding

pub mod coupled;
pub mod push;

pub use coupled::{run_coupled_iteration, spawn_coupled_loop, CoupledStages};
pub use push::{spawn_render_loop, spawn_submission_loop, spawn_update_forwarder};

use crate::error::ClientResult;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Periodic task with an owned shutdown token
pub struct RepeatingTask {
    name: String,
    cancel_token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RepeatingTask {
    /// Spawn `tick` every `period` until `cancel_token` is cancelled.
    ///
    /// `tick` receives the token so work finishing after shutdown can check it
    /// again before touching shared state.
    pub fn spawn<F, Fut>(
        name: impl Into<String>,
        period: Duration,
        cancel_token: CancellationToken,
        mut tick: F,
    ) -> Self
    where
        F: FnMut(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ClientResult<()>> + Send + 'static,
    {
        let name = name.into();
        let loop_name = name.clone();
        let token = cancel_token.clone();

        let handle = tokio::spawn(async move {
            debug!("Loop {} started (period {:?})", loop_name, period);
            loop {
                if token.is_cancelled() {
                    break;
                }

                if let Err(e) = tick(token.clone()).await {
                    if e.is_precondition() {
                        debug!("Loop {} skipped iteration: {}", loop_name, e);
                    } else {
                        warn!("Loop {} iteration failed: {}", loop_name, e);
                    }
                }

                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                }
            }
            debug!("Loop {} stopped", loop_name);
        });

        Self {
            name,
            cancel_token,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop scheduling further iterations. The current one, if any, finishes.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Wait for the loop task to exit
    pub async fn join(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Loop {} join error: {}", self.name, e);
            }
        }
    }
}

impl Drop for RepeatingTask {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Single-flight admission for one class of expensive operation
///
/// At most one `InFlightPermit` exists per guard at any time. The flag is
/// cleared when the permit is dropped, on success, failure and panic alike.
#[derive(Debug, Clone, Default)]
pub struct InFlightGuard {
    busy: Arc<AtomicBool>,
}

impl InFlightGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> Option<InFlightPermit> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlightPermit {
                busy: self.busy.clone(),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub struct InFlightPermit {
    busy: Arc<AtomicBool>,
}

impl Drop for InFlightPermit {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}
