// Pipeline - wires capture, transport, scheduler loops and the result store
//
// The pipeline manages:
// - Transport lifecycle (WebSocket session for push and hybrid modes)
// - The loops for the configured mode
// - The update forwarder from pushes into the store
// - The render read model
// - Shutdown via one root CancellationToken

use crate::capture::{CaptureSource, ImageCropper, PassthroughCropper};
use crate::config::{ClientConfig, PipelineMode};
use crate::error::{ClientError, ClientResult};
use crate::render::{RenderSnapshot, Renderer};
use crate::scheduler::{
    spawn_coupled_loop, spawn_render_loop, spawn_submission_loop, spawn_update_forwarder,
    CoupledStages, InFlightGuard, RepeatingTask,
};
use crate::store::ResultStore;
use crate::transport::{
    HttpRecognitionClient, HybridSubmitter, Session, SessionCommitClient, Submitter,
    WebSocketTransport,
};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct Pipeline {
    config: ClientConfig,
    capture: Arc<dyn CaptureSource>,
    cropper: Arc<dyn ImageCropper>,
    store: ResultStore,
    transport: Option<Arc<WebSocketTransport>>,

    frame_rate_tx: Option<watch::Sender<u32>>,
    frame_rate_rx: watch::Receiver<u32>,

    cancel_token: CancellationToken,
    loops: Vec<RepeatingTask>,
    forwarder: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Validate the configuration and create the result store.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: ClientConfig, capture: Arc<dyn CaptureSource>) -> ClientResult<Self> {
        config
            .validate()
            .map_err(|e| ClientError::InvalidConfig(e.to_string()))?;

        let store = ResultStore::new(config.store.ttl());
        let (frame_rate_tx, frame_rate_rx) = watch::channel(0);

        Ok(Self {
            config,
            capture,
            cropper: Arc::new(PassthroughCropper),
            store,
            transport: None,
            frame_rate_tx: Some(frame_rate_tx),
            frame_rate_rx,
            cancel_token: CancellationToken::new(),
            loops: Vec::new(),
            forwarder: None,
        })
    }

    /// Replace the cropper used before recognition in coupled mode
    pub fn with_cropper(mut self, cropper: Arc<dyn ImageCropper>) -> Self {
        self.cropper = cropper;
        self
    }

    pub fn mode(&self) -> PipelineMode {
        self.config.mode
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    /// WebSocket transport, once started in push or hybrid mode
    pub fn transport(&self) -> Option<&Arc<WebSocketTransport>> {
        self.transport.as_ref()
    }

    pub fn is_running(&self) -> bool {
        !self.loops.is_empty() && !self.cancel_token.is_cancelled()
    }

    /// Start the loops for the configured mode
    pub fn start(&mut self, renderer: Box<dyn Renderer>) -> ClientResult<()> {
        let Some(frame_rate_tx) = self.frame_rate_tx.take() else {
            warn!("Pipeline already started");
            return Ok(());
        };

        let scheduler = &self.config.scheduler;
        info!(
            "Starting {} pipeline with source {}",
            self.config.mode,
            self.capture.describe()
        );

        match self.config.mode {
            PipelineMode::Coupled => {
                let http = Arc::new(HttpRecognitionClient::new(&self.config.http)?);
                let stages = Arc::new(CoupledStages {
                    capture: self.capture.clone(),
                    detector: http.clone(),
                    cropper: self.cropper.clone(),
                    recognizer: http,
                    store: self.store.clone(),
                    guard: InFlightGuard::new(),
                });
                self.loops.push(spawn_coupled_loop(
                    stages,
                    scheduler.coupled_period(),
                    self.cancel_token.child_token(),
                ));
            }
            PipelineMode::Push | PipelineMode::Hybrid => {
                let transport = Arc::new(WebSocketTransport::connect(&self.config.websocket));
                self.forwarder = Some(spawn_update_forwarder(
                    transport.subscribe(),
                    self.store.clone(),
                    self.cancel_token.child_token(),
                ));

                let submitter: Arc<dyn Submitter> = if self.config.mode == PipelineMode::Hybrid {
                    let commit = SessionCommitClient::new(&self.config.http)?;
                    Arc::new(HybridSubmitter::new(commit, transport.clone()))
                } else {
                    transport.clone()
                };

                self.loops.push(spawn_submission_loop(
                    self.capture.clone(),
                    submitter,
                    self.store.clone(),
                    scheduler.submit_period(),
                    self.cancel_token.child_token(),
                ));
                self.transport = Some(transport);
            }
        }

        let store = self.store.clone();
        let session_rx = self.transport.as_ref().map(|t| t.watch_session());
        let model = move |frame_rate| {
            let session = session_rx.as_ref().map(|rx| rx.borrow().clone());
            RenderSnapshot::new(&store.snapshot(), session, frame_rate)
        };

        self.loops.push(spawn_render_loop(
            renderer,
            model,
            frame_rate_tx,
            scheduler.render_period(),
            self.cancel_token.child_token(),
        ));

        Ok(())
    }

    /// Current read model. Never blocks and never touches the network.
    pub fn read_model(&self) -> RenderSnapshot {
        RenderSnapshot::new(
            &self.store.snapshot(),
            self.session(),
            *self.frame_rate_rx.borrow(),
        )
    }

    pub fn session(&self) -> Option<Session> {
        self.transport.as_ref().map(|t| t.session())
    }

    /// Stop every loop and close the session. Results of work still in flight
    /// are discarded.
    pub async fn stop(&mut self) {
        self.cancel_token.cancel();

        for task in self.loops.drain(..) {
            task.join().await;
        }
        if let Some(forwarder) = self.forwarder.take() {
            if let Err(e) = forwarder.await {
                warn!("Update forwarder join error: {}", e);
            }
        }
        if let Some(transport) = &self.transport {
            transport.shutdown().await;
        }

        info!("Pipeline stopped");
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
