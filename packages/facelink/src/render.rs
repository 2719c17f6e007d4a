// Render read model
//
// The renderer is outside the pipeline: it is handed a `RenderSnapshot` on
// every refresh and never reaches back into the store or the transport.

use crate::store::StoreSnapshot;
use crate::transport::Session;
use crate::types::{PipelineResult, Stage};
use std::sync::Arc;
use tokio::time::{Duration, Instant};

const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Everything a renderer may show for one refresh
#[derive(Debug, Clone, Default)]
pub struct RenderSnapshot {
    pub stage1: Option<Arc<PipelineResult>>,
    pub stage2: Option<Arc<PipelineResult>>,
    pub stage1_error: Option<String>,
    pub stage2_error: Option<String>,
    /// Render refreshes during the last full second
    pub frame_rate: u32,
    pub session: Option<Session>,
}

impl RenderSnapshot {
    pub fn new(store: &StoreSnapshot, session: Option<Session>, frame_rate: u32) -> Self {
        Self {
            stage1: store.get(Stage::Stage1).cloned(),
            stage2: store.get(Stage::Stage2).cloned(),
            stage1_error: store.last_error(Stage::Stage1).map(str::to_string),
            stage2_error: store.last_error(Stage::Stage2).map(str::to_string),
            frame_rate,
            session,
        }
    }

    pub fn stage(&self, stage: Stage) -> Option<&Arc<PipelineResult>> {
        match stage {
            Stage::Stage1 => self.stage1.as_ref(),
            Stage::Stage2 => self.stage2.as_ref(),
        }
    }

    fn error(&self, stage: Stage) -> Option<&str> {
        match stage {
            Stage::Stage1 => self.stage1_error.as_deref(),
            Stage::Stage2 => self.stage2_error.as_deref(),
        }
    }

    /// Text overlay: renderer stats, per-stage summary and one line per
    /// searched face. Distances above `match_threshold` are flagged as matches.
    pub fn summary_lines(&self, match_threshold: f64) -> Vec<String> {
        let mut lines = vec![format!("[Renderer] frameRate={}", self.frame_rate)];

        if let Some(session) = &self.session {
            lines.push(format!(
                "[Session] state={} server={} session={}",
                session.state,
                session.server_name.as_deref().unwrap_or("-"),
                session.session_id.as_deref().unwrap_or("-"),
            ));
        }

        for stage in Stage::ALL {
            match self.stage(stage) {
                Some(result) => {
                    let task = &result.task;
                    lines.push(format!(
                        "[{}] {}",
                        stage,
                        task.timestamp.as_deref().unwrap_or("-")
                    ));

                    let subtask_time = match stage {
                        Stage::Stage1 => task.task_detection.as_ref().and_then(|t| t.time.as_ref()),
                        Stage::Stage2 => task.time.as_ref(),
                    };
                    lines.push(format!(
                        "[{}] Count={} Time={}",
                        stage,
                        task.face_count(),
                        subtask_time
                            .map(ToString::to_string)
                            .unwrap_or_else(|| "-".to_string())
                    ));

                    if stage == Stage::Stage2 {
                        for face in &task.faces {
                            if let Some(top) = face.top_match() {
                                let verdict = if top.distance > match_threshold {
                                    "match"
                                } else {
                                    "no match"
                                };
                                lines.push(format!(
                                    "[Face] {} => Label={}, Distance={} ({})",
                                    face.position, top.label, top.distance, verdict
                                ));
                            }
                        }
                    }
                }
                None => lines.push(format!("[{}] No recent response", stage)),
            }

            if let Some(error) = self.error(stage) {
                lines.push(format!("[{}] Error: {}", stage, error));
            }
        }

        lines
    }
}

/// Draws the read model
pub trait Renderer: Send + 'static {
    fn render(&mut self, snapshot: &RenderSnapshot);
}

/// Counts refreshes and reports them once per second
#[derive(Debug)]
pub struct FrameRateCounter {
    window_start: Instant,
    frames: u32,
    rate: u32,
}

impl Default for FrameRateCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameRateCounter {
    pub fn new() -> Self {
        Self {
            window_start: Instant::now(),
            frames: 0,
            rate: 0,
        }
    }

    /// Count one frame. Returns the new rate when a window closes.
    pub fn tick(&mut self) -> Option<u32> {
        self.frames += 1;

        let now = Instant::now();
        if now.duration_since(self.window_start) >= RATE_WINDOW {
            self.rate = self.frames;
            self.frames = 0;
            self.window_start = now;
            Some(self.rate)
        } else {
            None
        }
    }

    /// Rate from the last completed window
    pub fn rate(&self) -> u32 {
        self.rate
    }
}
