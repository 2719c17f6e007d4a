// Coupled mode: one loop per frame
//
//   capture -> detect -> store Stage1 -> (guard free?) spawn recognition
//
// Detection is awaited; recognition never is. The loop re-arms as soon as the
// Stage1 result has been applied, so a slow recognition backend can not slow
// the detection cadence, and the guard keeps at most one recognition running.

use super::{InFlightGuard, InFlightPermit, RepeatingTask};
use crate::capture::{CaptureSource, ImageCropper};
use crate::error::ClientResult;
use crate::store::ResultStore;
use crate::transport::{Detector, Recognizer};
use crate::types::{DetectionBox, Image, Stage, Task};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Everything one coupled iteration needs
pub struct CoupledStages {
    pub capture: Arc<dyn CaptureSource>,
    pub detector: Arc<dyn Detector>,
    pub cropper: Arc<dyn ImageCropper>,
    pub recognizer: Arc<dyn Recognizer>,
    pub store: ResultStore,
    pub guard: InFlightGuard,
}

/// Run one iteration.
///
/// Returns the handle of the recognition started by this iteration, if the
/// guard admitted one.
pub async fn run_coupled_iteration(
    stages: &CoupledStages,
    cancel_token: &CancellationToken,
) -> ClientResult<Option<JoinHandle<()>>> {
    let image = stages.capture.capture().await?;

    let (region, failure) = match stages.detector.detect(&image).await {
        Ok(region) => (region, None),
        Err(e) => {
            warn!("Detection failed: {}", e);
            (DetectionBox::default(), Some(e.to_string()))
        }
    };

    if cancel_token.is_cancelled() {
        debug!("Shutdown during detection, discarding result");
        return Ok(None);
    }

    stages.store.put(Stage::Stage1, Task::from_detection(region));
    if let Some(message) = failure {
        stages.store.record_error(Stage::Stage1, message);
    }

    let Some(permit) = stages.guard.try_acquire() else {
        trace!("Recognition in flight, skipping");
        return Ok(None);
    };

    let job = RecognitionJob {
        cropper: stages.cropper.clone(),
        recognizer: stages.recognizer.clone(),
        store: stages.store.clone(),
        cancel_token: cancel_token.clone(),
    };

    Ok(Some(tokio::spawn(job.run(permit, image, region))))
}

/// Spawn the coupled loop
pub fn spawn_coupled_loop(
    stages: Arc<CoupledStages>,
    period: Duration,
    cancel_token: CancellationToken,
) -> RepeatingTask {
    RepeatingTask::spawn("coupled", period, cancel_token, move |token| {
        let stages = stages.clone();
        async move {
            run_coupled_iteration(&stages, &token).await?;
            Ok(())
        }
    })
}

struct RecognitionJob {
    cropper: Arc<dyn ImageCropper>,
    recognizer: Arc<dyn Recognizer>,
    store: ResultStore,
    cancel_token: CancellationToken,
}

impl RecognitionJob {
    async fn run(self, permit: InFlightPermit, image: Image, region: DetectionBox) {
        // Released on every exit path
        let _permit = permit;

        let cropped = match self.cropper.crop(&image, region).await {
            Ok(Some(cropped)) => cropped,
            Ok(None) => {
                trace!("Empty region, skipping recognition");
                return;
            }
            Err(e) => {
                warn!("Crop failed: {}", e);
                return;
            }
        };

        let result = self.recognizer.recognize(&cropped, region).await;

        if self.cancel_token.is_cancelled() {
            debug!("Shutdown during recognition, discarding result");
            return;
        }

        match result {
            Ok(task) => {
                self.store.put(Stage::Stage2, task);
            }
            Err(e) => {
                warn!("Recognition failed: {}", e);
                self.store.record_error(Stage::Stage2, e.to_string());
            }
        }
    }
}
