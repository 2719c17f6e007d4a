// Capture sources and cropping seams
//
// The pipeline never touches a camera directly. A `CaptureSource` yields one
// encoded frame per call; `FileCaptureSource` replays still images from disk
// so the client can run headless.

use crate::error::{ClientError, ClientResult};
use crate::types::{DetectionBox, Image};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Produces frames for the scheduler
#[async_trait]
pub trait CaptureSource: Send + Sync {
    async fn capture(&self) -> ClientResult<Image>;

    /// Human readable description for logs
    fn describe(&self) -> String;
}

/// Cycles through a single image file or every jpg/jpeg/png in a directory
#[derive(Debug)]
pub struct FileCaptureSource {
    root: PathBuf,
    files: Vec<PathBuf>,
    cursor: AtomicUsize,
}

impl FileCaptureSource {
    pub fn open(path: impl AsRef<Path>) -> ClientResult<Self> {
        let root = path.as_ref().to_path_buf();

        let files = if root.is_dir() {
            let mut files: Vec<PathBuf> = std::fs::read_dir(&root)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && content_type_for(p).is_some())
                .collect();
            files.sort();
            files
        } else if root.is_file() {
            if content_type_for(&root).is_none() {
                return Err(ClientError::Capture(format!(
                    "{}: unsupported image type",
                    root.display()
                )));
            }
            vec![root.clone()]
        } else {
            return Err(ClientError::Capture(format!("{}: not found", root.display())));
        };

        if files.is_empty() {
            return Err(ClientError::Capture(format!(
                "{}: no jpg/jpeg/png images",
                root.display()
            )));
        }

        debug!("Capture source {} with {} frame(s)", root.display(), files.len());
        Ok(Self {
            root,
            files,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn frame_count(&self) -> usize {
        self.files.len()
    }
}

#[async_trait]
impl CaptureSource for FileCaptureSource {
    async fn capture(&self) -> ClientResult<Image> {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.files.len();
        let path = &self.files[index];

        let data = tokio::fs::read(path)
            .await
            .map_err(|e| ClientError::Capture(format!("{}: {}", path.display(), e)))?;
        let content_type = content_type_for(path).unwrap_or("application/octet-stream");

        Ok(Image::new(data, content_type))
    }

    fn describe(&self) -> String {
        format!("files:{}", self.root.display())
    }
}

fn content_type_for(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        _ => None,
    }
}

/// Extracts the detected region before recognition
///
/// `None` means there is nothing to recognize and the expensive stage is
/// skipped for this frame.
#[async_trait]
pub trait ImageCropper: Send + Sync {
    async fn crop(&self, image: &Image, region: DetectionBox) -> ClientResult<Option<Image>>;
}

/// Sends the whole frame; the backend crops. Zero-size boxes yield `None`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughCropper;

#[async_trait]
impl ImageCropper for PassthroughCropper {
    async fn crop(&self, image: &Image, region: DetectionBox) -> ClientResult<Option<Image>> {
        if region.width() == 0.0 || region.height() == 0.0 {
            return Ok(None);
        }
        Ok(Some(image.clone()))
    }
}
