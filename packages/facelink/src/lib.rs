pub mod capture;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod protocol;
pub mod render;
pub mod scheduler;
pub mod store;
pub mod transport;
pub mod types;

pub use capture::{CaptureSource, FileCaptureSource, ImageCropper, PassthroughCropper};
pub use config::{ClientConfig, ConfigError, PipelineMode};
pub use error::{ClientError, ClientResult};
pub use pipeline::Pipeline;
pub use render::{FrameRateCounter, RenderSnapshot, Renderer};
pub use scheduler::{InFlightGuard, InFlightPermit, RepeatingTask};
pub use store::{ResultStore, StoreSnapshot};
pub use transport::{
    CloseReason, Detector, Recognizer, Session, SessionState, Submitter, TransportEvent,
};
pub use types::*;
