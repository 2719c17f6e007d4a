use crate::transport::reconnect::{ExponentialBackoff, FixedInterval, ReconnectPolicy};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// How the scheduler drives capture and submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PipelineMode {
    /// One loop: capture, detect over HTTP, then single-flight recognition
    Coupled,
    /// Render loop plus an unconditional submission loop over the WebSocket session
    #[default]
    Push,
    /// HTTP commits bound to the WebSocket session id, results pushed back
    Hybrid,
}

impl FromStr for PipelineMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "coupled" => Ok(PipelineMode::Coupled),
            "push" => Ok(PipelineMode::Push),
            "hybrid" => Ok(PipelineMode::Hybrid),
            other => Err(ConfigError::InvalidValue(format!(
                "unknown pipeline mode '{}' (expected coupled, push or hybrid)",
                other
            ))),
        }
    }
}

impl fmt::Display for PipelineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineMode::Coupled => write!(f, "coupled"),
            PipelineMode::Push => write!(f, "push"),
            PipelineMode::Hybrid => write!(f, "hybrid"),
        }
    }
}

/// Reconnect delay strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackoffConfig {
    /// Same delay before every attempt
    #[default]
    Fixed,
    /// Doubling delay starting at `retry_ms`, capped at `max_ms`
    Exponential { max_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    pub endpoint: String,
    /// Delay before reconnecting after any disconnect
    pub retry_ms: u64,
    pub backoff: BackoffConfig,
    pub connect_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    /// Agent label sent in the handshake
    pub agent: String,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            retry_ms: 2000,
            backoff: BackoffConfig::Fixed,
            connect_timeout_ms: 10_000,
            handshake_timeout_ms: 10_000,
            agent: format!("facelink/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl WebSocketConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn reconnect_policy(&self) -> Box<dyn ReconnectPolicy> {
        match &self.backoff {
            BackoffConfig::Fixed => Box::new(FixedInterval::new(self.retry_interval())),
            BackoffConfig::Exponential { max_ms } => Box::new(ExponentialBackoff::new(
                self.retry_interval(),
                Duration::from_millis(*max_ms),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub detection: String,
    pub recognition: String,
    pub search: String,
    /// Session-bound submission endpoint (hybrid mode)
    pub commit: String,
    /// Per-call timeout
    pub timeout_ms: u64,
    pub topk: u32,
    /// Key the query vector is sent under in search requests
    pub vector_name: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            detection: String::new(),
            recognition: String::new(),
            search: String::new(),
            commit: String::new(),
            timeout_ms: 10_000,
            topk: 5,
            vector_name: "query".to_string(),
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub coupled_period_ms: u64,
    pub render_period_ms: u64,
    pub submit_period_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            coupled_period_ms: 25,
            render_period_ms: 1,
            submit_period_ms: 250,
        }
    }
}

impl SchedulerConfig {
    pub fn coupled_period(&self) -> Duration {
        Duration::from_millis(self.coupled_period_ms)
    }

    pub fn render_period(&self) -> Duration {
        Duration::from_millis(self.render_period_ms.max(1))
    }

    pub fn submit_period(&self) -> Duration {
        Duration::from_millis(self.submit_period_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub ttl_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { ttl_ms: 2000 }
    }
}

impl StoreConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Search distance above which a face counts as a match
    pub match_threshold: f64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            match_threshold: 0.8,
        }
    }
}

/// Client configuration, loaded from a JSON file and/or environment variables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ClientConfig {
    pub mode: PipelineMode,
    pub websocket: WebSocketConfig,
    pub http: HttpConfig,
    pub scheduler: SchedulerConfig,
    pub store: StoreConfig,
    pub render: RenderConfig,
}

impl ClientConfig {
    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&text)
            .map_err(|e| ConfigError::Read(format!("{}: {}", path.display(), e)))
    }

    /// Load configuration from environment variables (after `.env`)
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let mut config = Self::default();
        config.apply_overrides(|key| env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `FACELINK_*` overrides from any key/value lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn millis(key: &str, value: String) -> Result<u64, ConfigError> {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue(format!("{} must be an integer", key)))
        }

        if let Some(mode) = lookup("FACELINK_MODE") {
            self.mode = mode.parse()?;
        }
        if let Some(endpoint) = lookup("FACELINK_WS_ENDPOINT") {
            self.websocket.endpoint = endpoint;
        }
        if let Some(retry) = lookup("FACELINK_WS_RETRY_MS") {
            self.websocket.retry_ms = millis("FACELINK_WS_RETRY_MS", retry)?;
        }
        if let Some(agent) = lookup("FACELINK_AGENT") {
            self.websocket.agent = agent;
        }
        if let Some(url) = lookup("FACELINK_DETECTION_URL") {
            self.http.detection = url;
        }
        if let Some(url) = lookup("FACELINK_RECOGNITION_URL") {
            self.http.recognition = url;
        }
        if let Some(url) = lookup("FACELINK_SEARCH_URL") {
            self.http.search = url;
        }
        if let Some(url) = lookup("FACELINK_COMMIT_URL") {
            self.http.commit = url;
        }
        if let Some(timeout) = lookup("FACELINK_HTTP_TIMEOUT_MS") {
            self.http.timeout_ms = millis("FACELINK_HTTP_TIMEOUT_MS", timeout)?;
        }
        if let Some(period) = lookup("FACELINK_COUPLED_PERIOD_MS") {
            self.scheduler.coupled_period_ms = millis("FACELINK_COUPLED_PERIOD_MS", period)?;
        }
        if let Some(period) = lookup("FACELINK_RENDER_PERIOD_MS") {
            self.scheduler.render_period_ms = millis("FACELINK_RENDER_PERIOD_MS", period)?;
        }
        if let Some(period) = lookup("FACELINK_SUBMIT_PERIOD_MS") {
            self.scheduler.submit_period_ms = millis("FACELINK_SUBMIT_PERIOD_MS", period)?;
        }
        if let Some(ttl) = lookup("FACELINK_TTL_MS") {
            self.store.ttl_ms = millis("FACELINK_TTL_MS", ttl)?;
        }

        Ok(())
    }

    /// Check that the endpoints required by the selected mode are present
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.ttl_ms == 0 {
            return Err(ConfigError::InvalidValue("store.ttl_ms must be > 0".to_string()));
        }
        if self.http.timeout_ms == 0 {
            return Err(ConfigError::InvalidValue("http.timeout_ms must be > 0".to_string()));
        }

        match self.mode {
            PipelineMode::Coupled => {
                if self.scheduler.coupled_period_ms == 0 {
                    return Err(ConfigError::InvalidValue(
                        "scheduler.coupled_period_ms must be > 0".to_string(),
                    ));
                }
                require("http.detection", &self.http.detection)?;
                require("http.recognition", &self.http.recognition)?;
            }
            PipelineMode::Push => {
                require("websocket.endpoint", &self.websocket.endpoint)?;
            }
            PipelineMode::Hybrid => {
                require("websocket.endpoint", &self.websocket.endpoint)?;
                require("http.commit", &self.http.commit)?;
            }
        }

        if matches!(self.mode, PipelineMode::Push | PipelineMode::Hybrid)
            && self.scheduler.submit_period_ms == 0
        {
            return Err(ConfigError::InvalidValue(
                "scheduler.submit_period_ms must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

fn require(name: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        Err(ConfigError::MissingValue(name.to_string()))
    } else {
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration: {0}")]
    Read(String),
    #[error("Missing required configuration value: {0}")]
    MissingValue(String),
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}
