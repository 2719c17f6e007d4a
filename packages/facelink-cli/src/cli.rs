use clap::{Args, Parser, Subcommand};
use facelink::PipelineMode;

#[derive(Parser)]
#[command(
    name = "facelink",
    version,
    about = "Face recognition pipeline client",
    long_about = "Drive the face recognition pipeline client headless: capture frames from \
                  image files, submit them to the backend and log the rendered results."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the pipeline against a backend
    Run(RunArgs),
    /// Run one stateless detection on an image
    Detect(DetectArgs),
    /// Open a WebSocket session and print its identity
    Session(SessionArgs),
}

#[derive(Args)]
pub struct RunArgs {
    /// JSON configuration file (default: environment variables)
    #[arg(long, env = "FACELINK_CONFIG")]
    pub config: Option<String>,

    /// Image file or directory of jpg/jpeg/png frames
    #[arg(long)]
    pub source: String,

    /// Pipeline mode (coupled, push, hybrid)
    #[arg(long)]
    pub mode: Option<PipelineMode>,

    /// WebSocket endpoint (push and hybrid modes)
    #[arg(long)]
    pub ws: Option<String>,

    /// Detection endpoint (coupled mode)
    #[arg(long)]
    pub detect: Option<String>,

    /// Recognition endpoint (coupled mode)
    #[arg(long)]
    pub recognize: Option<String>,

    /// Search endpoint (coupled mode, optional)
    #[arg(long)]
    pub search: Option<String>,

    /// Session-bound commit endpoint (hybrid mode)
    #[arg(long)]
    pub commit: Option<String>,

    /// Result time-to-live in milliseconds
    #[arg(long)]
    pub ttl_ms: Option<u64>,

    /// Stop after this many seconds (default: run until Ctrl-C)
    #[arg(long)]
    pub duration: Option<f64>,

    /// Do not log render summaries while running
    #[arg(long, default_value_t = false)]
    pub quiet: bool,
}

#[derive(Args)]
pub struct DetectArgs {
    /// Detection endpoint
    #[arg(long, env = "FACELINK_DETECTION_URL")]
    pub endpoint: String,

    /// Image file to submit
    pub image: String,

    /// Request timeout in milliseconds
    #[arg(long, default_value_t = 10_000)]
    pub timeout_ms: u64,

    /// Output file (default: stdout)
    #[arg(short, long)]
    pub output: Option<String>,

    /// Compact JSON output (no indentation)
    #[arg(long, default_value_t = false)]
    pub compact: bool,
}

#[derive(Args)]
pub struct SessionArgs {
    /// WebSocket endpoint
    #[arg(long, env = "FACELINK_WS_ENDPOINT")]
    pub ws: String,

    /// Seconds to wait for the handshake
    #[arg(long, default_value_t = 10.0)]
    pub timeout: f64,

    /// Compact JSON output (no indentation)
    #[arg(long, default_value_t = false)]
    pub compact: bool,
}

/// Parse a positive number of seconds
pub fn parse_seconds(value: f64) -> Result<std::time::Duration, String> {
    if value.is_finite() && value > 0.0 {
        Ok(std::time::Duration::from_secs_f64(value))
    } else {
        Err(format!("Invalid duration '{}': expected a positive number of seconds", value))
    }
}
