use crate::cli::{self, RunArgs};
use crate::exit_codes;
use crate::output;
use crate::renderer::LogRenderer;
use anyhow::{Context, Result};
use facelink::{ClientConfig, FileCaptureSource, Pipeline};
use std::sync::Arc;
use tracing::{info, warn};

pub async fn execute(args: RunArgs) -> i32 {
    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return exit_codes::INPUT_ERROR;
        }
    };

    let duration = match args.duration.map(cli::parse_seconds).transpose() {
        Ok(duration) => duration,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            return exit_codes::INPUT_ERROR;
        }
    };

    let capture = match FileCaptureSource::open(&args.source) {
        Ok(capture) => capture,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::INPUT_ERROR;
        }
    };

    let threshold = config.render.match_threshold;
    let mut pipeline = match Pipeline::new(config, Arc::new(capture)) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::INPUT_ERROR;
        }
    };

    if let Err(e) = pipeline.start(Box::new(LogRenderer::new(threshold, args.quiet))) {
        eprintln!("Error: {}", e);
        return exit_codes::EXECUTION_ERROR;
    }

    match duration {
        Some(duration) => {
            tokio::select! {
                _ = tokio::time::sleep(duration) => {}
                _ = tokio::signal::ctrl_c() => info!("Interrupted"),
            }
        }
        None => {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {}", e);
            }
        }
    }

    let model = pipeline.read_model();
    pipeline.stop().await;
    output::print_lines(&model.summary_lines(threshold));

    exit_codes::SUCCESS
}

/// Configuration file (or environment), then command-line overrides
fn load_config(args: &RunArgs) -> Result<ClientConfig> {
    let mut config = match &args.config {
        Some(path) => ClientConfig::from_file(path)?,
        None => ClientConfig::from_env().context("Failed to read configuration from environment")?,
    };

    if let Some(mode) = args.mode {
        config.mode = mode;
    }
    if let Some(ws) = &args.ws {
        config.websocket.endpoint = ws.clone();
    }
    if let Some(url) = &args.detect {
        config.http.detection = url.clone();
    }
    if let Some(url) = &args.recognize {
        config.http.recognition = url.clone();
    }
    if let Some(url) = &args.search {
        config.http.search = url.clone();
    }
    if let Some(url) = &args.commit {
        config.http.commit = url.clone();
    }
    if let Some(ttl) = args.ttl_ms {
        config.store.ttl_ms = ttl;
    }

    config
        .validate()
        .with_context(|| format!("Invalid configuration for {} mode", config.mode))?;
    Ok(config)
}
