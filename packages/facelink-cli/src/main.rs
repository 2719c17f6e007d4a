use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod cli;
mod commands;
mod exit_codes;
mod output;
mod renderer;

use cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = match cli.verbose {
        0 => "facelink=info,facelink_cli=info",
        1 => "facelink=debug,facelink_cli=debug",
        _ => "facelink=trace,facelink_cli=trace",
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let exit_code = match cli.command {
        cli::Command::Run(args) => commands::run::execute(args).await,
        cli::Command::Detect(args) => commands::detect::execute(args).await,
        cli::Command::Session(args) => commands::session::execute(args).await,
    };

    std::process::exit(exit_code);
}
