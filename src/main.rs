mod cli;
mod commands;
mod config;
mod model;
mod util;

use std::path::Path;

use anyhow::Result;
use clap::Parser;
use tracing::error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::cli::{Cli, Commands};

const LOG_FILE_NAME: &str = "xray-ingest.log";

fn main() {
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_dir.as_deref());

    if let Err(err) = run(cli) {
        error!(error = %err, "command failed");
        for cause in err.chain().skip(1) {
            error!(cause = %cause, "caused by");
        }
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Ingest(args) => commands::ingest::run(args),
        Commands::Status(args) => commands::status::run(args),
        Commands::Merge(args) => commands::merge::run(args),
        Commands::Requeue(args) => commands::requeue::run(args),
    }
}

fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let mut guard = None;
    let file_layer = match log_dir.map(|dir| util::ensure_directory(dir).map(|_| dir)) {
        Some(Ok(dir)) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_NAME);
            let (writer, worker_guard) = tracing_appender::non_blocking(appender);
            guard = Some(worker_guard);
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(false)
                    .with_filter(env_filter()),
            )
        }
        Some(Err(err)) => {
            eprintln!("warning: file logging disabled: {err:#}");
            None
        }
        None => None,
    };

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(env_filter());

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .init();

    guard
}
