use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::model::{FileStatus, StreamKind};

#[derive(Parser, Debug)]
#[command(
    name = "xray-ingest",
    version,
    about = "Incremental ingest of X-ray lot exports and void results into SQLite"
)]
pub struct Cli {
    /// Also write a daily rolling log file into this directory.
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Ingest(IngestArgs),
    Status(StatusArgs),
    Merge(MergeArgs),
    Requeue(RequeueArgs),
}

#[derive(Args, Debug, Clone)]
pub struct IngestArgs {
    #[arg(long, default_value = ".cache/xray-ingest")]
    pub data_root: PathBuf,

    /// JSON pipeline configuration. Defaults to <data-root>/ingest_config.json when present.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    /// Replaces the configured lot export roots.
    #[arg(long = "lot-root")]
    pub lot_roots: Vec<PathBuf>,

    /// Replaces the configured void result roots.
    #[arg(long = "void-root")]
    pub void_roots: Vec<PathBuf>,

    /// One-time backfill from the legacy local archive roots instead of the live sources.
    #[arg(long, default_value_t = false)]
    pub migrate: bool,

    #[arg(long, default_value_t = false)]
    pub verify_checksum: bool,

    #[arg(long)]
    pub max_failed_attempts: Option<u32>,

    /// Keep running, sleeping this many seconds between cycles.
    #[arg(long)]
    pub loop_interval_secs: Option<u64>,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = ".cache/xray-ingest")]
    pub data_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    /// Also show the tracker entries recorded for this source path.
    #[arg(long)]
    pub file: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct MergeArgs {
    #[arg(long, default_value = ".cache/xray-ingest")]
    pub data_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    /// Store whose record tables are merged into the destination store.
    #[arg(long)]
    pub source_db: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct RequeueArgs {
    #[arg(long, default_value = ".cache/xray-ingest")]
    pub data_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long, value_enum)]
    pub stream: StreamSelector,

    #[arg(long, value_enum, default_value_t = RequeueStatus::Quarantined)]
    pub status: RequeueStatus,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum StreamSelector {
    LotInfo,
    VoidResults,
}

impl StreamSelector {
    pub fn kind(self) -> StreamKind {
        match self {
            Self::LotInfo => StreamKind::LotInfo,
            Self::VoidResults => StreamKind::VoidResults,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum RequeueStatus {
    ErrorEmpty,
    ErrorProcess,
    Quarantined,
}

impl RequeueStatus {
    pub fn status(self) -> FileStatus {
        match self {
            Self::ErrorEmpty => FileStatus::ErrorEmpty,
            Self::ErrorProcess => FileStatus::ErrorProcess,
            Self::Quarantined => FileStatus::Quarantined,
        }
    }
}
