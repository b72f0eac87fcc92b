use anyhow::{Result, bail};
use tracing::info;

use crate::cli::RequeueArgs;
use crate::commands::ingest::{FileStateTracker, ensure_schema, open_store};
use crate::config::{PipelineConfig, default_db_path};

/// Drops tracker entries of one stream and status so the next ingest retries those files.
pub fn run(args: RequeueArgs) -> Result<()> {
    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| default_db_path(&args.data_root));
    if !db_path.is_file() {
        bail!("database file missing: {}", db_path.display());
    }

    let stream = args.stream.kind();
    let status = args.status.status();

    let connection = open_store(&db_path, PipelineConfig::default().busy_timeout())?;
    ensure_schema(&connection)?;
    let released = FileStateTracker::new(&connection, stream).release(status)?;

    info!(
        stream = %stream,
        status = %status,
        released,
        "released tracker entries"
    );

    Ok(())
}
