use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::commands::ingest::{
    FileStateTracker, StatusCount, count_rows, latest_manifest, status_counts,
};
use crate::config::default_db_path;
use crate::model::StreamKind;

#[derive(Debug, Clone)]
pub(crate) struct StoreSummary {
    pub schema_version: Option<String>,
    pub updated_at: Option<String>,
    pub lot_rows: i64,
    pub void_rows: i64,
    pub tracker: Vec<StatusCount>,
}

pub fn run(args: StatusArgs) -> Result<()> {
    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| default_db_path(&args.data_root));

    info!(data_root = %args.data_root.display(), "status requested");

    match latest_manifest(&args.data_root)? {
        Some((path, manifest)) => {
            info!(
                path = %path.display(),
                run_id = %manifest.run_id,
                mode = %manifest.mode,
                status = %manifest.status,
                started_at = %manifest.started_at,
                updated_at = %manifest.updated_at,
                "loaded latest ingest run manifest"
            );
            for stream in &manifest.streams {
                info!(
                    stream = %stream.stream,
                    candidates = stream.files_candidates,
                    succeeded = stream.files_succeeded,
                    empty = stream.files_empty,
                    failed = stream.files_failed,
                    quarantined = stream.files_quarantined,
                    rows_inserted = stream.rows_inserted,
                    fatal_error = %stream.fatal_error.clone().unwrap_or_default(),
                    "last run stream result"
                );
            }
        }
        None => warn!(data_root = %args.data_root.display(), "no ingest run manifest found"),
    }

    if !db_path.exists() {
        warn!(path = %db_path.display(), "database file missing");
        return Ok(());
    }

    let connection = Connection::open(&db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    let summary = summarize_store(&connection)?;

    info!(
        path = %db_path.display(),
        schema_version = %summary.schema_version.unwrap_or_default(),
        updated_at = %summary.updated_at.unwrap_or_default(),
        lot_rows = summary.lot_rows,
        void_rows = summary.void_rows,
        "database status"
    );
    for count in &summary.tracker {
        info!(
            stream = %count.stream,
            status = %count.status,
            files = count.files,
            "tracked files"
        );
    }

    if let Some(file) = &args.file {
        let path_key = file.to_string_lossy();
        for stream in StreamKind::ALL {
            match FileStateTracker::new(&connection, stream).lookup(&path_key)? {
                Some(entry) => info!(
                    stream = %stream,
                    path = %entry.path,
                    status = %entry.status,
                    mtime_ns = entry.mtime_ns,
                    size = entry.size,
                    processed_at = %entry.processed_at,
                    checksum = %entry.checksum.unwrap_or_default(),
                    failed_attempts = entry.failed_attempts,
                    "tracker entry"
                ),
                None => info!(stream = %stream, path = %path_key, "file not tracked"),
            }
        }
    }

    Ok(())
}

pub(crate) fn summarize_store(connection: &Connection) -> Result<StoreSummary> {
    Ok(StoreSummary {
        schema_version: metadata_value(connection, "db_schema_version")?,
        updated_at: metadata_value(connection, "db_updated_at")?,
        lot_rows: count_rows(connection, "SELECT COUNT(*) FROM Lot_info")?,
        void_rows: count_rows(connection, "SELECT COUNT(*) FROM Void_results")?,
        tracker: status_counts(connection)?,
    })
}

fn metadata_value(connection: &Connection, key: &str) -> Result<Option<String>> {
    let value = connection
        .query_row("SELECT value FROM metadata WHERE key = ?1", [key], |row| row.get(0))
        .optional()
        .with_context(|| format!("failed to read metadata key {key}"))?;
    Ok(value)
}
