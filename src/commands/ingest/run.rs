use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, TimeDelta, Utc};
use tracing::{error, info, warn};

use crate::cli::IngestArgs;
use crate::config::{PipelineConfig, StreamSettings, default_db_path};
use crate::model::{IngestPaths, IngestRunManifest, StreamKind, StreamRunResult};
use crate::util::{ensure_directory, now_utc_string, utc_compact_string, write_json_pretty};

use super::{
    DB_SCHEMA_VERSION, LotxExtractor, VoidCsvExtractor, ensure_schema, open_store, run_stream,
};

const MANIFEST_DIR_NAME: &str = "manifests";
const MANIFEST_PREFIX: &str = "ingest_run_";

struct CycleContext<'a> {
    config: &'a PipelineConfig,
    config_path: Option<&'a Path>,
    data_root: &'a Path,
    db_path: &'a Path,
    migrate: bool,
}

pub fn run(args: IngestArgs) -> Result<()> {
    let (mut config, config_path) =
        PipelineConfig::load_or_default(args.config.as_deref(), &args.data_root)?;
    apply_overrides(&mut config, &args);

    let db_path = config
        .db_path
        .clone()
        .unwrap_or_else(|| default_db_path(&args.data_root));

    {
        let connection = open_store(&db_path, config.busy_timeout())?;
        ensure_schema(&connection)?;
    }

    let context = CycleContext {
        config: &config,
        config_path: config_path.as_deref(),
        data_root: &args.data_root,
        db_path: &db_path,
        migrate: args.migrate,
    };

    let interval = match args.loop_interval_secs {
        Some(_) if args.migrate => {
            warn!("loop mode is ignored during migration, running a single cycle");
            None
        }
        interval => interval,
    };

    let Some(interval_secs) = interval else {
        return run_cycle(&context);
    };

    info!(interval_secs, "running ingest continuously");
    loop {
        if let Err(err) = run_cycle(&context) {
            error!(error = %format!("{err:#}"), "ingest cycle failed, retrying after the interval");
        }
        thread::sleep(Duration::from_secs(interval_secs));
    }
}

fn apply_overrides(config: &mut PipelineConfig, args: &IngestArgs) {
    if let Some(db_path) = &args.db_path {
        config.db_path = Some(db_path.clone());
    }
    if !args.lot_roots.is_empty() {
        config.lot_info.roots = args.lot_roots.clone();
    }
    if !args.void_roots.is_empty() {
        config.void_results.roots = args.void_roots.clone();
    }
    if args.verify_checksum {
        config.verify_checksum = true;
    }
    if args.max_failed_attempts.is_some() {
        config.max_failed_attempts = args.max_failed_attempts;
    }
}

fn run_cycle(context: &CycleContext<'_>) -> Result<()> {
    let started_ts = Utc::now();
    let started_at = now_utc_string();
    let run_id = format!("run-{}", utc_compact_string(started_ts));
    let mode = if context.migrate { "migrate" } else { "incremental" };

    info!(
        run_id = %run_id,
        mode,
        db_path = %context.db_path.display(),
        "starting ingest cycle"
    );

    let settings = StreamKind::ALL
        .iter()
        .map(|kind| context.config.stream_settings(*kind, context.migrate))
        .collect::<Result<Vec<_>>>()?;
    for stream in &settings {
        if stream.roots.is_empty() {
            warn!(stream = %stream.kind, mode, "no source roots configured");
        }
    }

    let streams = run_streams(context.db_path, context.config.busy_timeout(), &settings);

    let failed_streams: Vec<String> = streams
        .iter()
        .filter_map(|result| {
            result
                .fatal_error
                .as_ref()
                .map(|reason| format!("{}: {reason}", result.stream))
        })
        .collect();
    let status = if !failed_streams.is_empty() {
        "failed"
    } else if streams.iter().any(has_recoverable_errors) {
        "completed_with_errors"
    } else {
        "completed"
    };

    let manifest_dir = context.data_root.join(MANIFEST_DIR_NAME);
    ensure_directory(&manifest_dir)?;
    let manifest_path = unused_manifest_path(&manifest_dir, started_ts);

    let manifest = IngestRunManifest {
        manifest_version: 1,
        run_id: run_id.clone(),
        db_schema_version: DB_SCHEMA_VERSION.to_string(),
        mode: mode.to_string(),
        status: status.to_string(),
        started_at,
        updated_at: now_utc_string(),
        verify_checksum: context.config.verify_checksum,
        max_failed_attempts: context.config.max_failed_attempts,
        paths: IngestPaths {
            data_root: context.data_root.display().to_string(),
            db_path: context.db_path.display().to_string(),
            config_path: context.config_path.map(|path| path.display().to_string()),
        },
        streams,
    };
    write_json_pretty(&manifest_path, &manifest)?;

    let rows_inserted: usize = manifest.streams.iter().map(|stream| stream.rows_inserted).sum();
    info!(path = %manifest_path.display(), "wrote ingest run manifest");
    info!(run_id = %run_id, status, rows_inserted, "ingest cycle completed");

    if !failed_streams.is_empty() {
        bail!("ingest cycle failed for {}", failed_streams.join("; "));
    }

    Ok(())
}

/// Manifest path stamped with `started`, advanced a millisecond at a time past
/// files that already exist.
fn unused_manifest_path(manifest_dir: &Path, started: DateTime<Utc>) -> PathBuf {
    let mut stamp = started;
    loop {
        let path =
            manifest_dir.join(format!("{MANIFEST_PREFIX}{}.json", utc_compact_string(stamp)));
        if !path.exists() {
            return path;
        }
        stamp += TimeDelta::milliseconds(1);
    }
}

fn has_recoverable_errors(result: &StreamRunResult) -> bool {
    result.batches_failed > 0
        || result.roots_skipped > 0
        || result.files_failed > 0
        || result.files_quarantined > 0
}

/// Runs every stream on its own scoped thread with its own connection.
///
/// Results come back in the order of `settings`.
pub(crate) fn run_streams(
    db_path: &Path,
    busy_timeout: Duration,
    settings: &[StreamSettings],
) -> Vec<StreamRunResult> {
    thread::scope(|scope| {
        let handles: Vec<_> = settings
            .iter()
            .map(|stream| {
                let handle =
                    scope.spawn(move || run_stream_on_store(db_path, busy_timeout, stream));
                (stream.kind, handle)
            })
            .collect();

        handles
            .into_iter()
            .map(|(kind, handle)| {
                handle.join().unwrap_or_else(|_| {
                    error!(stream = %kind, "stream worker panicked");
                    let mut result = StreamRunResult::new(kind);
                    result.fatal_error = Some("stream worker panicked".to_string());
                    result
                })
            })
            .collect()
    })
}

fn run_stream_on_store(
    db_path: &Path,
    busy_timeout: Duration,
    settings: &StreamSettings,
) -> StreamRunResult {
    let mut connection = match open_store(db_path, busy_timeout) {
        Ok(connection) => connection,
        Err(err) => {
            error!(stream = %settings.kind, error = %format!("{err:#}"), "failed to open store");
            let mut result = StreamRunResult::new(settings.kind);
            result.fatal_error = Some(format!("{err:#}"));
            return result;
        }
    };

    match settings.kind {
        StreamKind::LotInfo => run_stream(&mut connection, settings, &LotxExtractor),
        StreamKind::VoidResults => run_stream(&mut connection, settings, &VoidCsvExtractor),
    }
}

/// Most recent ingest run manifest under `data_root`, if any.
pub(crate) fn latest_manifest(data_root: &Path) -> Result<Option<(PathBuf, IngestRunManifest)>> {
    let manifest_dir = data_root.join(MANIFEST_DIR_NAME);
    if !manifest_dir.is_dir() {
        return Ok(None);
    }

    let mut latest: Option<PathBuf> = None;
    for entry in fs::read_dir(&manifest_dir)
        .with_context(|| format!("failed to list {}", manifest_dir.display()))?
    {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if !name.starts_with(MANIFEST_PREFIX) || !name.ends_with(".json") {
            continue;
        }
        if latest.as_ref().is_none_or(|current| current < &path) {
            latest = Some(path);
        }
    }

    let Some(path) = latest else {
        return Ok(None);
    };
    let raw = fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
    let manifest: IngestRunManifest = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;

    Ok(Some((path, manifest)))
}
