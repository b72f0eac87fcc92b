use std::time::Instant;

use anyhow::Result;
use rusqlite::Connection;
use tracing::{error, info, warn};

use crate::config::StreamSettings;
use crate::model::{FileEntry, FileStatus, StreamRunResult};
use crate::util::now_utc_string;

use super::{
    BatchWriter, FileStateTracker, RecordExtractor, ScanCandidate, StoredRecord, scan_for_changes,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamPhase {
    Scanning,
    Extracting,
    Batching,
    Reporting,
}

impl StreamPhase {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Scanning => "scanning",
            Self::Extracting => "extracting",
            Self::Batching => "batching",
            Self::Reporting => "reporting",
        }
    }
}

/// One scan, extract and commit cycle for a single stream.
///
/// Per-file and per-batch failures are counted in the result. Only a store
/// failure that prevents reading the tracker ends the cycle early, reported
/// through `fatal_error`.
pub(crate) fn run_stream<E: RecordExtractor>(
    connection: &mut Connection,
    settings: &StreamSettings,
    extractor: &E,
) -> StreamRunResult {
    let started = Instant::now();
    let mut result = StreamRunResult::new(settings.kind);

    if let Err(err) = drive_stream(connection, settings, extractor, &mut result) {
        error!(stream = %settings.kind, error = %format!("{err:#}"), "stream aborted");
        result.fatal_error = Some(format!("{err:#}"));
    }

    result.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    info!(
        stream = %settings.kind,
        phase = StreamPhase::Reporting.as_str(),
        matched = result.files_matched,
        unchanged = result.files_unchanged,
        candidates = result.files_candidates,
        succeeded = result.files_succeeded,
        empty = result.files_empty,
        failed = result.files_failed,
        quarantined = result.files_quarantined,
        uncommitted = result.files_uncommitted,
        rows_extracted = result.rows_extracted,
        rows_inserted = result.rows_inserted,
        roots_skipped = result.roots_skipped,
        duration_ms = result.duration_ms,
        "stream cycle finished"
    );

    result
}

fn drive_stream<E: RecordExtractor>(
    connection: &mut Connection,
    settings: &StreamSettings,
    extractor: &E,
    result: &mut StreamRunResult,
) -> Result<()> {
    info!(
        stream = %settings.kind,
        phase = StreamPhase::Scanning.as_str(),
        roots = settings.roots.len(),
        "scanning source roots"
    );
    let known = FileStateTracker::new(connection, settings.kind).load_all()?;
    let scan = scan_for_changes(settings, &known);

    result.roots_skipped = scan.roots_skipped;
    result.files_matched = scan.files_matched;
    result.files_unchanged = scan.files_unchanged;
    result.files_held = scan.files_quarantined;
    result.files_candidates = scan.candidates.len();

    info!(
        stream = %settings.kind,
        phase = StreamPhase::Extracting.as_str(),
        candidates = scan.candidates.len(),
        "extracting changed files"
    );

    let mut writer = BatchWriter::<E::Record>::new(settings.kind, settings.batch_size);
    for candidate in &scan.candidates {
        let (status, rows) = match extractor.extract(&candidate.path) {
            Ok(rows) => (FileStatus::Success, rows),
            Err(err) => {
                warn!(
                    stream = %settings.kind,
                    file = %candidate.path.display(),
                    status = %err.status(),
                    error = %err,
                    "file produced no rows"
                );
                (err.status(), Vec::new())
            }
        };

        result.rows_extracted += rows.len();
        let entry = next_entry(candidate, status, settings.max_failed_attempts);
        if entry.status == FileStatus::Quarantined {
            warn!(
                stream = %settings.kind,
                file = %candidate.path.display(),
                attempts = entry.failed_attempts,
                "file quarantined after repeated failures"
            );
        }
        writer.push(entry, rows);

        if writer.should_flush() {
            flush_batch(connection, settings, &mut writer, result);
        }
    }

    if !writer.is_empty() {
        flush_batch(connection, settings, &mut writer, result);
    }

    Ok(())
}

fn flush_batch<R: StoredRecord>(
    connection: &mut Connection,
    settings: &StreamSettings,
    writer: &mut BatchWriter<R>,
    result: &mut StreamRunResult,
) {
    info!(
        stream = %settings.kind,
        phase = StreamPhase::Batching.as_str(),
        rows = writer.pending_rows(),
        "committing batch"
    );

    match writer.flush(connection) {
        Ok(commit) => {
            result.batches_committed += 1;
            result.rows_inserted += commit.rows_inserted;
            for entry in &commit.files {
                match entry.status {
                    FileStatus::Success => result.files_succeeded += 1,
                    FileStatus::ErrorEmpty => result.files_empty += 1,
                    FileStatus::ErrorProcess => result.files_failed += 1,
                    FileStatus::Quarantined => result.files_quarantined += 1,
                }
            }
            info!(
                stream = %settings.kind,
                files = commit.files.len(),
                rows_submitted = commit.rows_submitted,
                rows_inserted = commit.rows_inserted,
                "batch committed"
            );
        }
        Err(failure) => {
            result.batches_failed += 1;
            result.files_uncommitted += failure.files.len();
            error!(
                stream = %settings.kind,
                files = failure.files.len(),
                rows = failure.rows_submitted,
                error = %format!("{:#}", failure.error),
                "batch rolled back, files stay eligible for the next run"
            );
        }
    }
}

/// Tracker entry to record for `candidate` after an extraction ending in `status`.
///
/// Consecutive ERROR_PROCESS outcomes accumulate `failed_attempts`; any other
/// outcome resets it. Reaching `max_failed_attempts` turns the entry into
/// QUARANTINED.
pub(crate) fn next_entry(
    candidate: &ScanCandidate,
    status: FileStatus,
    max_failed_attempts: Option<u32>,
) -> FileEntry {
    let failed_attempts = if status == FileStatus::ErrorProcess {
        match &candidate.previous {
            Some(previous) if previous.status == FileStatus::ErrorProcess => {
                previous.failed_attempts.saturating_add(1)
            }
            _ => 1,
        }
    } else {
        0
    };

    let status = match max_failed_attempts {
        Some(cap) if status == FileStatus::ErrorProcess && failed_attempts >= cap => {
            FileStatus::Quarantined
        }
        _ => status,
    };

    FileEntry {
        path: candidate.path_key.clone(),
        mtime_ns: candidate.mtime_ns,
        size: candidate.size,
        status,
        processed_at: now_utc_string(),
        checksum: candidate.checksum.clone(),
        failed_attempts,
    }
}
