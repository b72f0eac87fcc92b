use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, mpsc};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, warn};

use crate::config::StreamSettings;
use crate::model::{FileEntry, FileStatus};
use crate::util::{sha256_file, unix_nanos};

/// A matching file that is new or differs from its tracker entry.
#[derive(Debug, Clone)]
pub(crate) struct ScanCandidate {
    pub path: PathBuf,
    pub path_key: String,
    pub mtime_ns: i64,
    pub size: u64,
    pub checksum: Option<String>,
    pub previous: Option<FileEntry>,
}

/// Produces the entries directly under a root.
pub(crate) type RootLister = fn(&Path) -> Result<Vec<PathBuf>>;

/// Listings that outlived their timeout and whose thread has not returned yet.
static STALLED_LISTINGS: Mutex<Vec<(PathBuf, u64)>> = Mutex::new(Vec::new());
static NEXT_LISTING_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Default)]
pub(crate) struct ScanOutcome {
    pub candidates: Vec<ScanCandidate>,
    pub roots_skipped: usize,
    pub files_matched: usize,
    pub files_unchanged: usize,
    pub files_quarantined: usize,
}

/// Lists every root of the stream and diffs the matches against `known`.
///
/// Unavailable roots and files that disappear mid-scan are logged and skipped;
/// the scan itself never fails.
pub(crate) fn scan_for_changes(
    settings: &StreamSettings,
    known: &HashMap<String, FileEntry>,
) -> ScanOutcome {
    scan_with_lister(settings, known, read_root)
}

pub(crate) fn scan_with_lister(
    settings: &StreamSettings,
    known: &HashMap<String, FileEntry>,
    lister: RootLister,
) -> ScanOutcome {
    let mut outcome = ScanOutcome::default();

    for root in &settings.roots {
        let paths = match list_root(root, settings.root_timeout, lister) {
            Ok(paths) => paths,
            Err(err) => {
                warn!(
                    stream = %settings.kind,
                    root = %root.display(),
                    error = %format!("{err:#}"),
                    "source root unavailable, skipping"
                );
                outcome.roots_skipped += 1;
                continue;
            }
        };

        for path in paths {
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if !settings.pattern.matches(name) {
                continue;
            }

            let metadata = match fs::metadata(&path) {
                Ok(metadata) => metadata,
                Err(err) => {
                    warn!(stream = %settings.kind, path = %path.display(), error = %err, "file vanished before stat");
                    continue;
                }
            };
            if !metadata.is_file() {
                continue;
            }
            outcome.files_matched += 1;

            let mtime_ns = match metadata.modified() {
                Ok(modified) => unix_nanos(modified),
                Err(err) => {
                    warn!(stream = %settings.kind, path = %path.display(), error = %err, "file has no modification time");
                    continue;
                }
            };
            let size = metadata.len();
            let path_key = path.to_string_lossy().into_owned();
            let previous = known.get(&path_key);

            if previous.is_some_and(|entry| entry.status == FileStatus::Quarantined) {
                outcome.files_quarantined += 1;
                continue;
            }

            let checksum = if settings.verify_checksum {
                match sha256_file(&path) {
                    Ok(checksum) => Some(checksum),
                    Err(err) => {
                        warn!(
                            stream = %settings.kind,
                            path = %path.display(),
                            error = %format!("{err:#}"),
                            "failed to checksum file, skipping"
                        );
                        continue;
                    }
                }
            } else {
                None
            };

            if let Some(entry) = previous {
                let content_matches = !settings.verify_checksum
                    || (entry.checksum.is_some() && entry.checksum == checksum);
                if entry.same_metadata(mtime_ns, size) && content_matches {
                    outcome.files_unchanged += 1;
                    continue;
                }
            }

            debug!(stream = %settings.kind, path = %path.display(), "candidate file");
            outcome.candidates.push(ScanCandidate {
                path,
                path_key,
                mtime_ns,
                size,
                checksum,
                previous: previous.cloned(),
            });
        }
    }

    outcome
}

/// Runs `lister` for `root` on a detached thread and gives up after `timeout`.
///
/// A hung mount keeps its thread blocked; until that thread returns the root
/// is reported unavailable without spawning another one.
pub(crate) fn list_root(
    root: &Path,
    timeout: Duration,
    lister: RootLister,
) -> Result<Vec<PathBuf>> {
    if stalled_listings().iter().any(|(stalled, _)| stalled == root) {
        bail!("previous listing of {} is still running", root.display());
    }

    let id = NEXT_LISTING_ID.fetch_add(1, Ordering::Relaxed);
    let (sender, receiver) = mpsc::channel();
    let owned_root = root.to_path_buf();

    thread::Builder::new()
        .name("root-listing".to_string())
        .spawn(move || {
            let _ = sender.send(lister(&owned_root));
            stalled_listings().retain(|(_, stalled_id)| *stalled_id != id);
        })
        .context("failed to spawn root listing thread")?;

    match receiver.recv_timeout(timeout) {
        Ok(listing) => listing,
        Err(mpsc::RecvTimeoutError::Timeout) => {
            // Checked under the lock so a late finisher always clears its own entry.
            let mut stalled = stalled_listings();
            match receiver.try_recv() {
                Ok(listing) => return listing,
                Err(mpsc::TryRecvError::Disconnected) => {
                    bail!("listing thread for {} exited early", root.display())
                }
                Err(mpsc::TryRecvError::Empty) => stalled.push((root.to_path_buf(), id)),
            }
            Err(anyhow!(
                "listing {} did not finish within {}ms",
                root.display(),
                timeout.as_millis()
            ))
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            Err(anyhow!("listing thread for {} exited early", root.display()))
        }
    }
}

fn stalled_listings() -> MutexGuard<'static, Vec<(PathBuf, u64)>> {
    STALLED_LISTINGS.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read_root(root: &Path) -> Result<Vec<PathBuf>> {
    let entries =
        fs::read_dir(root).with_context(|| format!("failed to list {}", root.display()))?;

    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read entry in {}", root.display()))?;
        paths.push(entry.path());
    }

    Ok(paths)
}
