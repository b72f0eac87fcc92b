use std::collections::HashMap;

use anyhow::{Context, Result, anyhow};
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::model::{FileEntry, FileStatus, StreamKind};

/// Per-stream view of the `file_state` table.
///
/// Takes a plain connection so it can run inside the batch transaction
/// (a `Transaction` derefs to `Connection`). Storage errors are returned to
/// the caller untouched.
pub(crate) struct FileStateTracker<'conn> {
    connection: &'conn Connection,
    stream: StreamKind,
}

const SELECT_COLUMNS: &str =
    "file_path, mtime_ns, size, status, processed_at, checksum, failed_attempts";

impl<'conn> FileStateTracker<'conn> {
    pub(crate) fn new(connection: &'conn Connection, stream: StreamKind) -> Self {
        Self { connection, stream }
    }

    pub(crate) fn lookup(&self, path: &str) -> Result<Option<FileEntry>> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM file_state WHERE stream = ?1 AND file_path = ?2");
        let raw = self
            .connection
            .query_row(&sql, params![self.stream.as_str(), path], RawEntry::from_row)
            .optional()
            .with_context(|| format!("failed to look up tracker entry for {path}"))?;

        raw.map(RawEntry::into_entry).transpose()
    }

    /// Upserts the entry, overwriting whatever was recorded for the path before.
    pub(crate) fn record(&self, entry: &FileEntry) -> Result<()> {
        self.connection
            .execute(
                "
                INSERT INTO file_state(
                  stream, file_path, mtime_ns, size, status, processed_at, checksum, failed_attempts
                )
                VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(stream, file_path) DO UPDATE SET
                  mtime_ns=excluded.mtime_ns,
                  size=excluded.size,
                  status=excluded.status,
                  processed_at=excluded.processed_at,
                  checksum=excluded.checksum,
                  failed_attempts=excluded.failed_attempts
                ",
                params![
                    self.stream.as_str(),
                    &entry.path,
                    entry.mtime_ns,
                    i64::try_from(entry.size).unwrap_or(i64::MAX),
                    entry.status.as_str(),
                    &entry.processed_at,
                    entry.checksum.as_deref(),
                    entry.failed_attempts,
                ],
            )
            .with_context(|| format!("failed to record tracker entry for {}", entry.path))?;

        Ok(())
    }

    /// Snapshot of every entry of this stream, keyed by path.
    pub(crate) fn load_all(&self) -> Result<HashMap<String, FileEntry>> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM file_state WHERE stream = ?1");
        let mut statement = self
            .connection
            .prepare(&sql)
            .context("failed to prepare tracker snapshot query")?;

        let raw_entries = statement
            .query_map([self.stream.as_str()], RawEntry::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("failed to load tracker entries for {}", self.stream))?;

        let mut entries = HashMap::with_capacity(raw_entries.len());
        for raw in raw_entries {
            let entry = raw.into_entry()?;
            entries.insert(entry.path.clone(), entry);
        }

        Ok(entries)
    }

    /// Deletes entries with `status` so their files are picked up by the next scan.
    pub(crate) fn release(&self, status: FileStatus) -> Result<usize> {
        let released = self
            .connection
            .execute(
                "DELETE FROM file_state WHERE stream = ?1 AND status = ?2",
                params![self.stream.as_str(), status.as_str()],
            )
            .with_context(|| format!("failed to release {status} entries for {}", self.stream))?;

        Ok(released)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct StatusCount {
    pub stream: String,
    pub status: String,
    pub files: i64,
}

pub(crate) fn status_counts(connection: &Connection) -> Result<Vec<StatusCount>> {
    let mut statement = connection.prepare(
        "SELECT stream, status, COUNT(*) FROM file_state GROUP BY stream, status ORDER BY stream, status",
    )?;

    let counts = statement
        .query_map([], |row| {
            Ok(StatusCount {
                stream: row.get(0)?,
                status: row.get(1)?,
                files: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("failed to count tracker entries")?;

    Ok(counts)
}

struct RawEntry {
    path: String,
    mtime_ns: i64,
    size: i64,
    status: String,
    processed_at: String,
    checksum: Option<String>,
    failed_attempts: u32,
}

impl RawEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            path: row.get(0)?,
            mtime_ns: row.get(1)?,
            size: row.get(2)?,
            status: row.get(3)?,
            processed_at: row.get(4)?,
            checksum: row.get(5)?,
            failed_attempts: row.get(6)?,
        })
    }

    fn into_entry(self) -> Result<FileEntry> {
        let status = FileStatus::parse(&self.status)
            .ok_or_else(|| anyhow!("unknown tracker status {:?} for {}", self.status, self.path))?;

        Ok(FileEntry {
            path: self.path,
            mtime_ns: self.mtime_ns,
            size: u64::try_from(self.size).unwrap_or(0),
            status,
            processed_at: self.processed_at,
            checksum: self.checksum,
            failed_attempts: self.failed_attempts,
        })
    }
}
