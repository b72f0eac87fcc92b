use std::mem;

use anyhow::{Context, Result};
use rusqlite::{Connection, Statement, Transaction, params};

use crate::model::{FileEntry, LotRecord, MeasurementRecord, StreamKind};

use super::FileStateTracker;

/// A row type with its own table and uniqueness constraint.
pub(crate) trait StoredRecord {
    const TABLE: &'static str;
    const COLUMNS: &'static [&'static str];

    fn insert(&self, statement: &mut Statement<'_>) -> rusqlite::Result<usize>;

    /// `INSERT OR IGNORE` over every column; a conflicting row is left as first seen.
    fn insert_sql() -> String {
        let placeholders = (1..=Self::COLUMNS.len())
            .map(|index| format!("?{index}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "INSERT OR IGNORE INTO {}({}) VALUES({})",
            Self::TABLE,
            Self::COLUMNS.join(", "),
            placeholders
        )
    }
}

impl StoredRecord for LotRecord {
    const TABLE: &'static str = "Lot_info";
    const COLUMNS: &'static [&'static str] = &[
        "LotId",
        "Recipe",
        "AllowSizeNull",
        "CountUniqueBarcodesOnly",
        "Size",
        "CarrierIndex",
        "TrayId",
        "TrayState",
        "TrayCode",
        "UnitId",
        "UnitState",
        "UnitCode",
        "UnitIdx",
        "source_filename",
    ];

    fn insert(&self, statement: &mut Statement<'_>) -> rusqlite::Result<usize> {
        statement.execute(params![
            self.lot_id,
            self.recipe,
            self.allow_size_null,
            self.count_unique_barcodes_only,
            self.size,
            self.carrier_index,
            self.tray_id,
            self.tray_state,
            self.tray_code,
            self.unit_id,
            self.unit_state,
            self.unit_code,
            self.unit_idx,
            self.source_filename,
        ])
    }
}

impl StoredRecord for MeasurementRecord {
    const TABLE: &'static str = "Void_results";
    const COLUMNS: &'static [&'static str] = &[
        "BoardBarcode",
        "ModuleIndex",
        "JointType",
        "Pin",
        "TotalVoidRatio",
        "LargestVoidRatio",
        "SpreadX",
        "SpreadY",
        "GVMean",
        "DefectCode",
        "SystemDefect",
        "PinStatus",
        "Lot",
        "ModuleStatus",
        "DeviceStatus",
        "source_filename",
    ];

    fn insert(&self, statement: &mut Statement<'_>) -> rusqlite::Result<usize> {
        let [
            board_barcode,
            module_index,
            joint_type,
            pin,
            total_void_ratio,
            largest_void_ratio,
            spread_x,
            spread_y,
            gv_mean,
            defect_code,
            system_defect,
            pin_status,
            lot,
            module_status,
            device_status,
        ] = self.columns();

        statement.execute(params![
            board_barcode,
            module_index,
            joint_type,
            pin,
            total_void_ratio,
            largest_void_ratio,
            spread_x,
            spread_y,
            gv_mean,
            defect_code,
            system_defect,
            pin_status,
            lot,
            module_status,
            device_status,
            self.source_filename,
        ])
    }
}

/// Inserts `rows` inside `tx` and returns how many were actually new.
pub(crate) fn write_rows<R: StoredRecord>(tx: &Transaction<'_>, rows: &[R]) -> Result<usize> {
    let sql = R::insert_sql();
    let mut statement = tx
        .prepare(&sql)
        .with_context(|| format!("failed to prepare insert into {}", R::TABLE))?;

    let mut inserted = 0;
    for row in rows {
        inserted += row
            .insert(&mut statement)
            .with_context(|| format!("failed to insert into {}", R::TABLE))?;
    }

    Ok(inserted)
}

#[derive(Debug)]
pub(crate) struct BatchCommit {
    pub rows_submitted: usize,
    pub rows_inserted: usize,
    pub files: Vec<FileEntry>,
}

/// A rolled-back batch. None of `files` were marked in the tracker.
#[derive(Debug)]
pub(crate) struct BatchFailure {
    pub error: anyhow::Error,
    pub rows_submitted: usize,
    pub files: Vec<FileEntry>,
}

/// Buffers rows and tracker entries for one stream until the batch is full.
///
/// Each flush writes the rows and the tracker entries of the files that
/// produced them in a single transaction, so a file is never marked as
/// processed without its rows, and a failed flush leaves every file in the
/// batch eligible for the next run.
pub(crate) struct BatchWriter<R> {
    stream: StreamKind,
    threshold: usize,
    rows: Vec<R>,
    files: Vec<FileEntry>,
}

impl<R: StoredRecord> BatchWriter<R> {
    pub(crate) fn new(stream: StreamKind, threshold: usize) -> Self {
        Self {
            stream,
            threshold: threshold.max(1),
            rows: Vec::new(),
            files: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, entry: FileEntry, rows: Vec<R>) {
        self.rows.extend(rows);
        self.files.push(entry);
    }

    pub(crate) fn should_flush(&self) -> bool {
        self.rows.len() >= self.threshold || self.files.len() >= self.threshold
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.rows.is_empty() && self.files.is_empty()
    }

    pub(crate) fn pending_rows(&self) -> usize {
        self.rows.len()
    }

    /// Commits everything buffered. The buffers are empty afterwards either way.
    pub(crate) fn flush(&mut self, connection: &mut Connection) -> Result<BatchCommit, BatchFailure> {
        let rows = mem::take(&mut self.rows);
        let files = mem::take(&mut self.files);

        match commit_batch(connection, self.stream, &rows, &files) {
            Ok(rows_inserted) => Ok(BatchCommit {
                rows_submitted: rows.len(),
                rows_inserted,
                files,
            }),
            Err(error) => Err(BatchFailure {
                error,
                rows_submitted: rows.len(),
                files,
            }),
        }
    }
}

fn commit_batch<R: StoredRecord>(
    connection: &mut Connection,
    stream: StreamKind,
    rows: &[R],
    files: &[FileEntry],
) -> Result<usize> {
    let tx = connection
        .transaction()
        .context("failed to begin batch transaction")?;

    let inserted = write_rows(&tx, rows)?;

    let tracker = FileStateTracker::new(&tx, stream);
    for entry in files {
        tracker.record(entry)?;
    }

    tx.commit().context("failed to commit batch")?;
    Ok(inserted)
}
