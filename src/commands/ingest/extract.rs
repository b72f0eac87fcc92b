use std::fs::{self, File};
use std::path::Path;

use thiserror::Error;

use crate::model::{FileStatus, LotRecord, MeasurementRecord};
use crate::util::file_name_lossy;

use super::StoredRecord;
use super::lotx::extract_lot_records;
use super::void_csv::extract_measurement_records;

/// Why a file produced no rows.
#[derive(Debug, Error)]
pub(crate) enum ExtractError {
    #[error("file contains no records")]
    Empty,

    #[error("failed to read file: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed {format} content: {reason}")]
    Malformed {
        format: &'static str,
        reason: String,
    },
}

impl ExtractError {
    pub(crate) fn malformed(format: &'static str, reason: impl ToString) -> Self {
        Self::Malformed {
            format,
            reason: reason.to_string(),
        }
    }

    /// Tracker classification for this failure.
    pub(crate) fn status(&self) -> FileStatus {
        match self {
            Self::Empty => FileStatus::ErrorEmpty,
            Self::Io(_) | Self::Malformed { .. } => FileStatus::ErrorProcess,
        }
    }
}

/// Turns one source file into rows for a single table.
///
/// Implementations read only the given file and hold no mutable state.
pub(crate) trait RecordExtractor {
    type Record: StoredRecord;

    fn extract(&self, path: &Path) -> Result<Vec<Self::Record>, ExtractError>;
}

/// `.lotx` lot exports: lot, tray and unit attributes flattened per unit.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct LotxExtractor;

impl RecordExtractor for LotxExtractor {
    type Record = LotRecord;

    fn extract(&self, path: &Path) -> Result<Vec<LotRecord>, ExtractError> {
        let raw = fs::read(path)?;
        let content = String::from_utf8(raw)
            .map_err(|err| ExtractError::malformed("lotx", format!("invalid UTF-8: {err}")))?;
        extract_lot_records(&content, &file_name_lossy(path))
    }
}

/// Void result tables backfilled to the fixed fifteen-column layout.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct VoidCsvExtractor;

impl RecordExtractor for VoidCsvExtractor {
    type Record = MeasurementRecord;

    fn extract(&self, path: &Path) -> Result<Vec<MeasurementRecord>, ExtractError> {
        let file = File::open(path)?;
        extract_measurement_records(file, &file_name_lossy(path))
    }
}
