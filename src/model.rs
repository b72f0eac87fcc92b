use std::fmt;

use serde::{Deserialize, Serialize};

/// Column order of a void result table, as written by the X-ray station.
pub const VOID_RESULT_COLUMNS: [&str; 15] = [
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
];

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    LotInfo,
    VoidResults,
}

impl StreamKind {
    pub const ALL: [StreamKind; 2] = [StreamKind::LotInfo, StreamKind::VoidResults];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::LotInfo => "lot_info",
            Self::VoidResults => "void_results",
        }
    }

}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileStatus {
    Success,
    ErrorEmpty,
    ErrorProcess,
    /// Failed too many consecutive times; skipped until an operator requeues it.
    Quarantined,
}

impl FileStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::ErrorEmpty => "ERROR_EMPTY",
            Self::ErrorProcess => "ERROR_PROCESS",
            Self::Quarantined => "QUARANTINED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "SUCCESS" => Some(Self::Success),
            "ERROR_EMPTY" => Some(Self::ErrorEmpty),
            "ERROR_PROCESS" => Some(Self::ErrorProcess),
            "QUARANTINED" => Some(Self::Quarantined),
            _ => None,
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracker row for one source file within one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: String,
    pub mtime_ns: i64,
    pub size: u64,
    pub status: FileStatus,
    pub processed_at: String,
    pub checksum: Option<String>,
    pub failed_attempts: u32,
}

impl FileEntry {
    pub fn same_metadata(&self, mtime_ns: i64, size: u64) -> bool {
        self.mtime_ns == mtime_ns && self.size == size
    }
}

/// One unit of a lot export, flattened with its tray and lot attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LotRecord {
    pub lot_id: Option<String>,
    pub recipe: Option<String>,
    pub allow_size_null: Option<String>,
    pub count_unique_barcodes_only: Option<String>,
    pub size: i64,
    pub carrier_index: i64,
    pub tray_id: Option<String>,
    pub tray_state: i64,
    pub tray_code: Option<String>,
    pub unit_id: Option<String>,
    pub unit_state: i64,
    pub unit_code: Option<String>,
    pub unit_idx: i64,
    pub source_filename: String,
}

/// One pin measurement row. Values are kept as the station wrote them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeasurementRecord {
    pub board_barcode: Option<String>,
    pub module_index: Option<String>,
    pub joint_type: Option<String>,
    pub pin: Option<String>,
    pub total_void_ratio: Option<String>,
    pub largest_void_ratio: Option<String>,
    pub spread_x: Option<String>,
    pub spread_y: Option<String>,
    pub gv_mean: Option<String>,
    pub defect_code: Option<String>,
    pub system_defect: Option<String>,
    pub pin_status: Option<String>,
    pub lot: Option<String>,
    pub module_status: Option<String>,
    pub device_status: Option<String>,
    pub source_filename: String,
}

impl MeasurementRecord {
    /// Builds a record from values ordered like [`VOID_RESULT_COLUMNS`].
    pub fn from_columns(values: [Option<String>; 15], source_filename: String) -> Self {
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
        ] = values;

        Self {
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
            source_filename,
        }
    }

    pub fn columns(&self) -> [Option<&str>; 15] {
        [
            self.board_barcode.as_deref(),
            self.module_index.as_deref(),
            self.joint_type.as_deref(),
            self.pin.as_deref(),
            self.total_void_ratio.as_deref(),
            self.largest_void_ratio.as_deref(),
            self.spread_x.as_deref(),
            self.spread_y.as_deref(),
            self.gv_mean.as_deref(),
            self.defect_code.as_deref(),
            self.system_defect.as_deref(),
            self.pin_status.as_deref(),
            self.lot.as_deref(),
            self.module_status.as_deref(),
            self.device_status.as_deref(),
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRunResult {
    pub stream: StreamKind,
    pub files_matched: usize,
    pub files_unchanged: usize,
    pub files_candidates: usize,
    pub files_succeeded: usize,
    pub files_empty: usize,
    pub files_failed: usize,
    /// Files moved to QUARANTINED by this run.
    pub files_quarantined: usize,
    /// Quarantined files the scan passed over.
    pub files_held: usize,
    pub files_uncommitted: usize,
    pub batches_committed: usize,
    pub batches_failed: usize,
    pub rows_extracted: usize,
    pub rows_inserted: usize,
    pub roots_skipped: usize,
    pub duration_ms: u64,
    pub fatal_error: Option<String>,
}

impl StreamRunResult {
    pub fn new(stream: StreamKind) -> Self {
        Self {
            stream,
            files_matched: 0,
            files_unchanged: 0,
            files_candidates: 0,
            files_succeeded: 0,
            files_empty: 0,
            files_failed: 0,
            files_quarantined: 0,
            files_held: 0,
            files_uncommitted: 0,
            batches_committed: 0,
            batches_failed: 0,
            rows_extracted: 0,
            rows_inserted: 0,
            roots_skipped: 0,
            duration_ms: 0,
            fatal_error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestPaths {
    pub data_root: String,
    pub db_path: String,
    pub config_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub db_schema_version: String,
    pub mode: String,
    pub status: String,
    pub started_at: String,
    pub updated_at: String,
    pub verify_checksum: bool,
    pub max_failed_attempts: Option<u32>,
    pub paths: IngestPaths,
    pub streams: Vec<StreamRunResult>,
}
