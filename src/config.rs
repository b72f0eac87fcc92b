use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use glob::Pattern;
use serde::{Deserialize, Serialize};

use crate::model::StreamKind;

pub const CONFIG_FILE_NAME: &str = "ingest_config.json";
pub const DB_FILE_NAME: &str = "xray_data.sqlite";

pub fn default_db_path(data_root: &Path) -> PathBuf {
    data_root.join(DB_FILE_NAME)
}

/// Pipeline settings, loaded once per process and passed by reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub db_path: Option<PathBuf>,

    #[serde(default)]
    pub lot_info: StreamConfig,

    #[serde(default)]
    pub void_results: StreamConfig,

    /// Upper bound on listing a single source root, in seconds.
    #[serde(default = "default_root_timeout_secs")]
    pub root_timeout_secs: u64,

    #[serde(default = "default_busy_timeout_secs")]
    pub busy_timeout_secs: u64,

    /// Compare a SHA-256 of the content in addition to mtime and size.
    #[serde(default)]
    pub verify_checksum: bool,

    /// Consecutive failed attempts after which a file is quarantined.
    #[serde(default)]
    pub max_failed_attempts: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default)]
    pub roots: Vec<PathBuf>,

    /// Local archive scanned instead of `roots` in migration mode.
    #[serde(default)]
    pub legacy_root: Option<PathBuf>,

    #[serde(default)]
    pub pattern: Option<String>,

    #[serde(default)]
    pub batch_size: Option<usize>,
}

/// Per-stream settings with defaults applied and the pattern compiled.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub kind: StreamKind,
    pub roots: Vec<PathBuf>,
    pub pattern: Pattern,
    pub batch_size: usize,
    pub root_timeout: Duration,
    pub verify_checksum: bool,
    pub max_failed_attempts: Option<u32>,
}

fn default_root_timeout_secs() -> u64 {
    10
}

fn default_busy_timeout_secs() -> u64 {
    30
}

pub fn default_pattern(kind: StreamKind) -> &'static str {
    match kind {
        StreamKind::LotInfo => "*.lotx",
        StreamKind::VoidResults => "XRAY_SIC_*.csv",
    }
}

pub fn default_batch_size(kind: StreamKind) -> usize {
    match kind {
        StreamKind::LotInfo => 100,
        StreamKind::VoidResults => 5000,
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            lot_info: StreamConfig::default(),
            void_results: StreamConfig::default(),
            root_timeout_secs: default_root_timeout_secs(),
            busy_timeout_secs: default_busy_timeout_secs(),
            verify_checksum: false,
            max_failed_attempts: None,
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let config: PipelineConfig = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Loads `explicit` if given, else `<data_root>/ingest_config.json` if it exists.
    pub fn load_or_default(explicit: Option<&Path>, data_root: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = explicit {
            return Ok((Self::load(path)?, Some(path.to_path_buf())));
        }

        let candidate = data_root.join(CONFIG_FILE_NAME);
        if candidate.exists() {
            return Ok((Self::load(&candidate)?, Some(candidate)));
        }

        Ok((Self::default(), None))
    }

    pub fn stream(&self, kind: StreamKind) -> &StreamConfig {
        match kind {
            StreamKind::LotInfo => &self.lot_info,
            StreamKind::VoidResults => &self.void_results,
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_secs(self.busy_timeout_secs)
    }

    pub fn stream_settings(&self, kind: StreamKind, migrate: bool) -> Result<StreamSettings> {
        let stream = self.stream(kind);
        let pattern_text = stream
            .pattern
            .as_deref()
            .unwrap_or_else(|| default_pattern(kind));
        let pattern = Pattern::new(pattern_text)
            .with_context(|| format!("invalid {kind} file pattern: {pattern_text}"))?;

        let roots = if migrate {
            stream.legacy_root.iter().cloned().collect()
        } else {
            stream.roots.clone()
        };

        Ok(StreamSettings {
            kind,
            roots,
            pattern,
            batch_size: stream
                .batch_size
                .filter(|size| *size > 0)
                .unwrap_or_else(|| default_batch_size(kind)),
            root_timeout: Duration::from_secs(self.root_timeout_secs.max(1)),
            verify_checksum: self.verify_checksum,
            max_failed_attempts: self.max_failed_attempts.filter(|cap| *cap > 0),
        })
    }
}
