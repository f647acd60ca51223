use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Durable play-count and completion store consulted at stage boundaries.
/// Assumed always available: implementations log failures instead of
/// returning them.
pub trait ProgressStore {
    fn record_stage_start(&mut self, stage: &str);
    fn record_stage_complete(&mut self, stage: &str, elapsed_seconds: f64);
    fn mark_not_first_time(&mut self);
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageProgress {
    pub play_count: u32,
    pub completion_count: u32,
    pub last_elapsed_seconds: Option<f64>,
    pub best_elapsed_seconds: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub first_time: bool,
    #[serde(default)]
    pub stages: BTreeMap<String, StageProgress>,
}

impl Default for ProgressRecord {
    fn default() -> Self {
        Self {
            first_time: true,
            stages: BTreeMap::new(),
        }
    }
}

impl ProgressRecord {
    pub fn stage(&self, stage: &str) -> Option<&StageProgress> {
        self.stages.get(stage)
    }

    fn apply_start(&mut self, stage: &str) {
        let entry = self.stages.entry(stage.to_string()).or_default();
        entry.play_count = entry.play_count.saturating_add(1);
    }

    fn apply_complete(&mut self, stage: &str, elapsed_seconds: f64) {
        let elapsed_seconds = if elapsed_seconds.is_finite() {
            elapsed_seconds.max(0.0)
        } else {
            0.0
        };
        let entry = self.stages.entry(stage.to_string()).or_default();
        entry.completion_count = entry.completion_count.saturating_add(1);
        entry.last_elapsed_seconds = Some(elapsed_seconds);
        entry.best_elapsed_seconds = Some(match entry.best_elapsed_seconds {
            Some(best) => best.min(elapsed_seconds),
            None => elapsed_seconds,
        });
    }
}

#[derive(Debug, Default)]
pub struct MemoryProgressStore {
    record: ProgressRecord,
}

impl MemoryProgressStore {
    pub fn record(&self) -> &ProgressRecord {
        &self.record
    }
}

impl ProgressStore for MemoryProgressStore {
    fn record_stage_start(&mut self, stage: &str) {
        self.record.apply_start(stage);
    }

    fn record_stage_complete(&mut self, stage: &str, elapsed_seconds: f64) {
        self.record.apply_complete(stage, elapsed_seconds);
    }

    fn mark_not_first_time(&mut self) {
        self.record.first_time = false;
    }
}

#[derive(Debug, Error)]
pub enum ProgressStoreError {
    #[error("failed to read progress file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse progress file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// JSON-file store rewritten atomically after every change.
#[derive(Debug)]
pub struct JsonFileProgressStore {
    path: PathBuf,
    record: ProgressRecord,
}

impl JsonFileProgressStore {
    /// Opens `path`, starting from an empty record when the file does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ProgressStoreError> {
        let path = path.into();
        let record = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).map_err(|source| ProgressStoreError::Parse {
                path: path.clone(),
                source,
            })?,
            Err(error) if error.kind() == io::ErrorKind::NotFound => ProgressRecord::default(),
            Err(source) => {
                return Err(ProgressStoreError::Read {
                    path: path.clone(),
                    source,
                })
            }
        };
        Ok(Self { path, record })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self) -> &ProgressRecord {
        &self.record
    }

    fn persist(&self) {
        let json = match serde_json::to_string_pretty(&self.record) {
            Ok(json) => json,
            Err(error) => {
                warn!(error = %error, "progress_encode_failed");
                return;
            }
        };
        match write_text_atomic(&self.path, &json) {
            Ok(()) => debug!(path = %self.path.display(), "progress_saved"),
            Err(error) => {
                warn!(path = %self.path.display(), error = %error, "progress_write_failed")
            }
        }
    }
}

impl ProgressStore for JsonFileProgressStore {
    fn record_stage_start(&mut self, stage: &str) {
        self.record.apply_start(stage);
        self.persist();
    }

    fn record_stage_complete(&mut self, stage: &str, elapsed_seconds: f64) {
        self.record.apply_complete(stage, elapsed_seconds);
        self.persist();
    }

    fn mark_not_first_time(&mut self) {
        if !self.record.first_time {
            return;
        }
        self.record.first_time = false;
        self.persist();
    }
}

fn write_text_atomic(path: &Path, text: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = temp_path_for(path);
    fs::write(&tmp_path, text.as_bytes())?;
    if let Err(error) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(error);
    }
    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("progress.json");
    path.with_file_name(format!("{file_name}.tmp"))
}
