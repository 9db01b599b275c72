//! Durable job list.
//!
//! There is no backend listing endpoint, so the persisted snapshot is the
//! only enumeration of jobs across restarts. Snapshots are written whole;
//! nothing is patched in place.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{TrackerError, TrackerResult};
use crate::job::JobRecord;

/// Persistence adapter for the tracked job list.
///
/// # Contract
///
/// - `load()` MUST NOT fail: an unavailable or unreadable store yields an
///   empty list.
/// - `save()` replaces the whole snapshot; a failed save MUST leave the
///   previous snapshot readable.
pub trait JobStore: Send + Sync {
    /// Load the persisted jobs, most recently submitted first.
    fn load(&self) -> Vec<JobRecord>;

    /// Replace the persisted jobs.
    fn save(&self, records: &[JobRecord]) -> TrackerResult<()>;
}

/// In-process store. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Vec<JobRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-populated with a snapshot.
    pub fn with_records(records: Vec<JobRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }
}

impl JobStore for MemoryStore {
    fn load(&self) -> Vec<JobRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn save(&self, records: &[JobRecord]) -> TrackerResult<()> {
        *self.records.lock().unwrap_or_else(|e| e.into_inner()) = records.to_vec();
        Ok(())
    }
}

/// JSON file store.
///
/// Saves go to a sibling `*.json.tmp` file which is then renamed over the
/// snapshot.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        self.path.with_extension("json.tmp")
    }
}

impl JobStore for FileStore {
    fn load(&self) -> Vec<JobRecord> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "job snapshot unreadable; starting empty");
                return Vec::new();
            }
        };

        let entries: Vec<serde_json::Value> = match serde_json::from_str(&content) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "job snapshot corrupt; starting empty");
                return Vec::new();
            }
        };

        // Skip individual bad entries rather than dropping the snapshot.
        entries
            .into_iter()
            .filter_map(|entry| match serde_json::from_value::<JobRecord>(entry) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), error = %e, "skipping unreadable job entry");
                    None
                }
            })
            .collect()
    }

    fn save(&self, records: &[JobRecord]) -> TrackerResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                TrackerError::Persistence(format!(
                    "Failed to create directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let json = serde_json::to_string_pretty(records).map_err(|e| {
            TrackerError::Persistence(format!("Failed to serialize job snapshot: {}", e))
        })?;

        let tmp_path = self.tmp_path();
        std::fs::write(&tmp_path, json).map_err(|e| {
            TrackerError::Persistence(format!(
                "Failed to write job snapshot to {}: {}",
                tmp_path.display(),
                e
            ))
        })?;

        std::fs::rename(&tmp_path, &self.path).map_err(|e| {
            TrackerError::Persistence(format!(
                "Failed to rename {} to {}: {}",
                tmp_path.display(),
                self.path.display(),
                e
            ))
        })
    }
}
