use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::PipelineResult;

const CHECKPOINT_SUFFIX: &str = ".checkpoint.json";

/// On-disk shape of one checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckpointEntry {
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

/// Named JSON snapshots kept in one directory
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> PipelineResult<Self> {
        fs::create_dir_all(dir.as_ref())?;
        Ok(CheckpointStore {
            dir: dir.as_ref().to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> PathBuf {
        let safe: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}{}", safe, CHECKPOINT_SUFFIX))
    }

    /// Persist `data` under `name`, replacing any earlier snapshot
    pub fn create(&self, name: &str, data: serde_json::Value) -> PipelineResult<PathBuf> {
        let entry = CheckpointEntry {
            timestamp: Utc::now(),
            data,
        };
        let path = self.path_for(name);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&entry)?)?;
        fs::rename(&tmp, &path)?;
        log::debug!("Checkpoint '{}' written to {}", name, path.display());
        Ok(path)
    }

    /// Stored data, or `None` when absent or malformed
    pub fn restore(&self, name: &str) -> Option<serde_json::Value> {
        self.restore_entry(name).map(|entry| entry.data)
    }

    pub fn restore_entry(&self, name: &str) -> Option<CheckpointEntry> {
        let path = self.path_for(name);
        let text = fs::read_to_string(&path).ok()?;
        match serde_json::from_str::<CheckpointEntry>(&text) {
            Ok(entry) => Some(entry),
            Err(e) => {
                log::warn!("Ignoring malformed checkpoint {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Names of stored checkpoints, sorted
    pub fn list(&self) -> PipelineResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let file_name = entry?.file_name().to_string_lossy().to_string();
            if let Some(name) = file_name.strip_suffix(CHECKPOINT_SUFFIX) {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn remove(&self, name: &str) -> PipelineResult<bool> {
        let path = self.path_for(name);
        if path.exists() {
            fs::remove_file(path)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn clear(&self) -> PipelineResult<usize> {
        let names = self.list()?;
        for name in &names {
            self.remove(name)?;
        }
        Ok(names.len())
    }
}

/// Conversion progress stored in checkpoints; resume skips whole tables
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConversionProgress {
    pub source: String,
    pub completed_tables: Vec<String>,
    pub current_table: Option<String>,
    pub records_done: u64,
}

impl ConversionProgress {
    pub fn is_completed(&self, table: &str) -> bool {
        self.completed_tables.iter().any(|t| t == table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_create_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        store.create("run-1", json!({"tables": ["A"], "records": 10})).unwrap();

        assert_eq!(store.restore("run-1"), Some(json!({"tables": ["A"], "records": 10})));
        assert_eq!(store.restore("missing"), None);
        assert_eq!(store.list().unwrap(), vec!["run-1".to_string()]);
    }

    #[test]
    fn test_malformed_entries_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        fs::write(dir.path().join("bad.checkpoint.json"), r#"{"data": 1}"#).unwrap();
        fs::write(dir.path().join("extra.checkpoint.json"), r#"{"timestamp": "2024-01-01T00:00:00Z", "data": 1, "x": 2}"#).unwrap();
        fs::write(dir.path().join("junk.checkpoint.json"), "not json").unwrap();

        assert_eq!(store.restore("bad"), None);
        assert_eq!(store.restore("extra"), None);
        assert_eq!(store.restore("junk"), None);
    }

    #[test]
    fn test_progress_round_trip_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let progress = ConversionProgress {
            source: "a.phd".to_string(),
            completed_tables: vec!["WELLS".to_string()],
            current_table: Some("PROD".to_string()),
            records_done: 1200,
        };
        store.create("a.phd", serde_json::to_value(&progress).unwrap()).unwrap();
        let restored: ConversionProgress = serde_json::from_value(store.restore("a.phd").unwrap()).unwrap();
        assert_eq!(restored, progress);
        assert!(restored.is_completed("WELLS"));

        assert_eq!(store.clear().unwrap(), 1);
        assert!(store.list().unwrap().is_empty());
    }
}
