//! Run file persistence.
//!
//! The run file is one JSON object mapping run id to [`RunRecord`]. It is always
//! loaded in full, modified in memory and rewritten in full. Writes go to a
//! temporary file in the same directory which is then renamed over the target, so
//! a crash mid-write leaves the previous file intact.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::AppResult;
use crate::experiment::record::{RunId, RunRecord};

/// Every run stored in one run file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunDocument {
    runs: BTreeMap<String, RunRecord>,
}

impl RunDocument {
    /// Empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the run stored under `run_id`.
    ///
    /// Returns the record previously stored under that id.
    pub fn merge(&mut self, run_id: &RunId, record: RunRecord) -> Option<RunRecord> {
        self.runs.insert(run_id.as_str().to_string(), record)
    }

    /// Record stored under `run_id`.
    pub fn get(&self, run_id: &RunId) -> Option<&RunRecord> {
        self.runs.get(run_id.as_str())
    }

    /// True if a run is stored under `run_id`.
    pub fn contains(&self, run_id: &RunId) -> bool {
        self.runs.contains_key(run_id.as_str())
    }

    /// Stored run ids, sorted.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.runs.keys().map(String::as_str)
    }

    /// Number of stored runs.
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    /// True if no runs are stored.
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

/// Handle to a run file on disk.
#[derive(Debug, Clone)]
pub struct RunStore {
    path: PathBuf,
}

impl RunStore {
    /// Store backed by the file at `path`. Nothing is read until [`RunStore::load`].
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the run file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole document. A missing or empty file is an empty document.
    pub fn load(&self) -> AppResult<RunDocument> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Run file {} not found, starting empty", self.path.display());
                return Ok(RunDocument::new());
            }
            Err(e) => return Err(e.into()),
        };
        if text.trim().is_empty() {
            return Ok(RunDocument::new());
        }
        let document: RunDocument = serde_json::from_str(&text)?;
        debug!(
            "Loaded {} run(s) from {}",
            document.len(),
            self.path.display()
        );
        Ok(document)
    }

    /// Replace the run file with `document`.
    pub fn save(&self, document: &RunDocument) -> AppResult<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            serde_json::to_writer(&mut writer, document)?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;

        info!(
            "Saved {} run(s) to {}",
            document.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Load the file, merge one run into it and write it back.
    pub fn merge_and_save(&self, run_id: &RunId, record: RunRecord) -> AppResult<RunDocument> {
        let mut document = self.load()?;
        document.merge(run_id, record);
        self.save(&document)?;
        Ok(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(comment: &str) -> RunRecord {
        RunRecord {
            comment: comment.to_string(),
            rs: 1e5,
            duc_gain: 1e6,
            nreads: 20,
            ..Default::default()
        }
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempdir().unwrap();
        let store = RunStore::new(dir.path().join("IVY_RunData.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn round_trip_preserves_other_runs() {
        let dir = tempdir().unwrap();
        let store = RunStore::new(dir.path().join("IVY_RunData.json"));

        let first = RunId::new("IVY.v1.1 DUC (Gain=1e6; Rs=1e5) 01/01/2026 10:00:00");
        let second = RunId::new("IVY.v1.1 DUC (Gain=1e6; Rs=1e5) 02/01/2026 10:00:00");
        store.merge_and_save(&first, record("first")).unwrap();
        store.merge_and_save(&second, record("second")).unwrap();

        let document = store.load().unwrap();
        assert_eq!(document.len(), 2);
        assert_eq!(document.get(&first), Some(&record("first")));
        assert_eq!(document.get(&second), Some(&record("second")));
    }

    #[test]
    fn merge_replaces_existing_id() {
        let mut document = RunDocument::new();
        let id = RunId::new("run");
        assert!(document.merge(&id, record("a")).is_none());
        let previous = document.merge(&id, record("b")).unwrap();
        assert_eq!(previous.comment, "a");
        assert_eq!(document.len(), 1);
    }

    #[test]
    fn file_is_a_json_object_keyed_by_run_id() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("runs.json");
        let store = RunStore::new(&path);
        store
            .merge_and_save(&RunId::new("run-1"), record("x"))
            .unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["run-1"]["Comment"], "x");
        assert_eq!(value["run-1"]["Nreads"], 20);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("runs.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(RunStore::new(&path).load().is_err());
    }

    #[test]
    fn save_into_missing_directory_fails_without_creating_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent").join("runs.json");
        let store = RunStore::new(&path);
        assert!(store.save(&RunDocument::new()).is_err());
        assert!(!path.exists());
    }
}
