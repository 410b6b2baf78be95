use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use trellis_core::{hash::hash_goal, Result, TrellisError};

use crate::saved::SavedExecution;

/// Directory of `<goal_hash>.json` snapshots.
///
/// Saves are atomic: the snapshot is written to a temp file and renamed
/// over the target, so an interrupted save never leaves a torn snapshot
/// where a loadable one used to be.
pub struct PlanStore {
    dir: PathBuf,
}

impl PlanStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| {
            TrellisError::Persistence(format!("cannot create plan store at {:?}: {}", dir, e))
        })?;
        Ok(Self { dir })
    }

    pub fn path_for(&self, goal_hash: &str) -> PathBuf {
        self.dir.join(format!("{}.json", goal_hash))
    }

    pub fn save(&self, saved: &SavedExecution) -> Result<PathBuf> {
        let path = self.path_for(&saved.goal_hash);
        let tmp = self.dir.join(format!(".{}.json.tmp", saved.goal_hash));
        let json = saved.to_json()?;
        fs::write(&tmp, json).map_err(|e| {
            TrellisError::Persistence(format!("cannot write snapshot {:?}: {}", tmp, e))
        })?;
        fs::rename(&tmp, &path).map_err(|e| {
            TrellisError::Persistence(format!("cannot move snapshot into place: {}", e))
        })?;
        debug!(path = %path.display(), "snapshot saved");
        Ok(path)
    }

    pub fn load(&self, goal_hash: &str) -> Result<Option<SavedExecution>> {
        let path = self.path_for(goal_hash);
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path).map_err(|e| {
            TrellisError::Persistence(format!("cannot read snapshot {:?}: {}", path, e))
        })?;
        SavedExecution::from_json(&text).map(Some)
    }

    pub fn find_by_goal(&self, goal: &str) -> Result<Option<SavedExecution>> {
        self.load(&hash_goal(goal))
    }

    /// Snapshots newest-first by `updated_at`. Unreadable files are
    /// skipped with a warning, never fatal.
    pub fn list_recent(&self, limit: usize) -> Result<Vec<SavedExecution>> {
        let entries = fs::read_dir(&self.dir).map_err(|e| {
            TrellisError::Persistence(format!("cannot list plan store: {}", e))
        })?;

        let mut snapshots = Vec::new();
        for entry in entries {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(e) => {
                    warn!(error = %e, "unreadable plan store entry, skipping");
                    continue;
                }
            };
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            match fs::read_to_string(&path).map_err(|e| e.to_string()).and_then(|text| {
                SavedExecution::from_json(&text).map_err(|e| e.to_string())
            }) {
                Ok(saved) => snapshots.push(saved),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable snapshot, skipping");
                }
            }
        }

        snapshots.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        snapshots.truncate(limit);
        Ok(snapshots)
    }

    pub fn most_recent(&self) -> Result<Option<SavedExecution>> {
        Ok(self.list_recent(1)?.into_iter().next())
    }

    /// Returns whether a snapshot existed.
    pub fn delete(&self, goal_hash: &str) -> Result<bool> {
        let path = self.path_for(goal_hash);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path).map_err(|e| {
            TrellisError::Persistence(format!("cannot delete snapshot {:?}: {}", path, e))
        })?;
        Ok(true)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
