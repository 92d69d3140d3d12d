//! Durable run state: one JSON checkpoint per run, rewritten atomically, and
//! a lock file that keeps two processes off the same run.

use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::planner::StreamRequest;
use crate::state_machine::JobSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Running,
    Cancelled,
    Completed,
    PartialFailure,
    /// Stopped before finishing: bad topology or no instance left.
    Aborted,
}

/// Everything needed to pick a run back up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub status: RunPhase,
    /// Re-planned on resume; job ids are deterministic.
    pub requests: Vec<StreamRequest>,
    pub jobs: Vec<JobSummary>,
    /// Streams whose final output reached storage.
    #[serde(default)]
    pub uploaded_streams: BTreeSet<String>,
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    pub fn new(run_id: impl Into<String>, requests: Vec<StreamRequest>, jobs: Vec<JobSummary>) -> Self {
        Self {
            run_id: run_id.into(),
            status: RunPhase::Running,
            requests,
            jobs,
            uploaded_streams: BTreeSet::new(),
            updated_at: Utc::now(),
        }
    }
}

fn validate_run_id(run_id: &str) -> Result<(), StoreError> {
    let valid = !run_id.is_empty()
        && !run_id.starts_with('.')
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidRunId(run_id.to_string()))
    }
}

/// Serializes `value` into a temp file in `dir`, syncs it and renames it
/// onto `target`. The temp file is removed when any step fails.
fn write_atomically<T: Serialize>(dir: &Path, target: &Path, value: &T) -> Result<(), StoreError> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, value)?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(target).map_err(|e| StoreError::Io(e.error))?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn checkpoint_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }

    pub fn exists(&self, run_id: &str) -> bool {
        self.checkpoint_path(run_id).is_file()
    }

    /// Writes the checkpoint atomically. A crash or error at any point leaves
    /// either the old or the new checkpoint, never a torn one.
    pub fn save(&self, state: &RunState) -> Result<(), StoreError> {
        validate_run_id(&state.run_id)?;
        fs::create_dir_all(&self.dir)?;
        write_atomically(&self.dir, &self.checkpoint_path(&state.run_id), state)?;

        debug!(run_id = %state.run_id, jobs = state.jobs.len(), "checkpoint written");
        Ok(())
    }

    pub fn load(&self, run_id: &str) -> Result<RunState, StoreError> {
        validate_run_id(run_id)?;
        let raw = match fs::read_to_string(self.checkpoint_path(run_id)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(run_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&raw)?)
    }

    /// Run ids with a checkpoint, sorted.
    pub fn list(&self) -> Result<Vec<String>, StoreError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
                && validate_run_id(stem).is_ok()
            {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Exclusive claim on a run id, held for the lifetime of the value.
#[derive(Debug)]
pub struct RunLease {
    path: PathBuf,
}

impl RunLease {
    fn lock_path(dir: &Path, run_id: &str) -> PathBuf {
        dir.join(format!("{run_id}.lock"))
    }

    pub fn acquire(dir: &Path, run_id: &str) -> Result<Self, StoreError> {
        validate_run_id(run_id)?;
        fs::create_dir_all(dir)?;
        let path = Self::lock_path(dir, run_id);

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(StoreError::LeaseHeld {
                    run_id: run_id.to_string(),
                    path: path.display().to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        writeln!(file, "{} {}", std::process::id(), Utc::now().to_rfc3339())?;
        debug!(run_id, "lease acquired");
        Ok(Self { path })
    }

    /// Removes a lease left behind by a process that died. Returns whether
    /// a lock file was there.
    pub fn break_stale(dir: &Path, run_id: &str) -> Result<bool, StoreError> {
        validate_run_id(run_id)?;
        match fs::remove_file(Self::lock_path(dir, run_id)) {
            Ok(()) => {
                warn!(run_id, "stale lease removed");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for RunLease {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to release lease");
        }
    }
}
