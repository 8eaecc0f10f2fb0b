//! Per-worker ingestion checkpoint.
//!
//! The checkpoint file is the only resumption state. It is rewritten in full
//! through a temp file and rename after every committed batch.

use crate::error::{PipelineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

const MAX_ERROR_LOG: usize = 100;

/// Write `bytes` to `path` through a temp file in the same directory and
/// an atomic rename. A crash leaves either the old file or the new one.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| PipelineError::Io(e.error))?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointError {
    pub block: u64,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub worker_id: usize,
    pub range_start: u64,
    pub range_end: u64,
    /// Last block whose batch was fully written. `None` before the first batch.
    pub last_block: Option<u64>,
    pub events_ingested: u64,
    pub batches_committed: u64,
    pub errors: Vec<CheckpointError>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(worker_id: usize, range_start: u64, range_end: u64) -> Self {
        Self {
            worker_id,
            range_start,
            range_end,
            last_block: None,
            events_ingested: 0,
            batches_committed: 0,
            errors: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// Start a new range, carrying counters and the error log forward.
    pub fn reassign(&self, range_start: u64, range_end: u64) -> Self {
        Self {
            range_start,
            range_end,
            last_block: None,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    pub fn next_block(&self) -> u64 {
        match self.last_block {
            Some(b) => b + 1,
            None => self.range_start,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.next_block() > self.range_end
    }

    /// Advance past a batch. Only called once the batch is durably written.
    pub fn commit_batch(&mut self, to_block: u64, inserted: u64) -> Result<()> {
        if to_block < self.next_block() || to_block > self.range_end {
            return Err(PipelineError::Checkpoint(format!(
                "worker {}: batch end {} outside pending range {}..={}",
                self.worker_id,
                to_block,
                self.next_block(),
                self.range_end
            )));
        }
        self.last_block = Some(to_block);
        self.events_ingested += inserted;
        self.batches_committed += 1;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn record_error(&mut self, block: u64, message: impl Into<String>) {
        self.errors.push(CheckpointError {
            block,
            message: message.into(),
            at: Utc::now(),
        });
        if self.errors.len() > MAX_ERROR_LOG {
            let excess = self.errors.len() - MAX_ERROR_LOG;
            self.errors.drain(..excess);
        }
        self.updated_at = Utc::now();
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let s = fs::read_to_string(path)?;
        let cp: Checkpoint = serde_json::from_str(&s)
            .map_err(|e| PipelineError::Checkpoint(format!("{}: {}", path.display(), e)))?;
        if cp.range_start > cp.range_end + 1 || cp.last_block.map_or(false, |b| b > cp.range_end) {
            return Err(PipelineError::Checkpoint(format!(
                "{}: inconsistent range {}..={} last {:?}",
                path.display(),
                cp.range_start,
                cp.range_end,
                cp.last_block
            )));
        }
        Ok(Some(cp))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomic(path, serde_json::to_string_pretty(self)?.as_bytes())
    }
}

pub fn checkpoint_path(dir: &Path, worker_id: usize) -> PathBuf {
    dir.join(format!("worker_{}.json", worker_id))
}

/// All checkpoints in `dir`, ordered by worker id.
pub fn load_all(dir: &Path) -> Result<Vec<Checkpoint>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_checkpoint = path
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(false, |n| n.starts_with("worker_") && n.ends_with(".json"));
        if is_checkpoint {
            if let Some(cp) = Checkpoint::load(&path)? {
                out.push(cp);
            }
        }
    }
    out.sort_by_key(|c| c.worker_id);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn resumes_after_last_committed_block() {
        let mut cp = Checkpoint::new(0, 100, 299);
        assert_eq!(cp.next_block(), 100);
        cp.commit_batch(199, 12).unwrap();
        assert_eq!(cp.next_block(), 200);
        assert!(!cp.is_complete());
        cp.commit_batch(299, 3).unwrap();
        assert!(cp.is_complete());
        assert_eq!(cp.events_ingested, 15);
        assert_eq!(cp.batches_committed, 2);
    }

    #[test]
    fn refuses_to_move_backwards_or_past_range() {
        let mut cp = Checkpoint::new(1, 100, 199);
        cp.commit_batch(150, 1).unwrap();
        assert!(cp.commit_batch(120, 1).is_err());
        assert!(cp.commit_batch(500, 1).is_err());
        assert_eq!(cp.last_block, Some(150));
    }

    #[test]
    fn error_log_is_bounded() {
        let mut cp = Checkpoint::new(0, 0, 10);
        for i in 0..(MAX_ERROR_LOG as u64 + 5) {
            cp.record_error(i, "429");
        }
        assert_eq!(cp.errors.len(), MAX_ERROR_LOG);
        assert_eq!(cp.errors[0].block, 5);
    }

    #[test]
    fn save_load_and_reject_corruption() {
        let dir = TempDir::new().unwrap();
        let path = checkpoint_path(dir.path(), 3);
        let mut cp = Checkpoint::new(3, 10, 20);
        cp.commit_batch(15, 4).unwrap();
        cp.record_error(16, "HTTP 503");
        cp.save(&path).unwrap();
        assert_eq!(Checkpoint::load(&path).unwrap(), Some(cp));
        assert_eq!(load_all(dir.path()).unwrap().len(), 1);

        fs::write(&path, "{\"worker_id\": 3, \"range_st").unwrap();
        assert!(matches!(Checkpoint::load(&path), Err(PipelineError::Checkpoint(_))));
    }

    #[test]
    fn write_atomic_replaces_whole_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("state.json");
        write_atomic(&path, b"{\"a\":1}").unwrap();
        write_atomic(&path, b"{\"a\":2}").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"a\":2}");
    }
}
