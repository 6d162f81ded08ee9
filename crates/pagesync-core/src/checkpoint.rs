//! Resumable progress markers.
//!
//! A [`Checkpoint`] records how far a sync job got: the offset below which
//! every record has been retrieved, and the signature of the query that
//! produced it. Checkpoints are stored under the query's job key, so running
//! the same job with a different query shape finds the old checkpoint and
//! reports it as a mismatch instead of silently resuming the wrong query.
//!
//! [`CheckpointManager`] drives a store for one operation: it decides where
//! to start, persists progress as pages are committed, and deletes the
//! checkpoint when the run completes without errors.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::storage::JsonDir;
use crate::{Notice, QuerySignature, QuerySpec, Result};

/// Persisted pagination progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// Job the checkpoint belongs to.
    pub job_key: String,
    /// Signature of the query that produced it.
    pub query_signature: QuerySignature,
    /// Every record before this offset has been retrieved.
    pub last_completed_offset: u64,
    /// When the checkpoint was written.
    pub saved_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Create a checkpoint stamped with the current time.
    #[must_use]
    pub fn new(job_key: impl Into<String>, query_signature: QuerySignature, offset: u64) -> Self {
        Self {
            job_key: job_key.into(),
            query_signature,
            last_completed_offset: offset,
            saved_at: Utc::now(),
        }
    }
}

/// Durable key-value store for checkpoints, keyed by job key.
pub trait CheckpointStore: Send + Sync {
    /// Load the checkpoint for `job_key`, if one exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreadable.
    fn load(&self, job_key: &str) -> Result<Option<Checkpoint>>;

    /// Insert or replace the checkpoint for `checkpoint.job_key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint cannot be persisted.
    fn save(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Delete the checkpoint for `job_key`. Deleting a missing checkpoint is
    /// not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be modified.
    fn clear(&self, job_key: &str) -> Result<()>;
}

/// Process-local checkpoint store.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    entries: Mutex<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self, job_key: &str) -> Result<Option<Checkpoint>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(job_key).cloned())
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(checkpoint.job_key.clone(), checkpoint.clone());
        Ok(())
    }

    fn clear(&self, job_key: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(job_key);
        Ok(())
    }
}

/// One JSON file per job key, written atomically.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: JsonDir,
}

impl FileCheckpointStore {
    /// Store checkpoints under `dir`.
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: JsonDir::new(dir),
        }
    }

    /// Directory holding the checkpoint files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        self.dir.root()
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self, job_key: &str) -> Result<Option<Checkpoint>> {
        self.dir.read(job_key)
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.dir.write(&checkpoint.job_key, checkpoint)
    }

    fn clear(&self, job_key: &str) -> Result<()> {
        self.dir.remove(job_key)
    }
}

/// Where an operation should start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePoint {
    /// First offset to fetch.
    pub offset: u64,
    /// Set when a checkpoint was used or rejected.
    pub notice: Option<Notice>,
}

/// Tracks and persists progress for one operation.
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    job_key: String,
    signature: QuerySignature,
    committed: u64,
    unsaved: usize,
    every: usize,
}

impl CheckpointManager {
    /// Look up the stored checkpoint for `spec` and decide where to start.
    ///
    /// A checkpoint recorded for a different query signature is deleted and
    /// reported through [`Notice::CheckpointMismatch`]; the operation then
    /// starts at offset 0.
    ///
    /// `every` is the number of committed pages between saves (at least 1).
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read, or a stale checkpoint
    /// cannot be removed.
    pub fn begin(
        store: Arc<dyn CheckpointStore>,
        spec: &QuerySpec,
        every: usize,
    ) -> Result<(Self, ResumePoint)> {
        let job_key = spec.job_key().to_string();
        let signature = spec.signature();

        let resume = match store.load(&job_key)? {
            Some(stored) if stored.query_signature == signature => {
                info!(
                    "resuming '{}' from offset {} (saved {})",
                    job_key, stored.last_completed_offset, stored.saved_at
                );
                ResumePoint {
                    offset: stored.last_completed_offset,
                    notice: Some(Notice::ResumedFromCheckpoint {
                        job_key: job_key.clone(),
                        offset: stored.last_completed_offset,
                    }),
                }
            },
            Some(stored) => {
                warn!(
                    "checkpoint for '{}' was recorded for query {} but the query is now {}; restarting from offset 0",
                    job_key, stored.query_signature, signature
                );
                store.clear(&job_key)?;
                ResumePoint {
                    offset: 0,
                    notice: Some(Notice::CheckpointMismatch {
                        job_key: job_key.clone(),
                        stored: stored.query_signature.to_string(),
                        current: signature.to_string(),
                    }),
                }
            },
            None => ResumePoint {
                offset: 0,
                notice: None,
            },
        };

        let manager = Self {
            store,
            job_key,
            signature,
            committed: resume.offset,
            unsaved: 0,
            every: every.max(1),
        };
        Ok((manager, resume))
    }

    /// Highest committed offset.
    #[must_use]
    pub const fn committed(&self) -> u64 {
        self.committed
    }

    /// Job key checkpoints are stored under.
    #[must_use]
    pub fn job_key(&self) -> &str {
        &self.job_key
    }

    /// Record that every record before `offset` has been retrieved.
    ///
    /// Offsets at or below the current watermark are ignored. The checkpoint
    /// is saved once every `every` commits.
    ///
    /// # Errors
    ///
    /// Returns an error if a due save fails.
    pub fn commit(&mut self, offset: u64) -> Result<()> {
        if offset <= self.committed {
            return Ok(());
        }
        self.committed = offset;
        self.unsaved += 1;
        if self.unsaved >= self.every {
            self.flush()?;
        }
        Ok(())
    }

    /// Save any progress not yet persisted.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the write.
    pub fn flush(&mut self) -> Result<()> {
        if self.unsaved == 0 {
            return Ok(());
        }
        let checkpoint =
            Checkpoint::new(self.job_key.clone(), self.signature.clone(), self.committed);
        self.store.save(&checkpoint)?;
        debug!("checkpoint '{}' at offset {}", self.job_key, self.committed);
        self.unsaved = 0;
        Ok(())
    }

    /// The run completed without errors: delete the checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be modified.
    pub fn finish(self) -> Result<()> {
        self.store.clear(&self.job_key)?;
        debug!("checkpoint '{}' cleared after completion", self.job_key);
        Ok(())
    }

    /// Forget all progress, moving the watermark back to 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be modified.
    pub fn reset(&mut self) -> Result<()> {
        self.store.clear(&self.job_key)?;
        self.committed = 0;
        self.unsaved = 0;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn spec(filter: &str) -> QuerySpec {
        QuerySpec::builder("https://example.com/orders")
            .filter(filter)
            .page_size(100)
            .build(100)
            .unwrap()
    }

    #[test]
    fn test_fresh_start() {
        let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
        let (manager, resume) = CheckpointManager::begin(store, &spec("a"), 1).unwrap();
        assert_eq!(resume.offset, 0);
        assert!(resume.notice.is_none());
        assert_eq!(manager.committed(), 0);
    }

    #[test]
    fn test_resume_same_signature() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let spec = spec("a");
        store
            .save(&Checkpoint::new(spec.job_key(), spec.signature(), 300))
            .unwrap();

        let (manager, resume) = CheckpointManager::begin(store, &spec, 1).unwrap();
        assert_eq!(resume.offset, 300);
        assert!(matches!(
            resume.notice,
            Some(Notice::ResumedFromCheckpoint { offset: 300, .. })
        ));
        assert_eq!(manager.committed(), 300);
    }

    #[test]
    fn test_mismatch_restarts_and_reports() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let old = spec("status eq 'open'");
        store
            .save(&Checkpoint::new(old.job_key(), old.signature(), 500))
            .unwrap();

        let new = spec("status eq 'closed'");
        let (_, resume) = CheckpointManager::begin(store.clone(), &new, 1).unwrap();
        assert_eq!(resume.offset, 0);
        match resume.notice {
            Some(Notice::CheckpointMismatch { stored, current, .. }) => {
                assert_eq!(stored, old.signature().to_string());
                assert_eq!(current, new.signature().to_string());
            },
            other => panic!("expected mismatch notice, got {other:?}"),
        }
        assert!(store.load(new.job_key()).unwrap().is_none());
    }

    #[test]
    fn test_commit_is_monotonic() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let spec = spec("a");
        let (mut manager, _) = CheckpointManager::begin(store.clone(), &spec, 1).unwrap();

        manager.commit(200).unwrap();
        manager.commit(100).unwrap();
        manager.commit(200).unwrap();
        assert_eq!(manager.committed(), 200);
        assert_eq!(
            store.load(spec.job_key()).unwrap().unwrap().last_completed_offset,
            200
        );

        manager.reset().unwrap();
        assert_eq!(manager.committed(), 0);
        assert!(store.load(spec.job_key()).unwrap().is_none());
    }

    #[test]
    fn test_save_every_n_pages() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let spec = spec("a");
        let (mut manager, _) = CheckpointManager::begin(store.clone(), &spec, 3).unwrap();

        manager.commit(100).unwrap();
        manager.commit(200).unwrap();
        assert!(store.load(spec.job_key()).unwrap().is_none());
        manager.commit(300).unwrap();
        assert_eq!(
            store.load(spec.job_key()).unwrap().unwrap().last_completed_offset,
            300
        );

        manager.commit(400).unwrap();
        manager.flush().unwrap();
        assert_eq!(
            store.load(spec.job_key()).unwrap().unwrap().last_completed_offset,
            400
        );
    }

    #[test]
    fn test_finish_clears() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let spec = spec("a");
        let (mut manager, _) = CheckpointManager::begin(store.clone(), &spec, 1).unwrap();
        manager.commit(100).unwrap();
        manager.finish().unwrap();
        assert!(store.load(spec.job_key()).unwrap().is_none());
    }

    #[test]
    fn test_file_store_roundtrip() {
        let temp = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(temp.path().join("checkpoints"));
        let spec = spec("a");
        let checkpoint = Checkpoint::new(spec.job_key(), spec.signature(), 700);

        assert!(store.load(spec.job_key()).unwrap().is_none());
        store.save(&checkpoint).unwrap();
        assert_eq!(store.load(spec.job_key()).unwrap(), Some(checkpoint));

        // A second store over the same directory sees it, as after a restart.
        let reopened = FileCheckpointStore::new(temp.path().join("checkpoints"));
        assert!(reopened.load(spec.job_key()).unwrap().is_some());

        store.clear(spec.job_key()).unwrap();
        assert!(reopened.load(spec.job_key()).unwrap().is_none());
    }

    #[test]
    fn test_checkpoint_json_is_camel_case() {
        let checkpoint = Checkpoint::new("job", QuerySignature::from_raw("qs_1"), 42);
        let json = serde_json::to_string(&checkpoint).unwrap();
        assert!(json.contains("\"lastCompletedOffset\":42"));
        assert!(json.contains("\"querySignature\":\"qs_1\""));
        assert!(json.contains("\"jobKey\":\"job\""));
    }
}
