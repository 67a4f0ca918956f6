//! Durable, transactional state store.
//!
//! ## Architecture
//!
//! ```text
//! apply(transition)
//!   ├─ in-process mutex ─┐
//!   ├─ flock(state.lock) ┘  serialize writers across threads and processes
//!   ├─ read state.json            (always from disk, no cache; older versions migrated)
//!   ├─ seen transition id? ──► return current snapshot unchanged
//!   ├─ ops applied to a clone ─► validate(prev, next, ops)
//!   ├─ revision += 1, history entry appended
//!   ├─ history over its limit? ──► oldest entries moved to history/archive.jsonl
//!   ├─ previous state.json ──► backups/state.1.json (older slots shift down)
//!   └─ tempfile + rename          (readers see old or new, never partial)
//! ```
//!
//! A separate [`WriterLease`] on `loop.lock` guarantees that at most one
//! orchestration loop drives the store at a time. Control commands issued by
//! an operator go through [`StateStore::apply`] without a lease.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use fs2::FileExt;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use super::archive::{self, BackupInfo, CompactionReport, DEFAULT_BACKUPS};
use super::migrate;
use super::model::{HistoryEntry, STATE_VERSION, Snapshot};
use super::transition::Transition;
use super::validate::{validate, validate_snapshot};
use crate::errors::StoreError;

/// History entries kept in `state.json` before the oldest are archived.
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

#[derive(Debug)]
pub struct StateStore {
    state_file: PathBuf,
    lock_file: PathBuf,
    lease_file: PathBuf,
    backup_dir: PathBuf,
    archive_file: PathBuf,
    backups: usize,
    history_limit: Option<usize>,
    apply_guard: Mutex<()>,
}

/// Exclusive right to run the orchestration loop. Released on drop.
#[derive(Debug)]
pub struct WriterLease {
    file: File,
    path: PathBuf,
}

impl WriterLease {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WriterLease {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %err, "failed to release writer lease");
        }
    }
}

/// A snapshot read from disk and the format version it was stored in.
struct Loaded {
    snapshot: Snapshot,
    written_as: u32,
}

impl StateStore {
    /// Open a store rooted at `state_file`. Lock files live next to it.
    /// The file itself is created lazily by the first transition.
    pub fn open(state_file: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let state_file = state_file.into();
        let dir = state_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&dir).map_err(|source| StoreError::Write {
            path: dir.clone(),
            source,
        })?;
        Ok(Self {
            lock_file: dir.join("state.lock"),
            lease_file: dir.join("loop.lock"),
            backup_dir: dir.join("backups"),
            archive_file: dir.join("history").join("archive.jsonl"),
            backups: DEFAULT_BACKUPS,
            history_limit: Some(DEFAULT_HISTORY_LIMIT),
            state_file,
            apply_guard: Mutex::new(()),
        })
    }

    /// Number of previous revisions kept under `backups/`. Zero disables them.
    pub fn with_backups(mut self, keep: usize) -> Self {
        self.backups = keep;
        self
    }

    /// Archive the oldest half of the history once it grows past `limit`
    /// entries. `None` (or zero) keeps everything in the state file.
    pub fn with_history_limit(mut self, limit: Option<usize>) -> Self {
        self.history_limit = limit.filter(|l| *l > 0);
        self
    }

    pub fn path(&self) -> &Path {
        &self.state_file
    }

    pub fn archive_path(&self) -> &Path {
        &self.archive_file
    }

    /// Current snapshot. An absent state file reads as the empty snapshot.
    pub fn get_state(&self) -> Result<Snapshot, StoreError> {
        let lock = self.open_lock(&self.lock_file)?;
        FileExt::lock_shared(&lock).map_err(|source| StoreError::Lock {
            path: self.lock_file.clone(),
            source,
        })?;
        let result = self.read_from_disk();
        let _ = FileExt::unlock(&lock);
        result.map(|loaded| loaded.snapshot)
    }

    /// [`get_state`](Self::get_state) on tokio's blocking pool, so async
    /// pollers never park a runtime thread on the state lock.
    pub async fn read_async(self: &Arc<Self>) -> Result<Snapshot, StoreError> {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || store.get_state())
            .await
            .map_err(|err| StoreError::Read {
                path: self.state_file.clone(),
                source: std::io::Error::other(err),
            })?
    }

    /// Apply `transition` atomically.
    ///
    /// Re-applying a transition whose id is already in history is a no-op
    /// that returns the current snapshot. A transition that would violate an
    /// invariant leaves the store untouched and returns
    /// [`StoreError::Validation`].
    pub fn apply(&self, transition: &Transition) -> Result<Snapshot, StoreError> {
        self.exclusive(|| self.apply_locked(transition))
    }

    fn exclusive<T>(
        &self,
        f: impl FnOnce() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _guard = self
            .apply_guard
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let lock = self.open_lock(&self.lock_file)?;
        FileExt::lock_exclusive(&lock).map_err(|source| StoreError::Lock {
            path: self.lock_file.clone(),
            source,
        })?;
        let result = f();
        let _ = FileExt::unlock(&lock);
        result
    }

    fn apply_locked(&self, transition: &Transition) -> Result<Snapshot, StoreError> {
        let Loaded {
            snapshot: current,
            written_as,
        } = self.read_from_disk()?;
        if current.has_transition(transition.id) {
            debug!(id = %transition.id, action = %transition.action, "transition already applied");
            return Ok(current);
        }

        let mut next = current.clone();
        for op in &transition.ops {
            if let Err(err) = op.apply_to(&mut next) {
                warn!(id = %transition.id, op = op.name(), error = %err, "transition rejected");
                return Err(err.into());
            }
        }
        if let Err(err) = validate(&current, &next, &transition.ops) {
            warn!(id = %transition.id, action = %transition.action, error = %err, "transition rejected");
            return Err(err.into());
        }

        next.version = STATE_VERSION;
        next.revision = current.revision + 1;
        next.history.push(HistoryEntry {
            seq: next.revision,
            transition_id: transition.id,
            timestamp: Utc::now(),
            action: transition.action.clone(),
            delta: transition.ops.clone(),
        });
        if let Some(limit) = self.history_limit
            && next.history.len() > limit
        {
            self.archive_oldest(&mut next, limit / 2)?;
        }
        self.keep_unmigrated(written_as)?;
        self.write_atomic(&next)?;

        info!(
            revision = next.revision,
            action = %transition.action,
            ops = transition.ops.len(),
            "state committed"
        );
        Ok(next)
    }

    /// Rewrite an older state file in the current format. Returns the version
    /// it was upgraded from, or `None` when it was already current.
    pub fn migrate(&self) -> Result<Option<u32>, StoreError> {
        self.exclusive(|| {
            let Some(Loaded {
                snapshot,
                written_as,
            }) = self.load(&self.state_file)?
            else {
                return Ok(None);
            };
            if written_as == STATE_VERSION {
                return Ok(None);
            }
            self.keep_unmigrated(written_as)?;
            self.write_atomic(&snapshot)?;
            Ok(Some(written_as))
        })
    }

    /// Move all but the newest `keep` history entries to the archive file.
    /// Their transition ids stay in the snapshot, so replays remain no-ops.
    pub fn compact_history(&self, keep: usize) -> Result<CompactionReport, StoreError> {
        self.exclusive(|| {
            let Loaded {
                snapshot: mut next,
                written_as,
            } = self.read_from_disk()?;
            let archived = self.archive_oldest(&mut next, keep)?;
            if archived > 0 {
                self.keep_unmigrated(written_as)?;
                self.write_atomic(&next)?;
            }
            Ok(CompactionReport {
                archived,
                kept: next.history.len(),
                archive_path: self.archive_file.clone(),
            })
        })
    }

    /// Entries moved out of the state file by compaction, oldest first.
    pub fn archived_history(&self) -> Result<Vec<HistoryEntry>, StoreError> {
        archive::read(&self.archive_file)
    }

    /// Rotating backups on disk, newest first.
    pub fn list_backups(&self) -> Vec<BackupInfo> {
        archive::list(&self.backup_dir, self.backups)
    }

    /// Replace the current state with backup `slot` (1 is the newest). The
    /// state being replaced becomes the new slot 1, so a restore can be
    /// undone. Refused while an orchestration loop holds the writer lease.
    pub fn restore_backup(&self, slot: usize) -> Result<Snapshot, StoreError> {
        let _lease = self.acquire_writer()?;
        let path = archive::backup_slot(&self.backup_dir, slot);
        self.exclusive(|| {
            let Some(Loaded { mut snapshot, .. }) = self.load(&path)? else {
                return Err(StoreError::BackupMissing {
                    slot,
                    path: path.clone(),
                });
            };
            snapshot.version = STATE_VERSION;
            self.write_atomic(&snapshot)?;
            warn!(slot, revision = snapshot.revision, "state restored from backup");
            Ok(snapshot)
        })
    }

    /// Take the single-writer lease for an orchestration loop.
    pub fn acquire_writer(&self) -> Result<WriterLease, StoreError> {
        let file = self.open_lock(&self.lease_file)?;
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                debug!(path = %self.lease_file.display(), "writer lease acquired");
                Ok(WriterLease {
                    file,
                    path: self.lease_file.clone(),
                })
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                Err(StoreError::WriterBusy {
                    path: self.lease_file.clone(),
                })
            }
            Err(source) => Err(StoreError::Lock {
                path: self.lease_file.clone(),
                source,
            }),
        }
    }

    fn open_lock(&self, path: &Path) -> Result<File, StoreError> {
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| StoreError::Lock {
                path: path.to_path_buf(),
                source,
            })
    }

    fn archive_oldest(&self, snapshot: &mut Snapshot, keep: usize) -> Result<usize, StoreError> {
        let excess = snapshot.history.len().saturating_sub(keep);
        if excess == 0 {
            return Ok(0);
        }
        let moved: Vec<HistoryEntry> = snapshot.history.drain(..excess).collect();
        archive::append(&self.archive_file, &moved)?;
        snapshot.archive.entries += moved.len() as u64;
        if let Some(last) = moved.last() {
            snapshot.archive.through_seq = last.seq;
        }
        snapshot
            .archive
            .transition_ids
            .extend(moved.iter().map(|e| e.transition_id));
        info!(
            archived = moved.len(),
            kept = snapshot.history.len(),
            path = %self.archive_file.display(),
            "history compacted"
        );
        Ok(moved.len())
    }

    /// Before the first write over an older-format file, copy it aside.
    fn keep_unmigrated(&self, written_as: u32) -> Result<(), StoreError> {
        if written_as < STATE_VERSION {
            let copy =
                archive::keep_pre_migration_copy(&self.state_file, &self.backup_dir, written_as)?;
            info!(
                from = written_as,
                to = STATE_VERSION,
                backup = %copy.display(),
                "upgrading state file"
            );
        }
        Ok(())
    }

    fn read_from_disk(&self) -> Result<Loaded, StoreError> {
        Ok(self.load(&self.state_file)?.unwrap_or_else(|| Loaded {
            snapshot: Snapshot::default(),
            written_as: STATE_VERSION,
        }))
    }

    fn load(&self, path: &Path) -> Result<Option<Loaded>, StoreError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let corrupt = |source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        };
        let mut value: serde_json::Value = serde_json::from_str(&content).map_err(corrupt)?;
        let written_as =
            migrate::migrate(&mut value).map_err(|found| StoreError::UnsupportedVersion {
                path: path.to_path_buf(),
                found,
            })?;
        let snapshot: Snapshot = serde_json::from_value(value).map_err(corrupt)?;
        validate_snapshot(&snapshot)?;
        Ok(Some(Loaded {
            snapshot,
            written_as,
        }))
    }

    fn write_atomic(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(snapshot).map_err(StoreError::Serialize)?;
        let dir = self
            .state_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let write_err = |source| StoreError::Write {
            path: self.state_file.clone(),
            source,
        };
        let mut tmp = NamedTempFile::new_in(&dir).map_err(write_err)?;
        tmp.write_all(json.as_bytes()).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        if let Err(err) = archive::rotate(&self.state_file, &self.backup_dir, self.backups) {
            warn!(error = %err, "state backup rotation failed");
        }
        tmp.persist(&self.state_file)
            .map_err(|err| write_err(err.error))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ValidationError;
    use crate::state::model::{Epic, Feature, Story, Task};
    use crate::state::{Op, RunStatus};
    use tempfile::tempdir;
    use uuid::Uuid;

    fn make_store(dir: &Path) -> StateStore {
        StateStore::open(dir.join(".stride").join("state.json")).unwrap()
    }

    fn feature() -> Feature {
        let mut story = Story::new("S1", "E1", "Story");
        story.tasks.push(Task::new("T1", "S1", "first", vec![]));
        let mut epic = Epic::new("E1", "F1", "Epic");
        epic.stories.push(story);
        let mut feature = Feature::new("F1", "Feature");
        feature.epics.push(epic);
        feature
    }

    fn import(store: &StateStore) -> Snapshot {
        let t = Transition::new("import")
            .op(Op::ImportFeature { feature: feature() })
            .op(Op::ActivateFeature {
                feature_id: "F1".into(),
            });
        store.apply(&t).unwrap()
    }

    #[test]
    fn test_missing_file_reads_as_empty() {
        let dir = tempdir().unwrap();
        let store = make_store(dir.path());
        let snap = store.get_state().unwrap();
        assert_eq!(snap, Snapshot::default());
    }

    #[test]
    fn test_apply_persists_and_records_history() {
        let dir = tempdir().unwrap();
        let store = make_store(dir.path());
        let snap = import(&store);
        assert_eq!(snap.revision, 1);
        assert_eq!(snap.history.len(), 1);
        assert_eq!(snap.history[0].action, "import");

        let reopened = make_store(dir.path());
        assert_eq!(reopened.get_state().unwrap(), snap);
    }

    #[test]
    fn test_reapplying_same_id_is_noop() {
        let dir = tempdir().unwrap();
        let store = make_store(dir.path());
        import(&store);
        let t = Transition::new("run T1").with_id(Uuid::new_v4()).op(Op::RecordTaskRun {
            task_id: "T1".into(),
            status: RunStatus::Failure,
            error: Some("boom".into()),
        });
        let first = store.apply(&t).unwrap();
        let second = store.apply(&t).unwrap();
        assert_eq!(first, second);
        assert_eq!(second.find_task("T1").unwrap().attempts, 1);
        assert_eq!(second.history.len(), 2);
    }

    #[test]
    fn test_rejected_transition_leaves_state_untouched() {
        let dir = tempdir().unwrap();
        let store = make_store(dir.path());
        let before = import(&store);
        let t = Transition::new("bad")
            .op(Op::RecordTaskRun {
                task_id: "T1".into(),
                status: RunStatus::Failure,
                error: None,
            })
            .op(Op::SetPosition {
                epic_id: Some("E404".into()),
                story_id: None,
            });
        let err = store.apply(&t).unwrap_err();
        assert!(matches!(
            err.as_validation(),
            Some(ValidationError::InvalidPosition { .. })
        ));
        assert_eq!(store.get_state().unwrap(), before);
    }

    #[test]
    fn test_writer_lease_is_exclusive() {
        let dir = tempdir().unwrap();
        let store = make_store(dir.path());
        let lease = store.acquire_writer().unwrap();
        let err = store.acquire_writer().unwrap_err();
        assert!(matches!(err, StoreError::WriterBusy { .. }));
        drop(lease);
        assert!(store.acquire_writer().is_ok());
    }

    #[test]
    fn test_corrupt_file_is_reported() {
        let dir = tempdir().unwrap();
        let store = make_store(dir.path());
        fs::write(store.path(), "{not json").unwrap();
        assert!(matches!(
            store.get_state().unwrap_err(),
            StoreError::Corrupt { .. }
        ));
    }

    #[test]
    fn test_unsupported_version_is_reported() {
        let dir = tempdir().unwrap();
        let store = make_store(dir.path());
        let snap = Snapshot {
            version: 99,
            ..Default::default()
        };
        fs::write(store.path(), serde_json::to_string(&snap).unwrap()).unwrap();
        assert!(matches!(
            store.get_state().unwrap_err(),
            StoreError::UnsupportedVersion { found: 99, .. }
        ));
    }

    #[test]
    fn test_concurrent_appliers_serialize() {
        let dir = tempdir().unwrap();
        let store = std::sync::Arc::new(make_store(dir.path()));
        import(&store);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let t = Transition::new(format!("blocker {i}")).op(Op::AddBlocker {
                        blocker: crate::state::Blocker {
                            id: format!("B{i}"),
                            description: "question".into(),
                            severity: crate::state::BlockerSeverity::Low,
                            entity: None,
                            timestamp: Utc::now(),
                            resolved_at: None,
                        },
                    });
                    store.apply(&t).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let snap = store.get_state().unwrap();
        assert_eq!(snap.blockers.len(), 8);
        assert_eq!(snap.revision, 9);
    }

    fn blocker(i: usize) -> Transition {
        Transition::new(format!("blocker {i}")).op(Op::AddBlocker {
            blocker: crate::state::Blocker {
                id: format!("B{i}"),
                description: "question".into(),
                severity: crate::state::BlockerSeverity::Low,
                entity: None,
                timestamp: Utc::now(),
                resolved_at: None,
            },
        })
    }

    fn write_v1(store: &StateStore) -> Snapshot {
        let snap = import(store);
        let mut value = serde_json::to_value(&snap).unwrap();
        let root = value.as_object_mut().unwrap();
        root.insert("version".into(), serde_json::json!(1));
        root.remove("archive");
        fs::write(store.path(), serde_json::to_string_pretty(&value).unwrap()).unwrap();
        snap
    }

    fn version_on_disk(path: &Path) -> u64 {
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        value["version"].as_u64().unwrap()
    }

    #[test]
    fn test_v1_file_is_read_and_upgraded_on_next_write() {
        let dir = tempdir().unwrap();
        let store = make_store(dir.path()).with_backups(0);
        let before = write_v1(&store);

        let read = store.get_state().unwrap();
        assert_eq!(read.version, STATE_VERSION);
        assert_eq!(read.revision, before.revision);
        assert_eq!(version_on_disk(store.path()), 1, "reads never rewrite the file");

        store.apply(&blocker(1)).unwrap();
        assert_eq!(version_on_disk(store.path()), STATE_VERSION as u64);
        let copy = dir.path().join(".stride/backups/state.v1.json");
        assert_eq!(version_on_disk(&copy), 1);
    }

    #[test]
    fn test_explicit_migrate_rewrites_once() {
        let dir = tempdir().unwrap();
        let store = make_store(dir.path());
        write_v1(&store);
        assert_eq!(store.migrate().unwrap(), Some(1));
        assert_eq!(version_on_disk(store.path()), STATE_VERSION as u64);
        assert_eq!(store.migrate().unwrap(), None);
    }

    #[test]
    fn test_each_write_backs_up_the_previous_revision() {
        let dir = tempdir().unwrap();
        let store = make_store(dir.path()).with_backups(2);
        import(&store);
        for i in 0..4 {
            store.apply(&blocker(i)).unwrap();
        }
        let revisions: Vec<_> = store.list_backups().iter().map(|b| b.revision).collect();
        assert_eq!(revisions, vec![Some(4), Some(3)]);
    }

    #[test]
    fn test_restore_brings_back_an_earlier_revision() {
        let dir = tempdir().unwrap();
        let store = make_store(dir.path());
        import(&store);
        store.apply(&blocker(1)).unwrap();
        store.apply(&blocker(2)).unwrap();

        let restored = store.restore_backup(1).unwrap();
        assert_eq!(restored.revision, 2);
        assert_eq!(store.get_state().unwrap().blockers.len(), 1);
        // the replaced state is now the newest backup
        assert_eq!(store.list_backups()[0].revision, Some(3));

        assert!(matches!(
            store.restore_backup(4).unwrap_err(),
            StoreError::BackupMissing { slot: 4, .. }
        ));
    }

    #[test]
    fn test_restore_is_refused_while_a_loop_runs() {
        let dir = tempdir().unwrap();
        let store = make_store(dir.path());
        import(&store);
        store.apply(&blocker(1)).unwrap();
        let _lease = store.acquire_writer().unwrap();
        assert!(matches!(
            store.restore_backup(1).unwrap_err(),
            StoreError::WriterBusy { .. }
        ));
    }

    #[test]
    fn test_compaction_keeps_replays_idempotent() {
        let dir = tempdir().unwrap();
        let store = make_store(dir.path());
        let import_t = Transition::new("import")
            .op(Op::ImportFeature { feature: feature() })
            .op(Op::ActivateFeature {
                feature_id: "F1".into(),
            });
        store.apply(&import_t).unwrap();
        for i in 0..5 {
            store.apply(&blocker(i)).unwrap();
        }

        let report = store.compact_history(2).unwrap();
        assert_eq!(report.archived, 4);
        assert_eq!(report.kept, 2);

        let snap = store.get_state().unwrap();
        assert_eq!(snap.history.len(), 2);
        assert_eq!(snap.archive.entries, 4);
        assert_eq!(snap.archive.through_seq, 4);
        assert_eq!(snap.revision, 6);

        let replayed = store.apply(&import_t).unwrap();
        assert_eq!(replayed.revision, 6);

        let archived: Vec<u64> = store
            .archived_history()
            .unwrap()
            .iter()
            .map(|e| e.seq)
            .collect();
        assert_eq!(archived, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_history_over_limit_is_archived_automatically() {
        let dir = tempdir().unwrap();
        let store = make_store(dir.path()).with_history_limit(Some(4));
        import(&store);
        for i in 0..6 {
            store.apply(&blocker(i)).unwrap();
        }
        let snap = store.get_state().unwrap();
        assert!(snap.history.len() <= 4);
        assert_eq!(snap.archive.entries + snap.history.len() as u64, snap.revision);
        assert_eq!(
            store.archived_history().unwrap().len() as u64,
            snap.archive.entries
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_read_async_leaves_the_runtime_free_while_locked() {
        let dir = tempdir().unwrap();
        let store = std::sync::Arc::new(make_store(dir.path()));
        import(&store);

        let lock_path = dir.path().join(".stride").join("state.lock");
        let (held_tx, held_rx) = std::sync::mpsc::channel();
        let holder = std::thread::spawn(move || {
            let file = OpenOptions::new().write(true).open(lock_path).unwrap();
            FileExt::lock_exclusive(&file).unwrap();
            held_tx.send(()).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(400));
            FileExt::unlock(&file).unwrap();
        });
        held_rx.recv().unwrap();

        let reader = tokio::spawn({
            let store = store.clone();
            async move { store.read_async().await }
        });
        let started = std::time::Instant::now();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(started.elapsed() < std::time::Duration::from_millis(300));

        let snap = reader.await.unwrap().unwrap();
        assert_eq!(snap.revision, 1);
        holder.join().unwrap();
    }
}
