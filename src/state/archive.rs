//! Files the store keeps beside `state.json`: rotating backups under
//! `backups/` and archived history entries under `history/`.
//!
//! ```text
//! .stride/
//!   state.json
//!   backups/state.1.json   previous revision (newest)
//!   backups/state.N.json   oldest kept
//!   backups/state.v1.json  copy taken before migrating a version 1 file
//!   history/archive.jsonl  one HistoryEntry per line, oldest first
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::model::HistoryEntry;
use crate::errors::StoreError;

pub const DEFAULT_BACKUPS: usize = 3;

/// One rotating backup on disk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupInfo {
    /// 1 is the most recent.
    pub slot: usize,
    pub path: PathBuf,
    pub modified: Option<DateTime<Utc>>,
    /// Revision stored in the backup, when it could be read.
    pub revision: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompactionReport {
    pub archived: usize,
    pub kept: usize,
    pub archive_path: PathBuf,
}

pub fn backup_slot(dir: &Path, slot: usize) -> PathBuf {
    dir.join(format!("state.{}.json", slot))
}

pub fn migration_backup(dir: &Path, version: u32) -> PathBuf {
    dir.join(format!("state.v{}.json", version))
}

fn backup_err(path: &Path) -> impl Fn(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Backup {
        path: path.to_path_buf(),
        source,
    }
}

/// Shift `state.1..keep` down by one slot and put the current `state_file`
/// into slot 1. The oldest slot falls off.
pub fn rotate(state_file: &Path, dir: &Path, keep: usize) -> Result<(), StoreError> {
    if keep == 0 || !state_file.exists() {
        return Ok(());
    }
    fs::create_dir_all(dir).map_err(backup_err(dir))?;

    let oldest = backup_slot(dir, keep);
    match fs::remove_file(&oldest) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(backup_err(&oldest)(err)),
    }
    for slot in (1..keep).rev() {
        let from = backup_slot(dir, slot);
        if from.exists() {
            let to = backup_slot(dir, slot + 1);
            fs::rename(&from, &to).map_err(backup_err(&to))?;
        }
    }

    // The state file is replaced by rename, so a hard link keeps the old
    // contents without copying them.
    let newest = backup_slot(dir, 1);
    if let Err(err) = fs::hard_link(state_file, &newest) {
        debug!(error = %err, "hard link failed; copying backup");
        fs::copy(state_file, &newest).map_err(backup_err(&newest))?;
    }
    Ok(())
}

/// Copy the unmigrated file aside once. An existing copy is kept.
pub fn keep_pre_migration_copy(state_file: &Path, dir: &Path, version: u32) -> Result<PathBuf, StoreError> {
    let target = migration_backup(dir, version);
    if !target.exists() {
        fs::create_dir_all(dir).map_err(backup_err(dir))?;
        fs::copy(state_file, &target).map_err(backup_err(&target))?;
    }
    Ok(target)
}

/// Existing backup slots, newest first.
pub fn list(dir: &Path, keep: usize) -> Vec<BackupInfo> {
    (1..=keep)
        .map(|slot| backup_slot(dir, slot))
        .enumerate()
        .filter(|(_, path)| path.exists())
        .map(|(i, path)| {
            let modified = fs::metadata(&path)
                .and_then(|m| m.modified())
                .ok()
                .map(DateTime::<Utc>::from);
            let revision = fs::read_to_string(&path)
                .ok()
                .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok())
                .and_then(|value| value.get("revision").and_then(serde_json::Value::as_u64));
            BackupInfo {
                slot: i + 1,
                path,
                modified,
                revision,
            }
        })
        .collect()
}

/// Append `entries` to the archive file and flush them to disk.
pub fn append(path: &Path, entries: &[HistoryEntry]) -> Result<(), StoreError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(backup_err(dir))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(backup_err(path))?;
    let mut buf = String::new();
    for entry in entries {
        buf.push_str(&serde_json::to_string(entry).map_err(StoreError::Serialize)?);
        buf.push('\n');
    }
    file.write_all(buf.as_bytes()).map_err(backup_err(path))?;
    file.sync_all().map_err(backup_err(path))?;
    Ok(())
}

/// Archived entries in `seq` order. An entry appended twice (a compaction
/// interrupted before the state file was rewritten) is returned once, and a
/// torn trailing line is skipped.
pub fn read(path: &Path) -> Result<Vec<HistoryEntry>, StoreError> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(StoreError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let mut by_seq = BTreeMap::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|source| StoreError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<HistoryEntry>(&line) {
            Ok(entry) => {
                by_seq.insert(entry.seq, entry);
            }
            Err(err) => warn!(line = n + 1, error = %err, "skipping unreadable archive line"),
        }
    }
    Ok(by_seq.into_values().collect())
}
