//! Typed error hierarchy for stride.
//!
//! - `ValidationError`: a transition would break a state invariant
//! - `StoreError`: persistence and locking failures around the state file
//! - `DispatchError`: a batch could not be dispatched at all
//! - `OrchestratorError`: failures surfaced by the orchestration loop
//!
//! Every variant names the entity path (or file path) and the offending fact.

use std::path::PathBuf;
use thiserror::Error;

/// A transition was rejected because it would violate an invariant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("More than one active feature: {}", ids.join(", "))]
    MultipleActiveFeatures { ids: Vec<String> },

    #[error("No active feature while {pending} feature(s) are not completed")]
    NoActiveFeature { pending: usize },

    #[error("Active feature {path} is already completed")]
    ActiveFeatureCompleted { path: String },

    #[error("{path} is done but {fact}")]
    StoryDoneWithoutPass { path: String, fact: String },

    #[error("{path} was completed and would be reverted without a course correction")]
    TaskReverted { path: String },

    #[error("{path} is already done; {fact}")]
    TaskAlreadyDone { path: String, fact: String },

    #[error("Position references {path}: {fact}")]
    InvalidPosition { path: String, fact: String },

    #[error("Unknown entity {path}")]
    UnknownEntity { path: String },

    #[error("Duplicate id '{id}' at {path}")]
    DuplicateId { id: String, path: String },

    #[error("{path} depends on unknown task '{dependency}'")]
    UnknownDependency { path: String, dependency: String },

    #[error("Checkpoint policy is inconsistent: {fact}")]
    PolicyInconsistent { fact: String },

    #[error("{path} is archived and cannot change")]
    Archived { path: String },

    #[error("{path} is {status} but {fact}")]
    InconsistentStatus {
        path: String,
        status: String,
        fact: String,
    },

    #[error("Loop record is inconsistent: {fact}")]
    LoopRecordInconsistent { fact: String },

    #[error("Invalid operation on {path}: {fact}")]
    InvalidOperation { path: String, fact: String },

    #[error("Loop was aborted ({reason} at {path}) before this change could land")]
    LoopAborted { reason: String, path: String },
}

/// Errors from the persistent state store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Failed to read state file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write state file at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("State file at {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("State file at {path} has unsupported version {found}")]
    UnsupportedVersion { path: PathBuf, found: u32 },

    #[error("Failed to lock {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Backup or archive file {path} could not be written: {source}")]
    Backup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No backup in slot {slot} ({path})")]
    BackupMissing { slot: usize, path: PathBuf },

    #[error("Another orchestration loop holds the writer lease ({path})")]
    WriterBusy { path: PathBuf },

    #[error("Failed to serialize state: {0}")]
    Serialize(#[source] serde_json::Error),
}

impl StoreError {
    /// The validation error behind this failure, if any.
    pub fn as_validation(&self) -> Option<&ValidationError> {
        match self {
            Self::Validation(v) => Some(v),
            _ => None,
        }
    }
}

/// A batch could not be dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("Dependency cycle among tasks: {}", tasks.join(" -> "))]
    Cycle { tasks: Vec<String> },

    #[error("Task '{task}' appears more than once in the batch")]
    DuplicateTask { task: String },

    #[error("Task '{task}' depends on '{dependency}', which is neither in the batch nor done")]
    UnsatisfiedDependency { task: String, dependency: String },
}

/// Errors surfaced by the orchestration loop.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("Loop is aborted ({reason} at {entity_path}: {fact}); call resume after resolving it")]
    Aborted {
        reason: crate::abort::AbortReason,
        entity_path: String,
        fact: String,
    },

    #[error("Confirmation channel closed while waiting at checkpoint {checkpoint}")]
    ConfirmationClosed { checkpoint: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
