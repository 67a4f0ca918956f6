//! Persistent work state: the Feature → Epic → Story → Task tree, the loop
//! record and the append-only history.
//!
//! All reads go through [`StateStore::get_state`] and all writes through
//! [`StateStore::apply`], which validates every [`Transition`] before it is
//! made durable. Older state files are migrated on read, every write keeps
//! a rotating set of backups, and old history entries can be archived.

pub mod archive;
pub mod migrate;
pub mod model;
pub mod plan;
pub mod store;
pub mod transition;
pub mod validate;

pub use archive::{BackupInfo, CompactionReport};
pub use model::{
    Blocker, BlockerSeverity, CheckpointGrant, Decision, Epic, EpicStatus, Feature,
    FeatureStatus, HistoryArchive, HistoryEntry, LoopRecord, LoopStatus, PendingCheckpoint,
    Position, ReviewRecord, RunStatus, STATE_VERSION, Snapshot, Story, StoryStatus, Task,
    TaskOrigin, epic_path, feature_path, story_path, task_path,
};
pub use plan::{PlanFile, compute_plan_hash};
pub use store::{StateStore, WriterLease};
pub use transition::{Op, Transition};
pub use validate::{validate, validate_snapshot};
