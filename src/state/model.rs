//! Hierarchical work model persisted by the [`StateStore`](super::StateStore).
//!
//! The tree is Feature → Epic → Story → Task. Every type here is plain data;
//! mutation happens only through [`Op`](super::Op)s applied by the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use uuid::Uuid;

use crate::abort::AbortReport;
use crate::checkpoint::{CheckpointId, CheckpointPolicy};
use crate::review::{Finding, FindingSeverity, ReviewVerdict};

/// Current on-disk format version of the state file. Older files are
/// migrated on read (see [`migrate`](super::migrate)).
pub const STATE_VERSION: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpicStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    #[default]
    InProgress,
    WaitingReview,
    Done,
}

impl fmt::Display for StoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InProgress => "in_progress",
            Self::WaitingReview => "waiting_review",
            Self::Done => "done",
        };
        write!(f, "{}", s)
    }
}

/// Terminal status of one dispatched unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failure,
    Skipped,
}

impl RunStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

/// Where a task came from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskOrigin {
    #[default]
    Planned,
    /// Remediation task created from a failed review.
    Finding {
        severity: FindingSeverity,
        location: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub story_id: String,
    pub description: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Dispatch attempts that ended in `failure` since the last reset.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub origin: TaskOrigin,
}

impl Task {
    pub fn new(id: &str, story_id: &str, description: &str, depends_on: Vec<String>) -> Self {
        Self {
            id: id.to_string(),
            story_id: story_id.to_string(),
            description: description.to_string(),
            done: false,
            depends_on,
            attempts: 0,
            last_status: None,
            last_error: None,
            origin: TaskOrigin::Planned,
        }
    }
}

/// The most recent review of a story.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub round: u32,
    pub verdict: ReviewVerdict,
    #[serde(default)]
    pub findings: Vec<Finding>,
    /// Set once the loop has acted on the verdict.
    #[serde(default)]
    pub acknowledged: bool,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Story {
    pub id: String,
    pub epic_id: String,
    pub title: String,
    #[serde(default)]
    pub status: StoryStatus,
    /// Path prefixes the story is allowed to touch. Empty means unrestricted.
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<ReviewRecord>,
    /// Number of completed review evaluations.
    #[serde(default)]
    pub review_round: u32,
    /// Consecutive reviewer errors since the last successful evaluation.
    #[serde(default)]
    pub review_failures: u32,
}

impl Story {
    pub fn new(id: &str, epic_id: &str, title: &str) -> Self {
        Self {
            id: id.to_string(),
            epic_id: epic_id.to_string(),
            title: title.to_string(),
            status: StoryStatus::InProgress,
            scope: Vec::new(),
            tasks: Vec::new(),
            review: None,
            review_round: 0,
            review_failures: 0,
        }
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn incomplete_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(|t| !t.done)
    }

    pub fn all_tasks_done(&self) -> bool {
        self.tasks.iter().all(|t| t.done)
    }

    /// Whether any work on this story has happened yet.
    pub fn has_progress(&self) -> bool {
        self.status != StoryStatus::InProgress
            || self.review.is_some()
            || self.tasks.iter().any(|t| t.done || t.last_status.is_some())
    }

    /// Whether the latest review is an acknowledged pass.
    pub fn passed_review(&self) -> bool {
        self.review
            .as_ref()
            .is_some_and(|r| r.acknowledged && r.verdict.is_pass())
    }

    /// Scope entries match whole path components: `src/auth` covers
    /// `src/auth/login.rs` but not `src/authz/mod.rs`.
    pub fn is_in_scope(&self, location: &str) -> bool {
        let path = Path::new(location.trim_start_matches("./"));
        self.scope.is_empty()
            || self.scope.iter().any(|prefix| {
                let prefix = prefix.trim_start_matches("./").trim_end_matches('/');
                !prefix.is_empty() && path.starts_with(prefix)
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Epic {
    pub id: String,
    pub feature_id: String,
    pub title: String,
    #[serde(default)]
    pub status: EpicStatus,
    #[serde(default)]
    pub stories: Vec<Story>,
}

impl Epic {
    pub fn new(id: &str, feature_id: &str, title: &str) -> Self {
        Self {
            id: id.to_string(),
            feature_id: feature_id.to_string(),
            title: title.to_string(),
            status: EpicStatus::Pending,
            stories: Vec::new(),
        }
    }

    pub fn story(&self, id: &str) -> Option<&Story> {
        self.stories.iter().find(|s| s.id == id)
    }

    pub fn all_stories_done(&self) -> bool {
        self.stories.iter().all(|s| s.status == StoryStatus::Done)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub status: FeatureStatus,
    /// Set when the feature completes; archived features are read-only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub epics: Vec<Epic>,
}

impl Feature {
    pub fn new(id: &str, description: &str) -> Self {
        Self {
            id: id.to_string(),
            description: description.to_string(),
            active: false,
            status: FeatureStatus::Pending,
            archived_at: None,
            epics: Vec::new(),
        }
    }

    pub fn epic(&self, id: &str) -> Option<&Epic> {
        self.epics.iter().find(|e| e.id == id)
    }

    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    pub fn all_epics_completed(&self) -> bool {
        self.epics.iter().all(|e| e.status == EpicStatus::Completed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockerSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::str::FromStr for BlockerSeverity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => anyhow::bail!(
                "Invalid blocker severity '{}'. Valid values: low, medium, high, critical",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blocker {
    pub id: String,
    pub description: String,
    pub severity: BlockerSeverity,
    /// Entity path the blocker applies to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Blocker {
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}

/// Immutable audit record, one per applied transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub seq: u64,
    pub transition_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub delta: Vec<super::Op>,
}

/// History entries moved out of the state file by compaction. Their
/// transition ids stay here so replayed transitions are still recognized.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryArchive {
    /// Number of entries moved to the archive file so far.
    #[serde(default)]
    pub entries: u64,
    /// `seq` of the newest archived entry.
    #[serde(default)]
    pub through_seq: u64,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub transition_ids: BTreeSet<Uuid>,
}

/// Current position inside the active feature.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epic_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_id: Option<String>,
}

/// Operator decision on a pending checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Proceed,
    Defer,
}

impl std::str::FromStr for Decision {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "proceed" | "yes" | "y" => Ok(Self::Proceed),
            "defer" | "no" | "n" => Ok(Self::Defer),
            _ => anyhow::bail!("Invalid decision '{}'. Valid values: proceed, defer", s),
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Proceed => write!(f, "proceed"),
            Self::Defer => write!(f, "defer"),
        }
    }
}

/// A suspension waiting for an external confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCheckpoint {
    pub id: Uuid,
    pub checkpoint: CheckpointId,
    /// Identifies the unit of work this checkpoint guards.
    pub action_key: String,
    pub entity_path: String,
    pub summary: String,
    pub requested_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
}

/// A confirmed checkpoint that has not yet been consumed by its work commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointGrant {
    pub checkpoint: CheckpointId,
    pub action_key: String,
}

/// Persisted loop status. Transient states (dispatching, verifying,
/// advancing) are never written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    #[default]
    Idle,
    AwaitingCheckpoint,
    Aborted,
    Complete,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoopRecord {
    #[serde(default)]
    pub status: LoopStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingCheckpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grant: Option<CheckpointGrant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort: Option<AbortReport>,
}

/// A complete, consistent view of the persisted state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    /// Incremented on every applied transition.
    pub revision: u64,
    #[serde(default)]
    pub features: Vec<Feature>,
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub policy: CheckpointPolicy,
    #[serde(default)]
    pub loop_record: LoopRecord,
    #[serde(default)]
    pub blockers: Vec<Blocker>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub archive: HistoryArchive,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            revision: 0,
            features: Vec::new(),
            position: Position::default(),
            policy: CheckpointPolicy::default(),
            loop_record: LoopRecord::default(),
            blockers: Vec::new(),
            history: Vec::new(),
            archive: HistoryArchive::default(),
        }
    }
}

impl Snapshot {
    pub fn active_feature(&self) -> Option<&Feature> {
        self.features.iter().find(|f| f.active)
    }

    pub fn feature(&self, id: &str) -> Option<&Feature> {
        self.features.iter().find(|f| f.id == id)
    }

    pub fn current_epic(&self) -> Option<&Epic> {
        let epic_id = self.position.epic_id.as_deref()?;
        self.active_feature()?.epic(epic_id)
    }

    pub fn current_story(&self) -> Option<&Story> {
        let story_id = self.position.story_id.as_deref()?;
        self.current_epic()?.story(story_id)
    }

    /// Find a story anywhere in the tree.
    pub fn find_story(&self, id: &str) -> Option<&Story> {
        self.features
            .iter()
            .flat_map(|f| f.epics.iter())
            .flat_map(|e| e.stories.iter())
            .find(|s| s.id == id)
    }

    /// Find a task anywhere in the tree.
    pub fn find_task(&self, id: &str) -> Option<&Task> {
        self.features
            .iter()
            .flat_map(|f| f.epics.iter())
            .flat_map(|e| e.stories.iter())
            .flat_map(|s| s.tasks.iter())
            .find(|t| t.id == id)
    }

    pub fn open_blockers(&self) -> impl Iterator<Item = &Blocker> {
        self.blockers.iter().filter(|b| b.is_open())
    }

    /// Whether a transition with this id was ever applied, including ones
    /// whose history entry has since been archived.
    pub fn has_transition(&self, id: Uuid) -> bool {
        self.archive.transition_ids.contains(&id)
            || self.history.iter().any(|h| h.transition_id == id)
    }

    /// Path of the first entity whose id matches, e.g.
    /// `feature:F1/epic:E1/story:S1/task:T1`.
    pub fn entity_path(&self, id: &str) -> Option<String> {
        for feature in &self.features {
            let fp = feature_path(&feature.id);
            if feature.id == id {
                return Some(fp);
            }
            for epic in &feature.epics {
                let ep = format!("{}/epic:{}", fp, epic.id);
                if epic.id == id {
                    return Some(ep);
                }
                for story in &epic.stories {
                    let sp = format!("{}/story:{}", ep, story.id);
                    if story.id == id {
                        return Some(sp);
                    }
                    if let Some(task) = story.task(id) {
                        return Some(format!("{}/task:{}", sp, task.id));
                    }
                }
            }
        }
        None
    }

    /// Checkpoints that currently suspend the loop.
    pub fn effective_checkpoints(&self) -> Vec<CheckpointId> {
        CheckpointId::ALL
            .iter()
            .copied()
            .filter(|c| self.policy.is_enabled(*c))
            .collect()
    }
}

pub fn feature_path(feature_id: &str) -> String {
    format!("feature:{}", feature_id)
}

pub fn epic_path(feature_id: &str, epic_id: &str) -> String {
    format!("feature:{}/epic:{}", feature_id, epic_id)
}

pub fn story_path(feature_id: &str, epic_id: &str, story_id: &str) -> String {
    format!("feature:{}/epic:{}/story:{}", feature_id, epic_id, story_id)
}

pub fn task_path(feature_id: &str, epic_id: &str, story_id: &str, task_id: &str) -> String {
    format!(
        "feature:{}/epic:{}/story:{}/task:{}",
        feature_id, epic_id, story_id, task_id
    )
}
