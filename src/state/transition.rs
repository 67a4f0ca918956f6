//! State deltas.
//!
//! A [`Transition`] is an ordered list of [`Op`]s plus a stable id. The store
//! applies the ops to a copy of the snapshot, validates the result and only
//! then writes it, so a transition lands completely or not at all.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::model::{
    Blocker, CheckpointGrant, Decision, EpicStatus, Feature, FeatureStatus, LoopStatus,
    PendingCheckpoint, Position, ReviewRecord, RunStatus, Snapshot, StoryStatus, Task,
};
use crate::abort::AbortReport;
use crate::checkpoint::CheckpointPolicy;
use crate::errors::ValidationError;
use crate::review::{Finding, ReviewVerdict};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    ImportFeature {
        feature: Feature,
    },
    ActivateFeature {
        feature_id: String,
    },
    SetPosition {
        epic_id: Option<String>,
        story_id: Option<String>,
    },
    SetEpicStatus {
        epic_id: String,
        status: EpicStatus,
    },
    SetStoryStatus {
        story_id: String,
        status: StoryStatus,
    },
    RecordTaskRun {
        task_id: String,
        status: RunStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Course correction: the only op allowed to revert a completed task.
    ReopenTask {
        task_id: String,
        reason: String,
    },
    ResetTaskAttempts {
        task_id: String,
    },
    AppendTasks {
        story_id: String,
        tasks: Vec<Task>,
    },
    RecordReview {
        story_id: String,
        verdict: ReviewVerdict,
        findings: Vec<Finding>,
    },
    AcknowledgeReview {
        story_id: String,
    },
    RecordReviewError {
        story_id: String,
        error: String,
    },
    ResetReviewFailures {
        story_id: String,
    },
    CompleteFeature {
        feature_id: String,
    },
    SetPolicy {
        policy: CheckpointPolicy,
    },
    RequestCheckpoint {
        pending: PendingCheckpoint,
    },
    /// Persist an operator decision on the pending checkpoint without acting on it.
    RecordDecision {
        decision: Decision,
    },
    /// Act on a decision: `proceed` turns the pending checkpoint into a grant,
    /// `defer` keeps the loop suspended.
    ResolveCheckpoint {
        decision: Decision,
    },
    ConsumeGrant,
    /// Drop a pending checkpoint that no longer guards the next action.
    ClearCheckpoint,
    SetLoopStatus {
        status: LoopStatus,
    },
    RecordAbort {
        report: AbortReport,
    },
    ClearAbort,
    /// Guard: the transition is rejected if an abort is already recorded.
    ExpectLive,
    AddBlocker {
        blocker: Blocker,
    },
    ResolveBlocker {
        blocker_id: String,
    },
}

/// An atomic, idempotent unit of change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub id: Uuid,
    pub action: String,
    pub ops: Vec<Op>,
}

impl Transition {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            action: action.into(),
            ops: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn op(mut self, op: Op) -> Self {
        self.ops.push(op);
        self
    }

    pub fn push(&mut self, op: Op) {
        self.ops.push(op);
    }

    pub fn extend(&mut self, ops: impl IntoIterator<Item = Op>) {
        self.ops.extend(ops);
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

fn unknown(path: impl Into<String>) -> ValidationError {
    ValidationError::UnknownEntity { path: path.into() }
}

fn invalid(path: impl Into<String>, fact: impl Into<String>) -> ValidationError {
    ValidationError::InvalidOperation {
        path: path.into(),
        fact: fact.into(),
    }
}

/// Mutable lookups used while applying ops. Archived features are never
/// handed out.
impl Snapshot {
    fn feature_mut(&mut self, id: &str) -> Result<&mut Feature, ValidationError> {
        let feature = self
            .features
            .iter_mut()
            .find(|f| f.id == id)
            .ok_or_else(|| unknown(format!("feature:{}", id)))?;
        if feature.is_archived() {
            return Err(ValidationError::Archived {
                path: format!("feature:{}", id),
            });
        }
        Ok(feature)
    }

    fn epic_mut(&mut self, id: &str) -> Result<&mut super::model::Epic, ValidationError> {
        let feature_id = self
            .features
            .iter()
            .find(|f| f.epic(id).is_some())
            .map(|f| f.id.clone())
            .ok_or_else(|| unknown(format!("epic:{}", id)))?;
        let feature = self.feature_mut(&feature_id)?;
        feature
            .epics
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| unknown(format!("epic:{}", id)))
    }

    fn story_mut(&mut self, id: &str) -> Result<&mut super::model::Story, ValidationError> {
        let epic_id = self
            .features
            .iter()
            .flat_map(|f| f.epics.iter())
            .find(|e| e.story(id).is_some())
            .map(|e| e.id.clone())
            .ok_or_else(|| unknown(format!("story:{}", id)))?;
        let epic = self.epic_mut(&epic_id)?;
        epic.stories
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| unknown(format!("story:{}", id)))
    }

    fn task_mut(&mut self, id: &str) -> Result<&mut Task, ValidationError> {
        let story_id = self
            .find_task(id)
            .map(|t| t.story_id.clone())
            .ok_or_else(|| unknown(format!("task:{}", id)))?;
        let story = self.story_mut(&story_id)?;
        story
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| unknown(format!("task:{}", id)))
    }

    fn path_or(&self, id: &str, kind: &str) -> String {
        self.entity_path(id)
            .unwrap_or_else(|| format!("{}:{}", kind, id))
    }
}

impl Op {
    /// Short label used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Op::ImportFeature { .. } => "import_feature",
            Op::ActivateFeature { .. } => "activate_feature",
            Op::SetPosition { .. } => "set_position",
            Op::SetEpicStatus { .. } => "set_epic_status",
            Op::SetStoryStatus { .. } => "set_story_status",
            Op::RecordTaskRun { .. } => "record_task_run",
            Op::ReopenTask { .. } => "reopen_task",
            Op::ResetTaskAttempts { .. } => "reset_task_attempts",
            Op::AppendTasks { .. } => "append_tasks",
            Op::RecordReview { .. } => "record_review",
            Op::AcknowledgeReview { .. } => "acknowledge_review",
            Op::RecordReviewError { .. } => "record_review_error",
            Op::ResetReviewFailures { .. } => "reset_review_failures",
            Op::CompleteFeature { .. } => "complete_feature",
            Op::SetPolicy { .. } => "set_policy",
            Op::RequestCheckpoint { .. } => "request_checkpoint",
            Op::RecordDecision { .. } => "record_decision",
            Op::ResolveCheckpoint { .. } => "resolve_checkpoint",
            Op::ConsumeGrant => "consume_grant",
            Op::ClearCheckpoint => "clear_checkpoint",
            Op::SetLoopStatus { .. } => "set_loop_status",
            Op::RecordAbort { .. } => "record_abort",
            Op::ClearAbort => "clear_abort",
            Op::ExpectLive => "expect_live",
            Op::AddBlocker { .. } => "add_blocker",
            Op::ResolveBlocker { .. } => "resolve_blocker",
        }
    }

    /// Apply this op to `snap` in place. Cross-entity invariants are checked
    /// afterwards by the validator; this only rejects ops that cannot apply.
    pub fn apply_to(&self, snap: &mut Snapshot) -> Result<(), ValidationError> {
        match self {
            Op::ImportFeature { feature } => {
                if snap.feature(&feature.id).is_some() {
                    return Err(ValidationError::DuplicateId {
                        id: feature.id.clone(),
                        path: format!("feature:{}", feature.id),
                    });
                }
                let mut feature = feature.clone();
                feature.active = false;
                feature.status = FeatureStatus::Pending;
                feature.archived_at = None;
                snap.features.push(feature);
            }
            Op::ActivateFeature { feature_id } => {
                let target = snap.feature_mut(feature_id)?;
                if target.status == FeatureStatus::Completed {
                    return Err(ValidationError::ActiveFeatureCompleted {
                        path: format!("feature:{}", feature_id),
                    });
                }
                let already_active = target.active;
                target.active = true;
                if target.status == FeatureStatus::Pending {
                    target.status = FeatureStatus::InProgress;
                }
                for other in snap.features.iter_mut().filter(|f| f.id != *feature_id) {
                    other.active = false;
                }
                if !already_active {
                    snap.position = Position::default();
                }
            }
            Op::SetPosition { epic_id, story_id } => {
                snap.position = Position {
                    epic_id: epic_id.clone(),
                    story_id: story_id.clone(),
                };
            }
            Op::SetEpicStatus { epic_id, status } => {
                snap.epic_mut(epic_id)?.status = *status;
            }
            Op::SetStoryStatus { story_id, status } => {
                snap.story_mut(story_id)?.status = *status;
            }
            Op::RecordTaskRun {
                task_id,
                status,
                error,
            } => {
                let path = snap.path_or(task_id, "task");
                let task = snap.task_mut(task_id)?;
                if task.done {
                    return Err(ValidationError::TaskAlreadyDone {
                        path,
                        fact: format!("cannot record a {} run", status),
                    });
                }
                task.last_status = Some(*status);
                match status {
                    RunStatus::Success => {
                        task.done = true;
                        task.last_error = None;
                    }
                    RunStatus::Failure => {
                        task.attempts += 1;
                        task.last_error = error.clone();
                    }
                    RunStatus::Skipped => {
                        task.last_error = error.clone();
                    }
                }
            }
            Op::ReopenTask { task_id, reason } => {
                let path = snap.path_or(task_id, "task");
                if reason.trim().is_empty() {
                    return Err(invalid(path, "a course correction needs a reason"));
                }
                let story_id = {
                    let task = snap.task_mut(task_id)?;
                    if !task.done {
                        return Err(invalid(path, "task is not done"));
                    }
                    task.done = false;
                    task.attempts = 0;
                    task.last_status = None;
                    task.last_error = None;
                    task.story_id.clone()
                };
                let epic_id = {
                    let story = snap.story_mut(&story_id)?;
                    story.status = StoryStatus::InProgress;
                    story.review = None;
                    story.epic_id.clone()
                };
                let epic = snap.epic_mut(&epic_id)?;
                if epic.status == EpicStatus::Completed {
                    epic.status = EpicStatus::InProgress;
                }
            }
            Op::ResetTaskAttempts { task_id } => {
                snap.task_mut(task_id)?.attempts = 0;
            }
            Op::AppendTasks { story_id, tasks } => {
                let path = snap.path_or(story_id, "story");
                let story = snap.story_mut(story_id)?;
                if story.status == StoryStatus::Done {
                    return Err(invalid(path, "cannot append tasks to a done story"));
                }
                for task in tasks {
                    let mut task = task.clone();
                    task.story_id = story_id.clone();
                    story.tasks.push(task);
                }
            }
            Op::RecordReview {
                story_id,
                verdict,
                findings,
            } => {
                let path = snap.path_or(story_id, "story");
                let story = snap.story_mut(story_id)?;
                if story.status != StoryStatus::WaitingReview {
                    return Err(invalid(
                        path,
                        format!("review recorded while story is {}", story.status),
                    ));
                }
                story.review_round += 1;
                story.review_failures = 0;
                story.review = Some(ReviewRecord {
                    round: story.review_round,
                    verdict: *verdict,
                    findings: findings.clone(),
                    acknowledged: false,
                    at: Utc::now(),
                });
            }
            Op::AcknowledgeReview { story_id } => {
                let path = snap.path_or(story_id, "story");
                let story = snap.story_mut(story_id)?;
                let review = story
                    .review
                    .as_mut()
                    .ok_or_else(|| invalid(path, "no review to acknowledge"))?;
                review.acknowledged = true;
            }
            Op::RecordReviewError { story_id, .. } => {
                snap.story_mut(story_id)?.review_failures += 1;
            }
            Op::ResetReviewFailures { story_id } => {
                snap.story_mut(story_id)?.review_failures = 0;
            }
            Op::CompleteFeature { feature_id } => {
                let feature = snap.feature_mut(feature_id)?;
                feature.status = FeatureStatus::Completed;
                feature.active = false;
                feature.archived_at = Some(Utc::now());
                snap.position = Position::default();
            }
            Op::SetPolicy { policy } => {
                snap.policy = policy.clone();
            }
            Op::RequestCheckpoint { pending } => {
                snap.loop_record.pending = Some(pending.clone());
                snap.loop_record.grant = None;
                snap.loop_record.status = LoopStatus::AwaitingCheckpoint;
            }
            Op::RecordDecision { decision } => {
                let pending = snap
                    .loop_record
                    .pending
                    .as_mut()
                    .ok_or_else(|| invalid("loop", "no checkpoint is pending"))?;
                pending.decision = Some(*decision);
            }
            Op::ResolveCheckpoint { decision } => {
                let pending = snap
                    .loop_record
                    .pending
                    .take()
                    .ok_or_else(|| invalid("loop", "no checkpoint is pending"))?;
                match decision {
                    Decision::Proceed => {
                        snap.loop_record.grant = Some(CheckpointGrant {
                            checkpoint: pending.checkpoint,
                            action_key: pending.action_key,
                        });
                        snap.loop_record.status = LoopStatus::Idle;
                    }
                    Decision::Defer => {
                        snap.loop_record.pending = Some(PendingCheckpoint {
                            decision: None,
                            ..pending
                        });
                        snap.loop_record.status = LoopStatus::AwaitingCheckpoint;
                    }
                }
            }
            Op::ConsumeGrant => {
                snap.loop_record.grant = None;
            }
            Op::ClearCheckpoint => {
                snap.loop_record.pending = None;
                if snap.loop_record.status == LoopStatus::AwaitingCheckpoint {
                    snap.loop_record.status = LoopStatus::Idle;
                }
            }
            Op::SetLoopStatus { status } => {
                snap.loop_record.status = *status;
            }
            Op::RecordAbort { report } => {
                snap.loop_record.status = LoopStatus::Aborted;
                snap.loop_record.abort = Some(report.clone());
                snap.loop_record.pending = None;
                snap.loop_record.grant = None;
            }
            Op::ClearAbort => {
                if snap.loop_record.abort.take().is_none() {
                    return Err(invalid("loop", "loop is not aborted"));
                }
                snap.loop_record.status = LoopStatus::Idle;
            }
            Op::ExpectLive => {
                if let Some(report) = &snap.loop_record.abort {
                    return Err(ValidationError::LoopAborted {
                        reason: report.reason.to_string(),
                        path: report.entity_path.clone(),
                    });
                }
            }
            Op::AddBlocker { blocker } => {
                if snap.blockers.iter().any(|b| b.id == blocker.id) {
                    return Err(ValidationError::DuplicateId {
                        id: blocker.id.clone(),
                        path: format!("blocker:{}", blocker.id),
                    });
                }
                snap.blockers.push(blocker.clone());
            }
            Op::ResolveBlocker { blocker_id } => {
                let blocker = snap
                    .blockers
                    .iter_mut()
                    .find(|b| b.id == *blocker_id)
                    .ok_or_else(|| unknown(format!("blocker:{}", blocker_id)))?;
                if blocker.resolved_at.is_none() {
                    blocker.resolved_at = Some(Utc::now());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::model::{Epic, Story};

    fn snapshot() -> Snapshot {
        let mut story = Story::new("S1", "E1", "Story");
        story.tasks.push(Task::new("T1", "S1", "first", vec![]));
        let mut epic = Epic::new("E1", "F1", "Epic");
        epic.stories.push(story);
        let mut feature = Feature::new("F1", "Feature");
        feature.epics.push(epic);
        let mut snap = Snapshot::default();
        Op::ImportFeature { feature }.apply_to(&mut snap).unwrap();
        snap
    }

    #[test]
    fn test_activate_feature_is_exclusive() {
        let mut snap = snapshot();
        Op::ImportFeature {
            feature: Feature::new("F2", "Other"),
        }
        .apply_to(&mut snap)
        .unwrap();
        Op::ActivateFeature {
            feature_id: "F1".into(),
        }
        .apply_to(&mut snap)
        .unwrap();
        Op::ActivateFeature {
            feature_id: "F2".into(),
        }
        .apply_to(&mut snap)
        .unwrap();
        let active: Vec<_> = snap.features.iter().filter(|f| f.active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "F2");
    }

    #[test]
    fn test_record_task_run_counts_failures_only() {
        let mut snap = snapshot();
        for status in [RunStatus::Failure, RunStatus::Skipped, RunStatus::Failure] {
            Op::RecordTaskRun {
                task_id: "T1".into(),
                status,
                error: Some("boom".into()),
            }
            .apply_to(&mut snap)
            .unwrap();
        }
        let task = snap.find_task("T1").unwrap();
        assert_eq!(task.attempts, 2);
        assert!(!task.done);
        assert_eq!(task.last_status, Some(RunStatus::Failure));
    }

    #[test]
    fn test_record_run_on_done_task_is_rejected() {
        let mut snap = snapshot();
        let success = Op::RecordTaskRun {
            task_id: "T1".into(),
            status: RunStatus::Success,
            error: None,
        };
        success.apply_to(&mut snap).unwrap();
        let err = Op::RecordTaskRun {
            task_id: "T1".into(),
            status: RunStatus::Failure,
            error: None,
        }
        .apply_to(&mut snap)
        .unwrap_err();
        assert!(matches!(err, ValidationError::TaskAlreadyDone { .. }));
        assert!(err.to_string().contains("feature:F1/epic:E1/story:S1/task:T1"));
    }

    #[test]
    fn test_reopen_requires_reason_and_resets_story() {
        let mut snap = snapshot();
        Op::RecordTaskRun {
            task_id: "T1".into(),
            status: RunStatus::Success,
            error: None,
        }
        .apply_to(&mut snap)
        .unwrap();
        let err = Op::ReopenTask {
            task_id: "T1".into(),
            reason: " ".into(),
        }
        .apply_to(&mut snap)
        .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidOperation { .. }));

        Op::ReopenTask {
            task_id: "T1".into(),
            reason: "regression found".into(),
        }
        .apply_to(&mut snap)
        .unwrap();
        assert!(!snap.find_task("T1").unwrap().done);
        assert_eq!(snap.find_story("S1").unwrap().status, StoryStatus::InProgress);
    }

    #[test]
    fn test_record_review_requires_waiting_review() {
        let mut snap = snapshot();
        let review = Op::RecordReview {
            story_id: "S1".into(),
            verdict: ReviewVerdict::Pass,
            findings: vec![],
        };
        assert!(review.apply_to(&mut snap).is_err());
        Op::SetStoryStatus {
            story_id: "S1".into(),
            status: StoryStatus::WaitingReview,
        }
        .apply_to(&mut snap)
        .unwrap();
        review.apply_to(&mut snap).unwrap();
        let story = snap.find_story("S1").unwrap();
        assert_eq!(story.review_round, 1);
        assert!(!story.review.as_ref().unwrap().acknowledged);
    }

    #[test]
    fn test_archived_feature_is_read_only() {
        let mut snap = snapshot();
        Op::CompleteFeature {
            feature_id: "F1".into(),
        }
        .apply_to(&mut snap)
        .unwrap();
        let err = Op::SetStoryStatus {
            story_id: "S1".into(),
            status: StoryStatus::WaitingReview,
        }
        .apply_to(&mut snap)
        .unwrap_err();
        assert!(matches!(err, ValidationError::Archived { .. }));
    }

    #[test]
    fn test_checkpoint_proceed_becomes_grant() {
        let mut snap = snapshot();
        let pending = PendingCheckpoint {
            id: Uuid::new_v4(),
            checkpoint: crate::checkpoint::CheckpointId::BeforeTask,
            action_key: "dispatch:S1:T1".into(),
            entity_path: "feature:F1/epic:E1/story:S1".into(),
            summary: "dispatch 1 task".into(),
            requested_at: Utc::now(),
            decision: None,
        };
        Op::RequestCheckpoint { pending }.apply_to(&mut snap).unwrap();
        assert_eq!(snap.loop_record.status, LoopStatus::AwaitingCheckpoint);

        Op::ResolveCheckpoint {
            decision: Decision::Defer,
        }
        .apply_to(&mut snap)
        .unwrap();
        assert!(snap.loop_record.pending.is_some());
        assert!(snap.loop_record.grant.is_none());

        Op::ResolveCheckpoint {
            decision: Decision::Proceed,
        }
        .apply_to(&mut snap)
        .unwrap();
        assert!(snap.loop_record.pending.is_none());
        assert_eq!(
            snap.loop_record.grant.as_ref().map(|g| g.action_key.as_str()),
            Some("dispatch:S1:T1")
        );
        assert_eq!(snap.loop_record.status, LoopStatus::Idle);
    }

    #[test]
    fn test_expect_live_rejects_once_aborted() {
        let mut snap = snapshot();
        Op::ExpectLive.apply_to(&mut snap).unwrap();
        Op::RecordAbort {
            report: AbortReport::new(
                crate::abort::AbortReason::Cancelled,
                "feature:F1/epic:E1/story:S1",
                "operator requested cancellation",
            ),
        }
        .apply_to(&mut snap)
        .unwrap();
        let err = Op::ExpectLive.apply_to(&mut snap).unwrap_err();
        assert!(matches!(err, ValidationError::LoopAborted { .. }));
        assert!(err.to_string().contains("cancelled"));

        Op::ClearAbort.apply_to(&mut snap).unwrap();
        Op::ExpectLive.apply_to(&mut snap).unwrap();
    }

    #[test]
    fn test_op_serialization_is_tagged() {
        let op = Op::ResetTaskAttempts {
            task_id: "T1".into(),
        };
        let json = serde_json::to_string(&op).unwrap();
        assert_eq!(json, r#"{"op":"reset_task_attempts","task_id":"T1"}"#);
    }
}
