//! Operator controls that act on the persisted state directly.
//!
//! None of these take the writer lease: they are single transitions, and a
//! running loop observes their effect on its next read.

use chrono::Utc;
use tracing::info;

use super::planner::position_path;
use crate::abort::AbortController;
use crate::checkpoint::CheckpointPolicy;
use crate::errors::{OrchestratorError, StoreError, ValidationError};
use crate::state::{Blocker, BlockerSeverity, Decision, Op, Snapshot, StateStore, Transition};

/// Clear the abort report, reset retry counters of whatever exhausted its
/// budget, and return the loop to idle.
pub fn resume(store: &StateStore) -> Result<Snapshot, OrchestratorError> {
    let snapshot = store.get_state()?;
    let Some(report) = &snapshot.loop_record.abort else {
        return Err(OrchestratorError::Store(
            ValidationError::InvalidOperation {
                path: "loop".into(),
                fact: "loop is not aborted".into(),
            }
            .into(),
        ));
    };

    let mut transition = Transition::new(format!("resume after {}", report.reason));
    transition.push(Op::ClearAbort);
    for task_id in &report.exhausted_tasks {
        if snapshot.find_task(task_id).is_some_and(|t| !t.done) {
            transition.push(Op::ResetTaskAttempts {
                task_id: task_id.clone(),
            });
        }
    }
    if let Some(feature) = snapshot.active_feature() {
        for story in feature.epics.iter().flat_map(|e| e.stories.iter()) {
            if story.review_failures > 0 {
                transition.push(Op::ResetReviewFailures {
                    story_id: story.id.clone(),
                });
            }
        }
    }

    let next = store.apply(&transition)?;
    info!(
        reason = %report.reason,
        entity = %report.entity_path,
        reset = report.exhausted_tasks.len(),
        "loop resumed"
    );
    Ok(next)
}

/// Abort the loop with reason `cancelled`. A no-op when already aborted.
pub fn cancel(store: &StateStore) -> Result<Snapshot, OrchestratorError> {
    let snapshot = store.get_state()?;
    if snapshot.loop_record.abort.is_some() {
        return Ok(snapshot);
    }
    let report = AbortController::new().cancelled(&position_path(&snapshot));
    let transition = Transition::new("cancel")
        .op(Op::ExpectLive)
        .op(Op::RecordAbort { report });
    match store.apply(&transition) {
        // Another writer aborted between our read and the apply.
        Err(StoreError::Validation(ValidationError::LoopAborted { .. })) => Ok(store.get_state()?),
        result => Ok(result?),
    }
}

/// Record an operator decision on the pending checkpoint. The loop acts on
/// it at its next run (or immediately, if it is polling).
pub fn confirm(store: &StateStore, decision: Decision) -> Result<Snapshot, OrchestratorError> {
    let snapshot = store.get_state()?;
    let Some(pending) = &snapshot.loop_record.pending else {
        return Err(OrchestratorError::Store(
            ValidationError::InvalidOperation {
                path: "loop".into(),
                fact: "no checkpoint is pending".into(),
            }
            .into(),
        ));
    };
    let action = format!(
        "confirm {} at {}: {}",
        pending.checkpoint, pending.entity_path, decision
    );
    Ok(store.apply(&Transition::new(action).op(Op::RecordDecision { decision }))?)
}

pub fn set_policy(
    store: &StateStore,
    policy: CheckpointPolicy,
) -> Result<Snapshot, OrchestratorError> {
    let action = format!("set policy {}", policy.preset);
    Ok(store.apply(&Transition::new(action).op(Op::SetPolicy { policy }))?)
}

/// Course correction: reopen a completed task.
pub fn reopen(
    store: &StateStore,
    task_id: &str,
    reason: &str,
) -> Result<Snapshot, OrchestratorError> {
    let transition = Transition::new(format!("reopen {}: {}", task_id, reason)).op(
        Op::ReopenTask {
            task_id: task_id.to_string(),
            reason: reason.to_string(),
        },
    );
    Ok(store.apply(&transition)?)
}

pub fn add_blocker(
    store: &StateStore,
    id: &str,
    description: &str,
    severity: BlockerSeverity,
    entity: Option<String>,
) -> Result<Snapshot, OrchestratorError> {
    let blocker = Blocker {
        id: id.to_string(),
        description: description.to_string(),
        severity,
        entity,
        timestamp: Utc::now(),
        resolved_at: None,
    };
    Ok(store.apply(&Transition::new(format!("add blocker {}", id)).op(Op::AddBlocker { blocker }))?)
}

pub fn resolve_blocker(store: &StateStore, id: &str) -> Result<Snapshot, OrchestratorError> {
    Ok(store.apply(
        &Transition::new(format!("resolve blocker {}", id)).op(Op::ResolveBlocker {
            blocker_id: id.to_string(),
        }),
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abort::{AbortReason, AbortReport};
    use crate::state::{LoopStatus, PlanFile};
    use tempfile::TempDir;

    const PLAN: &str = r#"{"features": [{"id": "F1", "description": "d", "epics": [
        {"id": "E1", "title": "e", "stories": [
            {"id": "S1", "title": "s", "tasks": [{"id": "T1", "description": "t"}]}]}]}]}"#;

    fn store() -> (TempDir, StateStore) {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path().join("state.json")).unwrap();
        let plan = PlanFile::parse(PLAN).unwrap();
        store
            .apply(&plan.import_transition(&Snapshot::default(), "h"))
            .unwrap();
        (dir, store)
    }

    #[test]
    fn test_resume_requires_abort() {
        let (_dir, store) = store();
        let err = resume(&store).unwrap_err();
        assert!(err.to_string().contains("not aborted"));
    }

    #[test]
    fn test_resume_resets_exhausted_attempts() {
        let (_dir, store) = store();
        for _ in 0..3 {
            store
                .apply(&Transition::new("run").op(Op::RecordTaskRun {
                    task_id: "T1".into(),
                    status: crate::state::RunStatus::Failure,
                    error: Some("boom".into()),
                }))
                .unwrap();
        }
        let report = AbortReport::new(
            AbortReason::RetryExhausted,
            "feature:F1/epic:E1/story:S1/task:T1",
            "failed 3 times",
        )
        .with_exhausted_tasks(vec!["T1".into()]);
        store
            .apply(&Transition::new("abort").op(Op::RecordAbort { report }))
            .unwrap();

        let snap = resume(&store).unwrap();
        assert_eq!(snap.loop_record.status, LoopStatus::Idle);
        assert!(snap.loop_record.abort.is_none());
        assert_eq!(snap.find_task("T1").map(|t| t.attempts), Some(0));
        let last = snap.history.last().unwrap();
        assert!(
            last.delta
                .iter()
                .any(|op| matches!(op, Op::ResetTaskAttempts { task_id } if task_id == "T1"))
        );
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let (_dir, store) = store();
        let first = cancel(&store).unwrap();
        assert_eq!(first.loop_record.status, LoopStatus::Aborted);
        let second = cancel(&store).unwrap();
        assert_eq!(first.revision, second.revision);
    }

    #[test]
    fn test_confirm_without_pending_is_rejected() {
        let (_dir, store) = store();
        assert!(confirm(&store, Decision::Proceed).is_err());
    }

    #[test]
    fn test_blockers_round_trip_through_store() {
        let (_dir, store) = store();
        add_blocker(&store, "B1", "which db?", BlockerSeverity::High, None).unwrap();
        assert!(add_blocker(&store, "B1", "dup", BlockerSeverity::Low, None).is_err());
        let snap = resolve_blocker(&store, "B1").unwrap();
        assert_eq!(snap.open_blockers().count(), 0);
    }
}
