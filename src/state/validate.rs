//! Invariant checks run on every candidate snapshot before it is written.

use std::collections::HashSet;

use super::model::{EpicStatus, FeatureStatus, LoopStatus, Snapshot, StoryStatus};
use super::transition::Op;
use crate::errors::ValidationError;

/// Validate `next` as the successor of `prev` produced by `ops`.
///
/// Checks run in a fixed order and the first violation wins, so the error a
/// caller sees for a given bad transition is stable.
pub fn validate(prev: &Snapshot, next: &Snapshot, ops: &[Op]) -> Result<(), ValidationError> {
    check_active_feature(next)?;
    check_unique_ids(next)?;
    check_tree(next)?;
    check_monotonic(prev, next, ops)?;
    check_archived(prev, next)?;
    check_position(next)?;
    check_policy(next)?;
    check_loop_record(next)?;
    Ok(())
}

/// Checks that apply to a snapshot on its own, e.g. one read from disk.
pub fn validate_snapshot(snap: &Snapshot) -> Result<(), ValidationError> {
    check_active_feature(snap)?;
    check_unique_ids(snap)?;
    check_tree(snap)?;
    check_position(snap)?;
    check_policy(snap)?;
    check_loop_record(snap)
}

fn check_active_feature(snap: &Snapshot) -> Result<(), ValidationError> {
    let active: Vec<String> = snap
        .features
        .iter()
        .filter(|f| f.active)
        .map(|f| f.id.clone())
        .collect();
    if active.len() > 1 {
        return Err(ValidationError::MultipleActiveFeatures { ids: active });
    }
    if let Some(feature) = snap.active_feature()
        && feature.status == FeatureStatus::Completed
    {
        return Err(ValidationError::ActiveFeatureCompleted {
            path: format!("feature:{}", feature.id),
        });
    }
    let pending = snap
        .features
        .iter()
        .filter(|f| f.status != FeatureStatus::Completed)
        .count();
    if active.is_empty() && pending > 0 {
        return Err(ValidationError::NoActiveFeature { pending });
    }
    Ok(())
}

fn check_unique_ids(snap: &Snapshot) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();
    let mut claim = |id: &str, path: String| {
        if seen.insert(id.to_string()) {
            Ok(())
        } else {
            Err(ValidationError::DuplicateId {
                id: id.to_string(),
                path,
            })
        }
    };
    for feature in &snap.features {
        let fp = format!("feature:{}", feature.id);
        claim(&feature.id, fp.clone())?;
        for epic in &feature.epics {
            let ep = format!("{}/epic:{}", fp, epic.id);
            claim(&epic.id, ep.clone())?;
            for story in &epic.stories {
                let sp = format!("{}/story:{}", ep, story.id);
                claim(&story.id, sp.clone())?;
                for task in &story.tasks {
                    claim(&task.id, format!("{}/task:{}", sp, task.id))?;
                }
            }
        }
    }
    Ok(())
}

/// Parent links, dependency references and status roll-ups.
fn check_tree(snap: &Snapshot) -> Result<(), ValidationError> {
    for feature in &snap.features {
        let fp = format!("feature:{}", feature.id);
        if feature.status == FeatureStatus::Completed && !feature.all_epics_completed() {
            return Err(ValidationError::InconsistentStatus {
                path: fp,
                status: "completed".into(),
                fact: "not every epic is completed".into(),
            });
        }
        for epic in &feature.epics {
            let ep = format!("{}/epic:{}", fp, epic.id);
            if epic.feature_id != feature.id {
                return Err(ValidationError::InvalidOperation {
                    path: ep,
                    fact: format!("parent is '{}' but it is listed under this feature", epic.feature_id),
                });
            }
            if epic.status == EpicStatus::Completed && !epic.all_stories_done() {
                return Err(ValidationError::InconsistentStatus {
                    path: ep,
                    status: "completed".into(),
                    fact: "not every story is done".into(),
                });
            }
            for story in &epic.stories {
                let sp = format!("{}/story:{}", ep, story.id);
                if story.epic_id != epic.id {
                    return Err(ValidationError::InvalidOperation {
                        path: sp,
                        fact: format!("parent is '{}' but it is listed under this epic", story.epic_id),
                    });
                }
                if story.status == StoryStatus::Done {
                    if !story.all_tasks_done() {
                        return Err(ValidationError::StoryDoneWithoutPass {
                            path: sp,
                            fact: "it still has incomplete tasks".into(),
                        });
                    }
                    if !story.passed_review() {
                        return Err(ValidationError::StoryDoneWithoutPass {
                            path: sp,
                            fact: "its latest review is not an acknowledged PASS".into(),
                        });
                    }
                }
                for task in &story.tasks {
                    let tp = format!("{}/task:{}", sp, task.id);
                    if task.story_id != story.id {
                        return Err(ValidationError::InvalidOperation {
                            path: tp,
                            fact: format!("parent is '{}' but it is listed under this story", task.story_id),
                        });
                    }
                    for dep in &task.depends_on {
                        if dep == &task.id || story.task(dep).is_none() {
                            return Err(ValidationError::UnknownDependency {
                                path: tp,
                                dependency: dep.clone(),
                            });
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

/// A completed task stays completed unless the same transition reopens it.
fn check_monotonic(prev: &Snapshot, next: &Snapshot, ops: &[Op]) -> Result<(), ValidationError> {
    let reopened: HashSet<&str> = ops
        .iter()
        .filter_map(|op| match op {
            Op::ReopenTask { task_id, .. } => Some(task_id.as_str()),
            _ => None,
        })
        .collect();

    for feature in &prev.features {
        for epic in &feature.epics {
            for story in &epic.stories {
                for task in story.tasks.iter().filter(|t| t.done) {
                    let still_done = next.find_task(&task.id).is_some_and(|t| t.done);
                    if !still_done && !reopened.contains(task.id.as_str()) {
                        return Err(ValidationError::TaskReverted {
                            path: prev
                                .entity_path(&task.id)
                                .unwrap_or_else(|| format!("task:{}", task.id)),
                        });
                    }
                }
            }
        }
    }
    Ok(())
}

fn check_archived(prev: &Snapshot, next: &Snapshot) -> Result<(), ValidationError> {
    for archived in prev.features.iter().filter(|f| f.is_archived()) {
        if next.feature(&archived.id) != Some(archived) {
            return Err(ValidationError::Archived {
                path: format!("feature:{}", archived.id),
            });
        }
    }
    Ok(())
}

fn check_position(snap: &Snapshot) -> Result<(), ValidationError> {
    let position = &snap.position;
    let Some(epic_id) = position.epic_id.as_deref() else {
        if let Some(story_id) = &position.story_id {
            return Err(ValidationError::InvalidPosition {
                path: format!("story:{}", story_id),
                fact: "a story is selected without an epic".into(),
            });
        }
        return Ok(());
    };
    let feature = snap.active_feature().ok_or_else(|| ValidationError::InvalidPosition {
        path: format!("epic:{}", epic_id),
        fact: "there is no active feature".into(),
    })?;
    let fp = format!("feature:{}", feature.id);
    let epic = feature.epic(epic_id).ok_or_else(|| ValidationError::InvalidPosition {
        path: format!("{}/epic:{}", fp, epic_id),
        fact: "epic does not belong to the active feature".into(),
    })?;
    if epic.status == EpicStatus::Completed {
        return Err(ValidationError::InvalidPosition {
            path: format!("{}/epic:{}", fp, epic_id),
            fact: "epic is already completed".into(),
        });
    }
    if let Some(story_id) = position.story_id.as_deref() {
        let sp = format!("{}/epic:{}/story:{}", fp, epic_id, story_id);
        let story = epic.story(story_id).ok_or_else(|| ValidationError::InvalidPosition {
            path: sp.clone(),
            fact: "story does not belong to the current epic".into(),
        })?;
        if story.status == StoryStatus::Done {
            return Err(ValidationError::InvalidPosition {
                path: sp,
                fact: "story is already done".into(),
            });
        }
    }
    Ok(())
}

fn check_policy(snap: &Snapshot) -> Result<(), ValidationError> {
    snap.policy
        .check_consistency()
        .map_err(|fact| ValidationError::PolicyInconsistent { fact })
}

fn check_loop_record(snap: &Snapshot) -> Result<(), ValidationError> {
    let record = &snap.loop_record;
    let fact = match record.status {
        LoopStatus::AwaitingCheckpoint if record.pending.is_none() => {
            "awaiting a checkpoint with nothing pending"
        }
        LoopStatus::Aborted if record.abort.is_none() => "aborted without an abort report",
        LoopStatus::Idle | LoopStatus::Complete if record.pending.is_some() => {
            "a checkpoint is pending but the loop is not awaiting it"
        }
        _ if record.status != LoopStatus::Aborted && record.abort.is_some() => {
            "an abort report is present but the loop is not aborted"
        }
        _ => return Ok(()),
    };
    Err(ValidationError::LoopRecordInconsistent { fact: fact.into() })
}
