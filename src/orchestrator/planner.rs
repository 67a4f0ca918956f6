//! Next-action planning.
//!
//! [`plan_next`] is a pure function of the snapshot: it never performs work
//! and never writes. The loop asks it what to do, consults the checkpoint
//! that guards the answer, and then executes it.

use std::collections::HashSet;

use crate::abort::{AbortController, AbortReport};
use crate::checkpoint::CheckpointId;
use crate::review::ReviewVerdict;
use crate::state::{
    EpicStatus, Feature, Snapshot, StoryStatus, epic_path, feature_path, story_path,
};

#[derive(Debug, Clone, PartialEq)]
pub enum NextAction {
    /// Nothing left to do.
    Complete,
    Abort(AbortReport),
    EnterEpic {
        epic_id: String,
        /// An earlier sibling epic is already completed.
        boundary: bool,
    },
    EnterStory {
        story_id: String,
        /// An earlier sibling story is already done.
        boundary: bool,
    },
    DispatchBatch {
        story_id: String,
        task_ids: Vec<String>,
    },
    /// Every task is done; hand the story to review.
    AwaitReview {
        story_id: String,
    },
    Evaluate {
        story_id: String,
    },
    ActOnVerdict {
        story_id: String,
        round: u32,
        verdict: ReviewVerdict,
    },
    CloseStory {
        story_id: String,
    },
    CompleteEpic {
        epic_id: String,
    },
    CompleteFeature {
        feature_id: String,
    },
}

impl NextAction {
    /// The checkpoint immediately preceding this action, if any.
    pub fn checkpoint(&self) -> Option<CheckpointId> {
        match self {
            Self::EnterEpic { boundary: true, .. } => Some(CheckpointId::BeforeNextEpic),
            Self::EnterStory { boundary: true, .. } => Some(CheckpointId::BeforeNextStory),
            Self::DispatchBatch { .. } => Some(CheckpointId::BeforeTask),
            Self::ActOnVerdict { .. } => Some(CheckpointId::AfterVerification),
            Self::CloseStory { .. } => Some(CheckpointId::BeforeCommit),
            _ => None,
        }
    }

    /// Stable identity of the unit of work, used to bind a checkpoint grant
    /// to exactly the action it was granted for.
    pub fn action_key(&self) -> String {
        match self {
            Self::Complete => "complete".to_string(),
            Self::Abort(report) => format!("abort:{}", report.entity_path),
            Self::EnterEpic { epic_id, .. } => format!("enter_epic:{}", epic_id),
            Self::EnterStory { story_id, .. } => format!("enter_story:{}", story_id),
            Self::DispatchBatch { story_id, task_ids } => {
                format!("dispatch:{}:{}", story_id, task_ids.join(","))
            }
            Self::AwaitReview { story_id } => format!("await_review:{}", story_id),
            Self::Evaluate { story_id } => format!("evaluate:{}", story_id),
            Self::ActOnVerdict {
                story_id, round, ..
            } => format!("verdict:{}:r{}", story_id, round),
            Self::CloseStory { story_id } => format!("close:{}", story_id),
            Self::CompleteEpic { epic_id } => format!("complete_epic:{}", epic_id),
            Self::CompleteFeature { feature_id } => format!("complete_feature:{}", feature_id),
        }
    }

    /// One-line description shown at a checkpoint.
    pub fn summary(&self) -> String {
        match self {
            Self::Complete => "all work is complete".to_string(),
            Self::Abort(report) => report.to_string(),
            Self::EnterEpic { epic_id, .. } => format!("enter epic {}", epic_id),
            Self::EnterStory { story_id, .. } => format!("enter story {}", story_id),
            Self::DispatchBatch { story_id, task_ids } => format!(
                "dispatch {} task(s) of story {}: {}",
                task_ids.len(),
                story_id,
                task_ids.join(", ")
            ),
            Self::AwaitReview { story_id } => format!("send story {} to review", story_id),
            Self::Evaluate { story_id } => format!("review story {}", story_id),
            Self::ActOnVerdict {
                story_id,
                round,
                verdict,
            } => format!(
                "act on review round {} of story {} (verdict {})",
                round, story_id, verdict
            ),
            Self::CloseStory { story_id } => format!("close story {}", story_id),
            Self::CompleteEpic { epic_id } => format!("complete epic {}", epic_id),
            Self::CompleteFeature { feature_id } => format!("complete feature {}", feature_id),
        }
    }
}

/// Decide the next action for `snapshot`.
pub fn plan_next(snapshot: &Snapshot, aborts: &AbortController) -> NextAction {
    let Some(feature) = snapshot.active_feature() else {
        return NextAction::Complete;
    };
    if let Some(report) = aborts.check_unguarded(snapshot) {
        return NextAction::Abort(report);
    }
    let fp = feature_path(&feature.id);
    if feature.epics.is_empty() {
        return NextAction::Abort(aborts.missing_entity(&fp, "feature has no epics"));
    }

    let epic = match snapshot.position.epic_id.as_deref() {
        Some(epic_id) => match feature.epic(epic_id) {
            Some(epic) => epic,
            None => {
                return NextAction::Abort(aborts.missing_entity(
                    &epic_path(&feature.id, epic_id),
                    "position references an epic the active feature does not contain",
                ));
            }
        },
        None => return next_epic(feature),
    };

    let ep = epic_path(&feature.id, &epic.id);
    if epic.stories.is_empty() {
        return NextAction::Abort(aborts.missing_entity(&ep, "epic has no stories"));
    }

    let story = match snapshot.position.story_id.as_deref() {
        Some(story_id) => match epic.story(story_id) {
            Some(story) => story,
            None => {
                return NextAction::Abort(aborts.missing_entity(
                    &story_path(&feature.id, &epic.id, story_id),
                    "position references a story the current epic does not contain",
                ));
            }
        },
        None => {
            if epic.all_stories_done() {
                return NextAction::CompleteEpic {
                    epic_id: epic.id.clone(),
                };
            }
            let progressed: Vec<&str> = epic
                .stories
                .iter()
                .filter(|s| s.status != StoryStatus::Done && s.has_progress())
                .map(|s| s.id.as_str())
                .collect();
            if progressed.len() > 1 {
                return NextAction::Abort(aborts.ambiguity(
                    &ep,
                    format!(
                        "stories {} are all partially progressed and none is selected",
                        progressed.join(", ")
                    ),
                ));
            }
            let Some(index) = epic.stories.iter().position(|s| match progressed.first() {
                Some(id) => s.id == *id,
                None => s.status != StoryStatus::Done,
            }) else {
                return NextAction::CompleteEpic {
                    epic_id: epic.id.clone(),
                };
            };
            let boundary = epic.stories[..index]
                .iter()
                .any(|s| s.status == StoryStatus::Done);
            return NextAction::EnterStory {
                story_id: epic.stories[index].id.clone(),
                boundary,
            };
        }
    };

    let sp = story_path(&feature.id, &epic.id, &story.id);
    if story.tasks.is_empty() {
        return NextAction::Abort(aborts.missing_entity(&sp, "story has no tasks"));
    }
    let ids: HashSet<&str> = story.tasks.iter().map(|t| t.id.as_str()).collect();
    for task in &story.tasks {
        if let Some(dep) = task.depends_on.iter().find(|d| !ids.contains(d.as_str())) {
            return NextAction::Abort(aborts.missing_entity(
                &format!("{}/task:{}", sp, task.id),
                format!("depends on unknown task '{}'", dep),
            ));
        }
    }

    match story.status {
        StoryStatus::Done => NextAction::Abort(aborts.ambiguity(
            &sp,
            "position selects a story that is already done",
        )),
        StoryStatus::InProgress => {
            let task_ids: Vec<String> = story.incomplete_tasks().map(|t| t.id.clone()).collect();
            if task_ids.is_empty() {
                NextAction::AwaitReview {
                    story_id: story.id.clone(),
                }
            } else {
                NextAction::DispatchBatch {
                    story_id: story.id.clone(),
                    task_ids,
                }
            }
        }
        StoryStatus::WaitingReview => match &story.review {
            // An acknowledged failure belongs to an earlier round.
            None => NextAction::Evaluate {
                story_id: story.id.clone(),
            },
            Some(review) if review.acknowledged && review.verdict.is_fail() => {
                NextAction::Evaluate {
                    story_id: story.id.clone(),
                }
            }
            Some(review) if !review.acknowledged => NextAction::ActOnVerdict {
                story_id: story.id.clone(),
                round: review.round,
                verdict: review.verdict,
            },
            Some(_) => NextAction::CloseStory {
                story_id: story.id.clone(),
            },
        },
    }
}

/// Entity path of the current position, used when an abort has no more
/// specific subject.
pub(crate) fn position_path(snapshot: &Snapshot) -> String {
    let Some(feature) = snapshot.active_feature() else {
        return "loop".to_string();
    };
    match (
        snapshot.position.epic_id.as_deref(),
        snapshot.position.story_id.as_deref(),
    ) {
        (Some(epic_id), Some(story_id)) => story_path(&feature.id, epic_id, story_id),
        (Some(epic_id), None) => epic_path(&feature.id, epic_id),
        _ => feature_path(&feature.id),
    }
}

fn next_epic(feature: &Feature) -> NextAction {
    match feature
        .epics
        .iter()
        .position(|e| e.status != EpicStatus::Completed)
    {
        Some(index) => NextAction::EnterEpic {
            epic_id: feature.epics[index].id.clone(),
            boundary: feature.epics[..index]
                .iter()
                .any(|e| e.status == EpicStatus::Completed),
        },
        None => NextAction::CompleteFeature {
            feature_id: feature.id.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abort::AbortReason;
    use crate::checkpoint::{CheckpointPolicy, PolicyPreset};
    use crate::state::{
        Blocker, BlockerSeverity, Epic, FeatureStatus, Position, ReviewRecord, Story, Task,
    };
    use chrono::Utc;

    fn snapshot() -> Snapshot {
        let mut feature = Feature::new("F1", "Accounts");
        feature.active = true;
        feature.status = FeatureStatus::InProgress;
        for (epic_id, stories) in [("E1", ["S1", "S2"]), ("E2", ["S3", "S4"])] {
            let mut epic = Epic::new(epic_id, "F1", epic_id);
            for story_id in stories {
                let mut story = Story::new(story_id, epic_id, story_id);
                story
                    .tasks
                    .push(Task::new(&format!("{}-T1", story_id), story_id, "a", vec![]));
                story.tasks.push(Task::new(
                    &format!("{}-T2", story_id),
                    story_id,
                    "b",
                    vec![format!("{}-T1", story_id)],
                ));
                epic.stories.push(story);
            }
            feature.epics.push(epic);
        }
        Snapshot {
            features: vec![feature],
            ..Default::default()
        }
    }

    fn at(snap: &mut Snapshot, epic: &str, story: Option<&str>) {
        snap.position = Position {
            epic_id: Some(epic.into()),
            story_id: story.map(String::from),
        };
    }

    fn plan(snap: &Snapshot) -> NextAction {
        plan_next(snap, &AbortController::new())
    }

    #[test]
    fn test_no_active_feature_is_complete() {
        assert_eq!(plan(&Snapshot::default()), NextAction::Complete);
    }

    #[test]
    fn test_first_epic_has_no_boundary() {
        assert_eq!(
            plan(&snapshot()),
            NextAction::EnterEpic {
                epic_id: "E1".into(),
                boundary: false
            }
        );
    }

    #[test]
    fn test_second_epic_is_a_boundary() {
        let mut snap = snapshot();
        snap.features[0].epics[0].status = EpicStatus::Completed;
        let action = plan(&snap);
        assert_eq!(
            action,
            NextAction::EnterEpic {
                epic_id: "E2".into(),
                boundary: true
            }
        );
        assert_eq!(action.checkpoint(), Some(CheckpointId::BeforeNextEpic));
    }

    #[test]
    fn test_story_selection_and_boundary() {
        let mut snap = snapshot();
        at(&mut snap, "E1", None);
        assert_eq!(
            plan(&snap),
            NextAction::EnterStory {
                story_id: "S1".into(),
                boundary: false
            }
        );
        snap.features[0].epics[0].stories[0].status = StoryStatus::Done;
        let action = plan(&snap);
        assert_eq!(
            action,
            NextAction::EnterStory {
                story_id: "S2".into(),
                boundary: true
            }
        );
        assert_eq!(action.checkpoint(), Some(CheckpointId::BeforeNextStory));
    }

    #[test]
    fn test_resumes_the_single_progressed_story() {
        let mut snap = snapshot();
        at(&mut snap, "E1", None);
        snap.features[0].epics[0].stories[1].tasks[0].done = true;
        assert_eq!(
            plan(&snap),
            NextAction::EnterStory {
                story_id: "S2".into(),
                boundary: false
            }
        );
    }

    #[test]
    fn test_two_progressed_stories_are_ambiguous() {
        let mut snap = snapshot();
        at(&mut snap, "E1", None);
        snap.features[0].epics[0].stories[0].tasks[0].done = true;
        snap.features[0].epics[0].stories[1].tasks[0].done = true;
        let NextAction::Abort(report) = plan(&snap) else {
            panic!("expected abort");
        };
        assert_eq!(report.reason, AbortReason::Ambiguity);
        assert_eq!(report.entity_path, "feature:F1/epic:E1");
        assert!(report.fact.contains("S1, S2"));
    }

    #[test]
    fn test_dispatch_lists_every_incomplete_task() {
        let mut snap = snapshot();
        at(&mut snap, "E1", Some("S1"));
        snap.features[0].epics[0].stories[0].tasks[0].done = true;
        let action = plan(&snap);
        assert_eq!(
            action,
            NextAction::DispatchBatch {
                story_id: "S1".into(),
                task_ids: vec!["S1-T2".into()]
            }
        );
        assert_eq!(action.action_key(), "dispatch:S1:S1-T2");
    }

    #[test]
    fn test_review_stages() {
        let mut snap = snapshot();
        at(&mut snap, "E1", Some("S1"));
        let story = &mut snap.features[0].epics[0].stories[0];
        for task in &mut story.tasks {
            task.done = true;
        }
        assert!(matches!(plan(&snap), NextAction::AwaitReview { .. }));

        snap.features[0].epics[0].stories[0].status = StoryStatus::WaitingReview;
        assert!(matches!(plan(&snap), NextAction::Evaluate { .. }));

        snap.features[0].epics[0].stories[0].review = Some(ReviewRecord {
            round: 1,
            verdict: ReviewVerdict::Fail,
            findings: vec![],
            acknowledged: false,
            at: Utc::now(),
        });
        let action = plan(&snap);
        assert_eq!(action.checkpoint(), Some(CheckpointId::AfterVerification));
        assert_eq!(action.action_key(), "verdict:S1:r1");

        // An acknowledged failure from an earlier round needs a fresh evaluation.
        if let Some(review) = snap.features[0].epics[0].stories[0].review.as_mut() {
            review.acknowledged = true;
        }
        assert!(matches!(plan(&snap), NextAction::Evaluate { .. }));

        if let Some(review) = snap.features[0].epics[0].stories[0].review.as_mut() {
            review.verdict = ReviewVerdict::Pass;
        }
        let action = plan(&snap);
        assert_eq!(
            action,
            NextAction::CloseStory {
                story_id: "S1".into()
            }
        );
        assert_eq!(action.checkpoint(), Some(CheckpointId::BeforeCommit));
    }

    #[test]
    fn test_empty_entities_abort_with_path() {
        let mut snap = snapshot();
        snap.features[0].epics[1].stories.clear();
        at(&mut snap, "E2", None);
        let NextAction::Abort(report) = plan(&snap) else {
            panic!("expected abort");
        };
        assert_eq!(report.reason, AbortReason::MissingEntity);
        assert_eq!(report.entity_path, "feature:F1/epic:E2");

        let mut snap = snapshot();
        snap.features[0].epics[0].stories[0].tasks.clear();
        at(&mut snap, "E1", Some("S1"));
        let NextAction::Abort(report) = plan(&snap) else {
            panic!("expected abort");
        };
        assert_eq!(report.entity_path, "feature:F1/epic:E1/story:S1");
        assert_eq!(report.fact, "story has no tasks");
    }

    #[test]
    fn test_unguarded_blocker_aborts_before_any_work() {
        let mut snap = snapshot();
        snap.policy = CheckpointPolicy::custom(&[], Default::default());
        snap.blockers.push(Blocker {
            id: "B1".into(),
            description: "which database?".into(),
            severity: BlockerSeverity::High,
            entity: None,
            timestamp: Utc::now(),
            resolved_at: None,
        });
        let NextAction::Abort(report) = plan(&snap) else {
            panic!("expected abort");
        };
        assert_eq!(report.reason, AbortReason::UnguardedAmbiguity);

        snap.policy = CheckpointPolicy::from_preset(PolicyPreset::StoryAutonomous);
        assert!(matches!(plan(&snap), NextAction::EnterEpic { .. }));
    }

    #[test]
    fn test_all_epics_completed_completes_feature() {
        let mut snap = snapshot();
        for epic in &mut snap.features[0].epics {
            epic.status = EpicStatus::Completed;
        }
        assert_eq!(
            plan(&snap),
            NextAction::CompleteFeature {
                feature_id: "F1".into()
            }
        );
    }
}
