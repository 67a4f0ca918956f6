use serde::{Deserialize, Serialize};

use crate::abort::AbortReport;
use crate::checkpoint::CheckpointId;
use crate::dag::UnitStatus;
use crate::review::ReviewVerdict;
use crate::state::Decision;

/// Events emitted while the loop runs. Consumers render them; the loop never
/// waits on a consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEvent {
    /// A transition was applied.
    StateChanged {
        revision: u64,
        action: String,
    },
    /// The loop persisted a pending checkpoint and is waiting for a decision.
    CheckpointReached {
        checkpoint: CheckpointId,
        entity_path: String,
        summary: String,
    },
    CheckpointResolved {
        checkpoint: CheckpointId,
        decision: Decision,
    },
    BatchDispatched {
        story_id: String,
        tasks: Vec<String>,
    },
    TaskStarted {
        task_id: String,
        attempt: u32,
    },
    TaskFinished {
        task_id: String,
        status: UnitStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ReviewCompleted {
        story_id: String,
        round: u32,
        verdict: ReviewVerdict,
        findings: usize,
    },
    StoryCompleted {
        story_id: String,
    },
    EpicCompleted {
        epic_id: String,
    },
    FeatureCompleted {
        feature_id: String,
    },
    Aborted {
        report: AbortReport,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_are_tagged() {
        let event = LoopEvent::CheckpointReached {
            checkpoint: CheckpointId::BeforeTask,
            entity_path: "feature:F1/epic:E1/story:S1".into(),
            summary: "dispatch T1, T2".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "checkpoint_reached");
        assert_eq!(json["checkpoint"], "before_task");

        let finished = LoopEvent::TaskFinished {
            task_id: "T1".into(),
            status: UnitStatus::Success,
            error: None,
        };
        let json = serde_json::to_value(&finished).unwrap();
        assert!(json.get("error").is_none());
    }
}
