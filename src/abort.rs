//! Escalation path for situations the loop must not guess its way through.
//!
//! The controller itself is stateless: it turns a detected condition into an
//! [`AbortReport`] naming the exact entity path and the missing or ambiguous
//! fact. Persisting the report (and moving the loop to `aborted`) is the
//! loop's job, folded into the same commit as the rest of the iteration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::error;

use crate::state::Snapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// A required entity is missing or empty.
    MissingEntity,
    /// More than one equally valid next action and no tie-break rule.
    Ambiguity,
    /// A change falls outside the declared scope of the unit of work.
    ScopeExceeded,
    /// The bounded retry count was used up.
    RetryExhausted,
    /// Every checkpoint is suppressed while unresolved blockers exist.
    UnguardedAmbiguity,
    /// The loop's own transitions kept failing validation.
    RejectedTransition,
    /// An operator cancelled the run.
    Cancelled,
}

impl AbortReason {
    pub fn label(&self) -> &'static str {
        match self {
            Self::MissingEntity => "missing entity",
            Self::Ambiguity => "ambiguity",
            Self::ScopeExceeded => "scope exceeded",
            Self::RetryExhausted => "retry exhausted",
            Self::UnguardedAmbiguity => "unguarded ambiguity",
            Self::RejectedTransition => "rejected transition",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Structured abort report persisted with the loop record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortReport {
    pub reason: AbortReason,
    /// e.g. `feature:F1/epic:E2/story:S3/task:T4`
    pub entity_path: String,
    /// The specific missing or ambiguous fact.
    pub fact: String,
    pub at: DateTime<Utc>,
    /// Task ids whose retry budget was exhausted; reset on resume.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exhausted_tasks: Vec<String>,
}

impl AbortReport {
    pub fn new(reason: AbortReason, entity_path: impl Into<String>, fact: impl Into<String>) -> Self {
        Self {
            reason,
            entity_path: entity_path.into(),
            fact: fact.into(),
            at: Utc::now(),
            exhausted_tasks: Vec::new(),
        }
    }

    pub fn with_exhausted_tasks(mut self, tasks: Vec<String>) -> Self {
        self.exhausted_tasks = tasks;
        self
    }
}

impl fmt::Display for AbortReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}: {}", self.reason, self.entity_path, self.fact)
    }
}

/// Builds abort reports and applies the abort-trigger rules that depend only
/// on a snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct AbortController;

impl AbortController {
    pub fn new() -> Self {
        Self
    }

    pub fn missing_entity(&self, path: &str, fact: impl Into<String>) -> AbortReport {
        self.raise(AbortReport::new(AbortReason::MissingEntity, path, fact))
    }

    pub fn ambiguity(&self, path: &str, fact: impl Into<String>) -> AbortReport {
        self.raise(AbortReport::new(AbortReason::Ambiguity, path, fact))
    }

    pub fn scope_exceeded(&self, path: &str, fact: impl Into<String>) -> AbortReport {
        self.raise(AbortReport::new(AbortReason::ScopeExceeded, path, fact))
    }

    pub fn retry_exhausted(
        &self,
        path: &str,
        fact: impl Into<String>,
        tasks: Vec<String>,
    ) -> AbortReport {
        self.raise(
            AbortReport::new(AbortReason::RetryExhausted, path, fact).with_exhausted_tasks(tasks),
        )
    }

    pub fn rejected_transition(&self, path: &str, fact: impl Into<String>) -> AbortReport {
        self.raise(AbortReport::new(AbortReason::RejectedTransition, path, fact))
    }

    pub fn cancelled(&self, path: &str) -> AbortReport {
        self.raise(AbortReport::new(
            AbortReason::Cancelled,
            path,
            "run cancelled by operator",
        ))
    }

    /// Abort when no checkpoint can stop the loop but open blockers exist.
    pub fn check_unguarded(&self, snapshot: &Snapshot) -> Option<AbortReport> {
        if !snapshot.policy.suppresses_all() {
            return None;
        }
        let blocker = snapshot.open_blockers().next()?;
        let path = blocker
            .entity
            .clone()
            .unwrap_or_else(|| format!("blocker:{}", blocker.id));
        Some(self.raise(AbortReport::new(
            AbortReason::UnguardedAmbiguity,
            path,
            format!(
                "policy '{}' suppresses every checkpoint while blocker '{}' ({}) is unresolved",
                snapshot.policy.preset, blocker.id, blocker.description
            ),
        )))
    }

    fn raise(&self, report: AbortReport) -> AbortReport {
        error!(
            reason = %report.reason,
            entity = %report.entity_path,
            fact = %report.fact,
            "orchestration aborted"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointPolicy, Granularity, PolicyPreset};
    use crate::state::{Blocker, BlockerSeverity};

    fn blocker(id: &str) -> Blocker {
        Blocker {
            id: id.to_string(),
            description: "which database?".to_string(),
            severity: BlockerSeverity::High,
            entity: Some("feature:F1/epic:E1".to_string()),
            timestamp: Utc::now(),
            resolved_at: None,
        }
    }

    #[test]
    fn test_report_display_names_path_and_fact() {
        let report = AbortReport::new(
            AbortReason::MissingEntity,
            "feature:F1/epic:E1",
            "epic has no stories",
        );
        assert_eq!(
            report.to_string(),
            "missing entity at feature:F1/epic:E1: epic has no stories"
        );
    }

    #[test]
    fn test_unguarded_requires_suppressed_policy() {
        let controller = AbortController::new();
        let mut snap = Snapshot {
            blockers: vec![blocker("B1")],
            ..Default::default()
        };
        snap.policy = CheckpointPolicy::from_preset(PolicyPreset::Manual);
        assert!(controller.check_unguarded(&snap).is_none());

        snap.policy = CheckpointPolicy::custom(&[], Granularity::Step);
        let report = controller.check_unguarded(&snap).unwrap();
        assert_eq!(report.reason, AbortReason::UnguardedAmbiguity);
        assert_eq!(report.entity_path, "feature:F1/epic:E1");
        assert!(report.fact.contains("B1"));
    }

    #[test]
    fn test_unguarded_ignores_resolved_blockers() {
        let controller = AbortController::new();
        let mut resolved = blocker("B1");
        resolved.resolved_at = Some(Utc::now());
        let snap = Snapshot {
            blockers: vec![resolved],
            policy: CheckpointPolicy::custom(&[], Granularity::Step),
            ..Default::default()
        };
        assert!(controller.check_unguarded(&snap).is_none());
    }

    #[test]
    fn test_report_serialization_skips_empty_task_list() {
        let report = AbortReport::new(AbortReason::Ambiguity, "feature:F1", "two active stories");
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"reason\":\"ambiguity\""));
        assert!(!json.contains("exhausted_tasks"));
    }
}
