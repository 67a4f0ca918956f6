//! Result types for a dispatched batch.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::state::RunStatus;

/// Terminal status of one unit as seen by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Success,
    Failure,
    Skipped,
    /// Did not reach a terminal status before cancellation; never committed.
    Cancelled,
}

impl UnitStatus {
    /// Status to persist, `None` for units that must not be committed.
    pub fn run_status(&self) -> Option<RunStatus> {
        match self {
            Self::Success => Some(RunStatus::Success),
            Self::Failure => Some(RunStatus::Failure),
            Self::Skipped => Some(RunStatus::Skipped),
            Self::Cancelled => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitResult {
    pub task_id: String,
    pub status: UnitStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

impl UnitResult {
    pub fn success(task_id: &str, output: String, duration: Duration) -> Self {
        Self {
            task_id: task_id.to_string(),
            status: UnitStatus::Success,
            output: Some(output),
            error: None,
            duration,
        }
    }

    pub fn failure(task_id: &str, error: &str, duration: Duration) -> Self {
        Self {
            task_id: task_id.to_string(),
            status: UnitStatus::Failure,
            output: None,
            error: Some(error.to_string()),
            duration,
        }
    }

    pub fn skipped(task_id: &str, reason: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            status: UnitStatus::Skipped,
            output: None,
            error: Some(reason.to_string()),
            duration: Duration::ZERO,
        }
    }

    pub fn cancelled(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            status: UnitStatus::Cancelled,
            output: None,
            error: None,
            duration: Duration::ZERO,
        }
    }
}

/// Results of one batch, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatchReport {
    pub results: Vec<UnitResult>,
    pub cancelled: bool,
}

impl DispatchReport {
    pub fn get(&self, task_id: &str) -> Option<&UnitResult> {
        self.results.iter().find(|r| r.task_id == task_id)
    }

    /// Results that reached a terminal status and may be committed.
    pub fn terminal(&self) -> impl Iterator<Item = &UnitResult> {
        self.results
            .iter()
            .filter(|r| r.status != UnitStatus::Cancelled)
    }

    pub fn count(&self, status: UnitStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(|r| r.status == UnitStatus::Success)
    }
}

/// Timer for tracking execution duration.
#[derive(Debug)]
pub struct ExecutionTimer {
    start: Instant,
}

impl ExecutionTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_units_are_not_terminal() {
        let report = DispatchReport {
            results: vec![
                UnitResult::success("T1", "ok".into(), Duration::from_millis(5)),
                UnitResult::cancelled("T2"),
                UnitResult::skipped("T3", "dependency T2 did not succeed"),
            ],
            cancelled: true,
        };
        let ids: Vec<_> = report.terminal().map(|r| r.task_id.as_str()).collect();
        assert_eq!(ids, vec!["T1", "T3"]);
        assert_eq!(UnitStatus::Cancelled.run_status(), None);
        assert_eq!(UnitStatus::Skipped.run_status(), Some(RunStatus::Skipped));
    }

    #[test]
    fn test_unit_result_serializes_duration_as_millis() {
        let result = UnitResult::failure("T1", "timeout", Duration::from_millis(1500));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["duration"], 1500);
        assert_eq!(json["status"], "failure");
    }
}
