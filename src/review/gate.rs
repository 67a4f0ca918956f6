//! Story quality gate.
//!
//! The [`Reviewer`] collaborator produces a raw [`ReviewReport`]; the
//! [`ReviewGate`] turns it into something the loop can act on:
//!
//! 1. findings sorted blocker > improvement > nit (stable within a severity)
//! 2. verdict derived from the findings: `fail` iff any blocker exists
//! 3. remediation tasks `{story}-r{round}-{n}` for a failing verdict
//! 4. findings located outside the story's declared scope reported separately

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::findings::{Finding, FindingSeverity, ReviewReport, ReviewVerdict};
use crate::state::{Snapshot, Story, Task, TaskOrigin};
use crate::util::{extract_json_object, run_piped};

/// Default time a reviewer may take.
pub const DEFAULT_REVIEW_TIMEOUT_SECS: u64 = 600;

/// What a reviewer is asked to evaluate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub story_id: String,
    pub entity_path: String,
    pub title: String,
    /// Round this evaluation will be recorded as.
    pub round: u32,
    #[serde(default)]
    pub scope: Vec<String>,
    pub tasks: Vec<ReviewedTask>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewedTask {
    pub id: String,
    pub description: String,
    pub origin: TaskOrigin,
}

impl ReviewRequest {
    pub fn for_story(snapshot: &Snapshot, story: &Story) -> Self {
        Self {
            story_id: story.id.clone(),
            entity_path: snapshot
                .entity_path(&story.id)
                .unwrap_or_else(|| format!("story:{}", story.id)),
            title: story.title.clone(),
            round: story.review_round + 1,
            scope: story.scope.clone(),
            tasks: story
                .tasks
                .iter()
                .map(|t| ReviewedTask {
                    id: t.id.clone(),
                    description: t.description.clone(),
                    origin: t.origin.clone(),
                })
                .collect(),
        }
    }
}

#[async_trait]
pub trait Reviewer: Send + Sync {
    async fn review(&self, request: &ReviewRequest) -> Result<ReviewReport>;
}

/// Normalized review result.
#[derive(Debug, Clone, PartialEq)]
pub struct GateOutcome {
    pub verdict: ReviewVerdict,
    pub findings: Vec<Finding>,
    pub out_of_scope: Vec<Finding>,
}

impl GateOutcome {
    pub fn is_pass(&self) -> bool {
        self.verdict.is_pass()
    }
}

pub struct ReviewGate {
    reviewer: Arc<dyn Reviewer>,
    timeout: Duration,
}

impl ReviewGate {
    pub fn new(reviewer: Arc<dyn Reviewer>) -> Self {
        Self {
            reviewer,
            timeout: Duration::from_secs(DEFAULT_REVIEW_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Ask the reviewer for a report and normalize it.
    pub async fn evaluate(&self, snapshot: &Snapshot, story: &Story) -> Result<GateOutcome> {
        let request = ReviewRequest::for_story(snapshot, story);
        debug!(story = %story.id, round = request.round, "requesting review");
        let report = tokio::time::timeout(self.timeout, self.reviewer.review(&request))
            .await
            .context("Review timed out")??;
        Ok(Self::normalize(story, report))
    }

    pub fn normalize(story: &Story, report: ReviewReport) -> GateOutcome {
        debug!(
            story = %story.id,
            blockers = report.count_by_severity(FindingSeverity::Blocker),
            improvements = report.count_by_severity(FindingSeverity::Improvement),
            nits = report.count_by_severity(FindingSeverity::Nit),
            "review report received"
        );
        let mut findings = report.findings;
        findings.sort_by_key(|f| f.severity);

        let verdict = if findings.iter().any(|f| f.severity.is_blocking()) {
            ReviewVerdict::Fail
        } else {
            ReviewVerdict::Pass
        };
        if verdict != report.verdict {
            warn!(
                story = %story.id,
                reported = %report.verdict,
                derived = %verdict,
                "reviewer verdict disagrees with its findings; using derived verdict"
            );
        }

        let out_of_scope = findings
            .iter()
            .filter(|f| !f.location.is_empty() && !story.is_in_scope(f.path()))
            .cloned()
            .collect();

        GateOutcome {
            verdict,
            findings,
            out_of_scope,
        }
    }

    /// One task per finding, in finding order. Ids follow
    /// `<story>-r<round>-<n>`; a number already taken anywhere in the tree is
    /// skipped.
    pub fn remediation_tasks(
        snapshot: &Snapshot,
        story: &Story,
        round: u32,
        findings: &[Finding],
    ) -> Vec<Task> {
        let mut taken: HashSet<String> = snapshot
            .features
            .iter()
            .flat_map(|f| f.epics.iter())
            .flat_map(|e| e.stories.iter())
            .flat_map(|s| s.tasks.iter())
            .chain(story.tasks.iter())
            .map(|t| t.id.clone())
            .collect();
        let mut n = 0;
        findings
            .iter()
            .map(|finding| {
                let id = loop {
                    n += 1;
                    let candidate = format!("{}-r{}-{}", story.id, round, n);
                    if taken.insert(candidate.clone()) {
                        break candidate;
                    }
                };
                let mut task = Task::new(&id, &story.id, &finding.task_description(), Vec::new());
                task.origin = TaskOrigin::Finding {
                    severity: finding.severity,
                    location: finding.location.clone(),
                };
                task
            })
            .collect()
    }
}

/// Runs an external reviewer. The [`ReviewRequest`] goes to stdin as JSON and
/// a JSON [`ReviewReport`] is expected on stdout (surrounding text is
/// tolerated).
#[derive(Debug, Clone)]
pub struct CommandReviewer {
    command: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandReviewer {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }
}

#[async_trait]
impl Reviewer for CommandReviewer {
    async fn review(&self, request: &ReviewRequest) -> Result<ReviewReport> {
        let input = serde_json::to_string(request)?;
        let output = run_piped(
            &self.command,
            &input,
            &[("STRIDE_STORY_ID", request.story_id.as_str())],
            self.working_dir.as_deref(),
        )
        .await?;
        if !output.success() {
            anyhow::bail!("Reviewer failed: {}", output.error_summary());
        }
        let json = extract_json_object(&output.stdout)
            .context("No JSON object found in reviewer output")?;
        serde_json::from_str(&json).context("Failed to parse reviewer report")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn story() -> Story {
        let mut story = Story::new("S1", "E1", "Login");
        story.scope = vec!["src/auth/".into()];
        story.tasks.push(Task::new("T1", "S1", "form", vec![]));
        story
    }

    fn snapshot_with(story: Story) -> Snapshot {
        let mut epic = crate::state::Epic::new("E1", "F1", "Auth");
        epic.stories.push(story);
        let mut feature = crate::state::Feature::new("F1", "Accounts");
        feature.active = true;
        feature.epics.push(epic);
        let mut snap = Snapshot::default();
        snap.features.push(feature);
        snap
    }

    struct Fixed(ReviewReport);

    #[async_trait]
    impl Reviewer for Fixed {
        async fn review(&self, _request: &ReviewRequest) -> Result<ReviewReport> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_normalize_sorts_stably_by_severity() {
        let report = ReviewReport::new(ReviewVerdict::Fail)
            .add_finding(Finding::new(FindingSeverity::Nit, "src/auth/a.rs", "n1"))
            .add_finding(Finding::new(FindingSeverity::Blocker, "src/auth/b.rs", "b1"))
            .add_finding(Finding::new(FindingSeverity::Nit, "src/auth/c.rs", "n2"))
            .add_finding(Finding::new(FindingSeverity::Improvement, "src/auth/d.rs", "i1"))
            .add_finding(Finding::new(FindingSeverity::Blocker, "src/auth/e.rs", "b2"));
        let outcome = ReviewGate::normalize(&story(), report);
        let issues: Vec<_> = outcome.findings.iter().map(|f| f.issue.as_str()).collect();
        assert_eq!(issues, vec!["b1", "b2", "i1", "n1", "n2"]);
        assert_eq!(outcome.verdict, ReviewVerdict::Fail);
    }

    #[test]
    fn test_verdict_is_derived_from_findings() {
        let report = ReviewReport::new(ReviewVerdict::Fail)
            .add_finding(Finding::new(FindingSeverity::Nit, "src/auth/a.rs", "style"));
        assert!(ReviewGate::normalize(&story(), report).is_pass());

        let report = ReviewReport::pass()
            .add_finding(Finding::new(FindingSeverity::Blocker, "src/auth/a.rs", "bug"));
        assert!(!ReviewGate::normalize(&story(), report).is_pass());
    }

    #[test]
    fn test_out_of_scope_findings_are_flagged() {
        let report = ReviewReport::new(ReviewVerdict::Fail)
            .add_finding(Finding::new(FindingSeverity::Blocker, "src/billing/x.rs:4", "leak"))
            .add_finding(Finding::new(FindingSeverity::Nit, "src/auth/y.rs:1", "typo"));
        let outcome = ReviewGate::normalize(&story(), report);
        assert_eq!(outcome.out_of_scope.len(), 1);
        assert_eq!(outcome.out_of_scope[0].location, "src/billing/x.rs:4");
    }

    #[test]
    fn test_remediation_task_ids_and_origin() {
        let findings = vec![
            Finding::new(FindingSeverity::Blocker, "src/auth/a.rs:9", "panic"),
            Finding::new(FindingSeverity::Nit, "src/auth/b.rs", "naming"),
        ];
        let tasks = ReviewGate::remediation_tasks(&snapshot_with(story()), &story(), 2, &findings);
        assert_eq!(tasks[0].id, "S1-r2-1");
        assert_eq!(tasks[1].id, "S1-r2-2");
        assert_eq!(tasks[0].story_id, "S1");
        assert!(matches!(
            tasks[0].origin,
            TaskOrigin::Finding { severity: FindingSeverity::Blocker, .. }
        ));
        assert!(!tasks[0].done);
    }

    #[test]
    fn test_remediation_ids_skip_planned_collisions() {
        let mut story = story();
        story.tasks.push(Task::new("S1-r1-1", "S1", "planned", vec![]));
        let mut snap = snapshot_with(story.clone());
        let mut other = Story::new("S2", "E1", "Logout");
        other.tasks.push(Task::new("S1-r1-3", "S2", "odd name", vec![]));
        snap.features[0].epics[0].stories.push(other);

        let findings = vec![
            Finding::new(FindingSeverity::Blocker, "src/auth/a.rs", "panic"),
            Finding::new(FindingSeverity::Blocker, "src/auth/b.rs", "leak"),
            Finding::new(FindingSeverity::Improvement, "src/auth/c.rs", "retry"),
        ];
        let tasks = ReviewGate::remediation_tasks(&snap, &story, 1, &findings);
        let ids: Vec<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["S1-r1-2", "S1-r1-4", "S1-r1-5"]);

        let mut next = snap.clone();
        crate::state::Op::AppendTasks {
            story_id: "S1".into(),
            tasks,
        }
        .apply_to(&mut next)
        .unwrap();
        crate::state::validate_snapshot(&next).unwrap();
    }

    #[test]
    fn test_sibling_directory_is_out_of_scope() {
        let mut story = story();
        story.scope = vec!["src/auth".into()];
        let report = ReviewReport::new(ReviewVerdict::Fail)
            .add_finding(Finding::new(FindingSeverity::Blocker, "src/authz/policy.rs:3", "bypass"))
            .add_finding(Finding::new(FindingSeverity::Blocker, "src/auth/login.rs:8", "panic"));
        let outcome = ReviewGate::normalize(&story, report);
        let stray: Vec<&str> = outcome.out_of_scope.iter().map(|f| f.location.as_str()).collect();
        assert_eq!(stray, vec!["src/authz/policy.rs:3"]);
    }

    #[tokio::test]
    async fn test_evaluate_uses_reviewer() {
        let report = ReviewReport::pass();
        let gate = ReviewGate::new(Arc::new(Fixed(report)));
        let snap = snapshot_with(story());
        let outcome = gate.evaluate(&snap, &story()).await.unwrap();
        assert!(outcome.is_pass());
        assert!(outcome.findings.is_empty());
    }

    #[tokio::test]
    async fn test_command_reviewer_parses_noisy_output() {
        let reviewer = CommandReviewer::new(vec![
            "sh".into(),
            "-c".into(),
            r#"cat >/dev/null; echo 'thinking...'; echo '{"verdict":"fail","findings":[{"severity":"blocker","location":"src/auth/a.rs","issue":"x"}]}'"#.into(),
        ]);
        let request = ReviewRequest::for_story(&Snapshot::default(), &story());
        let report = reviewer.review(&request).await.unwrap();
        assert!(report.has_blockers());
    }
}
