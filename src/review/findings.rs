//! Review findings types for the story quality gate.
//!
//! ## Types
//!
//! - [`FindingSeverity`]: blocker / improvement / nit, ordered most to least critical
//! - [`ReviewVerdict`]: pass / fail for a whole story
//! - [`Finding`]: a single issue with a location reference
//! - [`ReviewReport`]: what a reviewer collaborator hands back
//!
//! ## Example
//!
//! ```
//! use stride::review::{Finding, FindingSeverity, ReviewReport, ReviewVerdict};
//!
//! let finding = Finding::new(FindingSeverity::Blocker, "src/auth.rs:42", "Password logged in clear text")
//!     .with_suggestion("Redact the field before logging");
//!
//! let report = ReviewReport::new(ReviewVerdict::Fail).add_finding(finding);
//! assert_eq!(report.findings.len(), 1);
//! assert!(report.has_blockers());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity level for individual findings.
///
/// Severities are ordered from most to least critical, so sorting a list of
/// findings by severity yields blocker > improvement > nit.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord,
)]
#[serde(rename_all = "lowercase")]
pub enum FindingSeverity {
    /// Prevents the story from being accepted.
    Blocker,
    /// Should be addressed, does not block on its own.
    #[default]
    Improvement,
    /// Cosmetic.
    Nit,
}

impl FindingSeverity {
    /// Check if this severity blocks acceptance.
    ///
    /// ```
    /// use stride::review::FindingSeverity;
    ///
    /// assert!(FindingSeverity::Blocker.is_blocking());
    /// assert!(!FindingSeverity::Nit.is_blocking());
    /// ```
    pub fn is_blocking(&self) -> bool {
        matches!(self, Self::Blocker)
    }
}

impl fmt::Display for FindingSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Blocker => "blocker",
            Self::Improvement => "improvement",
            Self::Nit => "nit",
        };
        write!(f, "{}", s)
    }
}

/// Overall verdict for a story review.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewVerdict {
    #[default]
    Pass,
    Fail,
}

impl ReviewVerdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }

    pub fn is_fail(&self) -> bool {
        matches!(self, Self::Fail)
    }
}

impl fmt::Display for ReviewVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
        };
        write!(f, "{}", s)
    }
}

/// A single finding from a reviewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: FindingSeverity,
    /// Location reference, usually `path` or `path:line`.
    pub location: String,
    pub issue: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl Finding {
    pub fn new(severity: FindingSeverity, location: &str, issue: &str) -> Self {
        Self {
            severity,
            location: location.to_string(),
            issue: issue.to_string(),
            suggestion: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: &str) -> Self {
        self.suggestion = Some(suggestion.to_string());
        self
    }

    /// Path part of the location, with any `:line[:col]` suffix removed.
    pub fn path(&self) -> &str {
        let mut path = self.location.as_str();
        while let Some((head, tail)) = path.rsplit_once(':') {
            if !tail.is_empty() && tail.chars().all(|c| c.is_ascii_digit()) {
                path = head;
            } else {
                break;
            }
        }
        path
    }

    /// One-line description used for remediation tasks.
    pub fn task_description(&self) -> String {
        let mut text = format!("[{}] {}: {}", self.severity, self.location, self.issue);
        if let Some(ref suggestion) = self.suggestion {
            text.push_str(&format!(" ({})", suggestion));
        }
        text
    }
}

/// Report returned by a reviewer collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewReport {
    pub verdict: ReviewVerdict,
    #[serde(default)]
    pub findings: Vec<Finding>,
}

impl ReviewReport {
    pub fn new(verdict: ReviewVerdict) -> Self {
        Self {
            verdict,
            findings: Vec::new(),
        }
    }

    pub fn pass() -> Self {
        Self::new(ReviewVerdict::Pass)
    }

    pub fn add_finding(mut self, finding: Finding) -> Self {
        self.findings.push(finding);
        self
    }

    pub fn has_blockers(&self) -> bool {
        self.findings.iter().any(|f| f.severity.is_blocking())
    }

    pub fn count_by_severity(&self, severity: FindingSeverity) -> usize {
        self.findings.iter().filter(|f| f.severity == severity).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        let mut severities = vec![
            FindingSeverity::Nit,
            FindingSeverity::Blocker,
            FindingSeverity::Improvement,
        ];
        severities.sort();
        assert_eq!(
            severities,
            vec![
                FindingSeverity::Blocker,
                FindingSeverity::Improvement,
                FindingSeverity::Nit
            ]
        );
    }

    #[test]
    fn test_severity_serialization() {
        let json = serde_json::to_string(&FindingSeverity::Improvement).unwrap();
        assert_eq!(json, "\"improvement\"");
        let parsed: FindingSeverity = serde_json::from_str("\"blocker\"").unwrap();
        assert_eq!(parsed, FindingSeverity::Blocker);
    }

    #[test]
    fn test_finding_path_strips_line_and_column() {
        let f = Finding::new(FindingSeverity::Nit, "src/lib.rs:10:4", "x");
        assert_eq!(f.path(), "src/lib.rs");
        let f = Finding::new(FindingSeverity::Nit, "src/lib.rs", "x");
        assert_eq!(f.path(), "src/lib.rs");
        let f = Finding::new(FindingSeverity::Nit, "C:notes", "x");
        assert_eq!(f.path(), "C:notes");
    }

    #[test]
    fn test_task_description_includes_suggestion() {
        let f = Finding::new(FindingSeverity::Blocker, "src/a.rs:3", "panics on empty input")
            .with_suggestion("return an error");
        assert_eq!(
            f.task_description(),
            "[blocker] src/a.rs:3: panics on empty input (return an error)"
        );
    }

    #[test]
    fn test_report_parses_minimal_json() {
        let report: ReviewReport = serde_json::from_str(r#"{"verdict":"pass"}"#).unwrap();
        assert!(report.verdict.is_pass());
        assert!(report.findings.is_empty());
    }

    #[test]
    fn test_report_counts() {
        let report = ReviewReport::new(ReviewVerdict::Fail)
            .add_finding(Finding::new(FindingSeverity::Blocker, "a", "x"))
            .add_finding(Finding::new(FindingSeverity::Nit, "b", "y"))
            .add_finding(Finding::new(FindingSeverity::Nit, "c", "z"));
        assert!(report.has_blockers());
        assert_eq!(report.count_by_severity(FindingSeverity::Nit), 2);
    }
}
