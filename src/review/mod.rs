//! Review: the quality gate between "all tasks done" and "story done".
//!
//! ## Components
//!
//! - [`findings`]: severities, verdicts, findings and raw reports
//! - [`gate`]: the [`Reviewer`] collaborator seam, [`ReviewGate`]
//!   normalization and the external [`CommandReviewer`]
//!
//! ## Example
//!
//! ```
//! use stride::review::{Finding, FindingSeverity, ReviewGate, ReviewReport, ReviewVerdict};
//! use stride::state::Story;
//!
//! let story = Story::new("S1", "E1", "Login");
//! let report = ReviewReport::new(ReviewVerdict::Pass)
//!     .add_finding(Finding::new(FindingSeverity::Blocker, "src/login.rs:3", "panics"));
//!
//! // A blocker always fails the story, whatever the reviewer claimed.
//! let outcome = ReviewGate::normalize(&story, report);
//! assert!(!outcome.is_pass());
//! ```

pub mod findings;
pub mod gate;

pub use findings::{Finding, FindingSeverity, ReviewReport, ReviewVerdict};
pub use gate::{CommandReviewer, GateOutcome, ReviewGate, ReviewRequest, Reviewer};
