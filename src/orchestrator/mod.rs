//! The orchestration loop and its operator controls.
//!
//! - [`planner`] decides the next action from a snapshot
//! - [`OrchestrationLoop`] guards it with the checkpoint policy, performs it
//!   and commits the result as one transition
//! - [`control`] holds the single-transition operator actions (`resume`,
//!   `cancel`, `confirm`, ...)

pub mod control;
mod events;
pub mod planner;
mod runner;

pub use events::LoopEvent;
pub use planner::{NextAction, plan_next};
pub use runner::{DEFAULT_RETRY_LIMIT, OrchestrationLoop, RunOutcome, Step};
