//! Parallel dispatch of a task batch.
//!
//! ## Architecture
//!
//! 1. **Builder** - dependency graph of the batch, rejecting cycles
//! 2. **Scheduler** - ready set, transitive skipping on failure
//! 3. **Executor** - [`WorkerDispatcher`], semaphore-bounded execution with a
//!    per-unit deadline and cooperative cancellation
//!
//! ## Example
//!
//! ```no_run
//! use std::collections::HashSet;
//! use std::sync::Arc;
//! use stride::dag::WorkerDispatcher;
//! use stride::worker::{CommandWorker, TaskDescriptor};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(batch: Vec<TaskDescriptor>) -> anyhow::Result<()> {
//! let worker = Arc::new(CommandWorker::new(vec!["./run-task.sh".into()]));
//! let dispatcher = WorkerDispatcher::new(worker).with_max_parallel(2);
//! let report = dispatcher
//!     .dispatch(batch, &HashSet::new(), &CancellationToken::new())
//!     .await?;
//! for result in &report.results {
//!     println!("{}: {:?}", result.task_id, result.status);
//! }
//! # Ok(())
//! # }
//! ```

mod builder;
mod executor;
mod scheduler;
mod state;

pub use builder::{GraphBuilder, TaskGraph, TaskIndex};
pub use executor::{DEFAULT_MAX_PARALLEL, DEFAULT_TASK_TIMEOUT_SECS, WorkerDispatcher};
pub use scheduler::{BatchScheduler, NodeStatus};
pub use state::{DispatchReport, ExecutionTimer, UnitResult, UnitStatus};
