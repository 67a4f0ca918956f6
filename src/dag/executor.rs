//! Bounded-parallel batch execution.
//!
//! The dispatcher walks the batch's dependency graph, starts ready units in
//! declaration order while permits are available, and waits for every unit
//! to reach a terminal status before returning. It never touches the state
//! store: committing results is the loop's job.

use futures::FutureExt;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::builder::{GraphBuilder, TaskIndex};
use super::scheduler::{BatchScheduler, NodeStatus};
use super::state::{DispatchReport, ExecutionTimer, UnitResult, UnitStatus};
use crate::errors::DispatchError;
use crate::orchestrator::LoopEvent;
use crate::worker::{TaskDescriptor, Worker};

pub const DEFAULT_MAX_PARALLEL: usize = 4;
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 900;

pub struct WorkerDispatcher {
    worker: Arc<dyn Worker>,
    max_parallel: usize,
    deadline: Duration,
    event_tx: Option<mpsc::UnboundedSender<LoopEvent>>,
}

impl WorkerDispatcher {
    pub fn new(worker: Arc<dyn Worker>) -> Self {
        Self {
            worker,
            max_parallel: DEFAULT_MAX_PARALLEL,
            deadline: Duration::from_secs(DEFAULT_TASK_TIMEOUT_SECS),
            event_tx: None,
        }
    }

    pub fn with_max_parallel(mut self, max: usize) -> Self {
        self.max_parallel = max.max(1);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_event_channel(mut self, tx: mpsc::UnboundedSender<LoopEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    fn emit(&self, event: LoopEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// Run `batch` to completion.
    ///
    /// `done_outside` lists completed tasks that batch members may depend on.
    /// Units still running when `cancel` fires come back as
    /// [`UnitStatus::Cancelled`], as do units that never started.
    #[instrument(skip_all, fields(units = batch.len()))]
    pub async fn dispatch(
        &self,
        batch: Vec<TaskDescriptor>,
        done_outside: &HashSet<String>,
        cancel: &CancellationToken,
    ) -> Result<DispatchReport, DispatchError> {
        let graph = GraphBuilder::new(batch, done_outside).build()?;
        let total = graph.len();
        let mut scheduler = BatchScheduler::new(graph);
        let mut results: Vec<Option<UnitResult>> = vec![None; total];
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let mut running: JoinSet<(TaskIndex, UnitResult)> = JoinSet::new();
        let mut cancelled = cancel.is_cancelled();

        loop {
            if !cancelled {
                for idx in scheduler.get_ready() {
                    let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                        break;
                    };
                    let Some(task) = scheduler.graph().get_task(idx).cloned() else {
                        continue;
                    };
                    scheduler.mark_running(idx);
                    debug!(
                        task = %task.task_id,
                        attempt = task.attempt,
                        in_flight = scheduler.running_count(),
                        "unit started"
                    );
                    self.emit(LoopEvent::TaskStarted {
                        task_id: task.task_id.clone(),
                        attempt: task.attempt,
                    });

                    let worker = self.worker.clone();
                    let deadline = self.deadline;
                    let token = cancel.clone();
                    running.spawn(async move {
                        let _permit = permit;
                        (idx, run_unit(worker, task, deadline, token).await)
                    });
                }
            }

            if running.is_empty() {
                if !cancelled && !scheduler.all_terminal() {
                    warn!("no unit is ready but the batch has unfinished units");
                }
                break;
            }

            tokio::select! {
                joined = running.join_next() => match joined {
                    Some(Ok((idx, result))) => {
                        self.record(idx, result, &mut scheduler, &mut results);
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "dispatch unit did not complete");
                    }
                    None => break,
                },
                _ = cancel.cancelled(), if !cancelled => {
                    info!("cancellation requested; draining running units");
                    cancelled = true;
                }
            }
        }

        let results: Vec<UnitResult> = results
            .into_iter()
            .enumerate()
            .map(|(idx, result)| {
                result.unwrap_or_else(|| {
                    let id = scheduler
                        .graph()
                        .get_task(idx)
                        .map(|t| t.task_id.clone())
                        .unwrap_or_default();
                    UnitResult::cancelled(&id)
                })
            })
            .collect();
        let report = DispatchReport {
            cancelled: cancelled || results.iter().any(|r| r.status == UnitStatus::Cancelled),
            results,
        };
        info!(
            succeeded = report.count(UnitStatus::Success),
            failed = report.count(UnitStatus::Failure),
            skipped = report.count(UnitStatus::Skipped),
            cancelled = report.count(UnitStatus::Cancelled),
            "batch finished"
        );
        Ok(report)
    }

    fn record(
        &self,
        idx: TaskIndex,
        result: UnitResult,
        scheduler: &mut BatchScheduler,
        results: &mut [Option<UnitResult>],
    ) {
        match result.status {
            UnitStatus::Success => scheduler.mark_succeeded(idx),
            UnitStatus::Failure => {
                for skipped in scheduler.mark_failed(idx) {
                    let Some(task) = scheduler.graph().get_task(skipped) else {
                        continue;
                    };
                    let cause = match scheduler.status(skipped) {
                        Some(NodeStatus::Skipped { cause }) => cause.clone(),
                        _ => result.task_id.clone(),
                    };
                    let skip = UnitResult::skipped(
                        &task.task_id,
                        &format!("dependency {} did not succeed", cause),
                    );
                    self.emit_finished(&skip);
                    results[skipped] = Some(skip);
                }
            }
            // Left running in the scheduler so dependents are never started.
            UnitStatus::Skipped | UnitStatus::Cancelled => {}
        }
        self.emit_finished(&result);
        results[idx] = Some(result);
    }

    fn emit_finished(&self, result: &UnitResult) {
        debug!(task = %result.task_id, status = ?result.status, "unit finished");
        self.emit(LoopEvent::TaskFinished {
            task_id: result.task_id.clone(),
            status: result.status,
            error: result.error.clone(),
        });
    }
}

async fn run_unit(
    worker: Arc<dyn Worker>,
    task: TaskDescriptor,
    deadline: Duration,
    cancel: CancellationToken,
) -> UnitResult {
    let timer = ExecutionTimer::start();
    let work = AssertUnwindSafe(worker.execute(&task)).catch_unwind();
    tokio::select! {
        biased;
        _ = cancel.cancelled() => UnitResult::cancelled(&task.task_id),
        outcome = tokio::time::timeout(deadline, work) => match outcome {
            Ok(Ok(Ok(output))) => UnitResult::success(&task.task_id, output, timer.elapsed()),
            Ok(Ok(Err(err))) => {
                UnitResult::failure(&task.task_id, &format!("{:#}", err), timer.elapsed())
            }
            Ok(Err(_panic)) => {
                UnitResult::failure(&task.task_id, "worker panicked", timer.elapsed())
            }
            Err(_elapsed) => UnitResult::failure(&task.task_id, "timeout", timer.elapsed()),
        },
    }
}
