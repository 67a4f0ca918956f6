//! The orchestration loop.
//!
//! Each iteration reads a snapshot, asks the planner for the next action,
//! suspends at the checkpoint guarding it when the policy says so, performs
//! the work and folds every resulting delta into a single transition. The
//! store is the only shared mutable resource; the loop keeps no state of its
//! own between iterations, so a cold restart picks up exactly where the last
//! applied transition left off.

use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::events::LoopEvent;
use super::planner::{NextAction, plan_next, position_path};
use crate::abort::{AbortController, AbortReport};
use crate::checkpoint::CheckpointId;
use crate::dag::{UnitStatus, WorkerDispatcher};
use crate::errors::{DispatchError, OrchestratorError, StoreError, ValidationError};
use crate::gates::ConfirmationSource;
use crate::review::{ReviewGate, Reviewer};
use crate::state::{
    Decision, EpicStatus, FeatureStatus, LoopStatus, Op, PendingCheckpoint, Snapshot,
    StateStore, Story, StoryStatus, Transition,
};
use crate::worker::{TaskDescriptor, Worker};

pub const DEFAULT_RETRY_LIMIT: u32 = 3;

const ABORT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Why [`OrchestrationLoop::run`] returned.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// No active feature is left.
    Complete,
    /// A feature was completed and archived. The loop halts here even when
    /// another feature was activated.
    FeatureCompleted { feature_id: String },
    /// Waiting at a checkpoint nobody answered yet.
    Suspended {
        checkpoint: CheckpointId,
        entity_path: String,
    },
    /// The operator deferred the checkpoint.
    Deferred {
        checkpoint: CheckpointId,
        entity_path: String,
    },
    Aborted(AbortReport),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Continue,
    Halt(RunOutcome),
}

pub struct OrchestrationLoop {
    store: Arc<StateStore>,
    dispatcher: WorkerDispatcher,
    gate: ReviewGate,
    confirmations: Arc<dyn ConfirmationSource>,
    aborts: AbortController,
    retry_limit: u32,
    cancel: CancellationToken,
    event_tx: Option<mpsc::UnboundedSender<LoopEvent>>,
}

impl OrchestrationLoop {
    pub fn new(
        store: Arc<StateStore>,
        worker: Arc<dyn Worker>,
        reviewer: Arc<dyn Reviewer>,
        confirmations: Arc<dyn ConfirmationSource>,
    ) -> Self {
        Self {
            store,
            dispatcher: WorkerDispatcher::new(worker),
            gate: ReviewGate::new(reviewer),
            confirmations,
            aborts: AbortController::new(),
            retry_limit: DEFAULT_RETRY_LIMIT,
            cancel: CancellationToken::new(),
            event_tx: None,
        }
    }

    pub fn with_retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = limit.max(1);
        self
    }

    pub fn with_max_parallel(mut self, max: usize) -> Self {
        self.dispatcher = self.dispatcher.with_max_parallel(max);
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.dispatcher = self.dispatcher.with_deadline(timeout);
        self
    }

    pub fn with_review_timeout(mut self, timeout: Duration) -> Self {
        self.gate = self.gate.with_timeout(timeout);
        self
    }

    pub fn with_event_channel(mut self, tx: mpsc::UnboundedSender<LoopEvent>) -> Self {
        self.dispatcher = self.dispatcher.with_event_channel(tx.clone());
        self.event_tx = Some(tx);
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request cancellation. In-flight units finish or are cut off
    /// cooperatively and the loop aborts with reason `cancelled`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Clear a persisted abort so the next [`run`](Self::run) continues.
    pub fn resume(&self) -> Result<Snapshot, OrchestratorError> {
        super::control::resume(&self.store)
    }

    fn emit(&self, event: LoopEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// Every loop commit carries [`Op::ExpectLive`], so nothing lands after an
    /// abort recorded by another writer.
    fn commit(&self, mut transition: Transition) -> Result<Snapshot, OrchestratorError> {
        if !transition.ops.iter().any(|op| matches!(op, Op::ClearAbort)) {
            transition.ops.insert(0, Op::ExpectLive);
        }
        let snapshot = self.store.apply(&transition)?;
        self.emit(LoopEvent::StateChanged {
            revision: snapshot.revision,
            action: transition.action,
        });
        Ok(snapshot)
    }

    fn abort_with(
        &self,
        mut transition: Transition,
        report: AbortReport,
    ) -> Result<Step, OrchestratorError> {
        transition.push(Op::RecordAbort {
            report: report.clone(),
        });
        self.commit(transition)?;
        self.emit(LoopEvent::Aborted {
            report: report.clone(),
        });
        Ok(Step::Halt(RunOutcome::Aborted(report)))
    }

    /// Run until the work is complete, a checkpoint suspends the loop, or the
    /// loop aborts. Holds the writer lease for its whole lifetime.
    #[instrument(skip_all)]
    pub async fn run(&self) -> Result<RunOutcome, OrchestratorError> {
        let _lease = self.store.acquire_writer()?;
        let snapshot = self.store.get_state()?;
        if let Some(report) = &snapshot.loop_record.abort {
            return Err(OrchestratorError::Aborted {
                reason: report.reason,
                entity_path: report.entity_path.clone(),
                fact: report.fact.clone(),
            });
        }
        info!(
            revision = snapshot.revision,
            policy = %snapshot.policy.preset,
            "orchestration loop started"
        );

        let mut rejections = 0u32;
        loop {
            let result = match self.step().await {
                Err(OrchestratorError::Store(StoreError::Validation(err)))
                    if !matches!(err, ValidationError::LoopAborted { .. }) =>
                {
                    rejections += 1;
                    warn!(
                        rejections,
                        error = %err,
                        "transition rejected; re-planning"
                    );
                    if rejections < self.retry_limit {
                        continue;
                    }
                    let snapshot = self.store.get_state()?;
                    let report = self
                        .aborts
                        .rejected_transition(&position_path(&snapshot), err.to_string());
                    self.abort_with(Transition::new("abort: rejected transition"), report)
                }
                other => {
                    if let Ok(Step::Continue) = &other {
                        rejections = 0;
                    }
                    other
                }
            };
            match result {
                Ok(Step::Continue) => {}
                Ok(Step::Halt(outcome)) => {
                    info!(?outcome, "orchestration loop halted");
                    return Ok(outcome);
                }
                Err(OrchestratorError::Store(StoreError::Validation(
                    ValidationError::LoopAborted { .. },
                ))) => {
                    if let Some(report) = self.store.get_state()?.loop_record.abort {
                        warn!(reason = %report.reason, "abort recorded mid-iteration; result discarded");
                        self.emit(LoopEvent::Aborted {
                            report: report.clone(),
                        });
                        return Ok(RunOutcome::Aborted(report));
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// One iteration: plan, guard, execute, commit.
    pub async fn step(&self) -> Result<Step, OrchestratorError> {
        let snapshot = self.store.get_state()?;
        if let Some(report) = &snapshot.loop_record.abort {
            return Ok(Step::Halt(RunOutcome::Aborted(report.clone())));
        }
        if self.cancel.is_cancelled() {
            let report = self.aborts.cancelled(&position_path(&snapshot));
            return self.abort_with(Transition::new("cancel"), report);
        }

        let action = plan_next(&snapshot, &self.aborts);
        debug!(action = %action.summary(), "planned next action");

        if let Some(checkpoint) = action.checkpoint()
            && snapshot.policy.is_enabled(checkpoint)
            && !is_granted(&snapshot, checkpoint, &action.action_key())
        {
            return self.suspend(&snapshot, checkpoint, &action).await;
        }
        self.execute(&snapshot, action).await
    }

    async fn suspend(
        &self,
        snapshot: &Snapshot,
        checkpoint: CheckpointId,
        action: &NextAction,
    ) -> Result<Step, OrchestratorError> {
        let action_key = action.action_key();
        let pending = match &snapshot.loop_record.pending {
            Some(p) if p.checkpoint == checkpoint && p.action_key == action_key => p.clone(),
            _ => {
                let pending = PendingCheckpoint {
                    id: Uuid::new_v4(),
                    checkpoint,
                    action_key,
                    entity_path: action_path(snapshot, action),
                    summary: action.summary(),
                    requested_at: Utc::now(),
                    decision: None,
                };
                self.commit(
                    Transition::new(format!("checkpoint {} requested", checkpoint)).op(
                        Op::RequestCheckpoint {
                            pending: pending.clone(),
                        },
                    ),
                )?;
                info!(
                    checkpoint = %checkpoint,
                    entity = %pending.entity_path,
                    "suspended at checkpoint"
                );
                pending
            }
        };
        self.emit(LoopEvent::CheckpointReached {
            checkpoint,
            entity_path: pending.entity_path.clone(),
            summary: pending.summary.clone(),
        });

        let decision = match pending.decision {
            Some(decision) => {
                info!(checkpoint = %checkpoint, %decision, "using recorded decision");
                Some(decision)
            }
            None => tokio::select! {
                decision = self.confirmations.wait(&pending) => decision?,
                _ = self.cancel.cancelled() => {
                    let report = self.aborts.cancelled(&pending.entity_path);
                    return self.abort_with(Transition::new("cancel"), report);
                }
            },
        };

        let Some(decision) = decision else {
            // `stride cancel` may have aborted the loop while we were waiting.
            let current = self.store.get_state()?;
            if let Some(report) = current.loop_record.abort {
                return Ok(Step::Halt(RunOutcome::Aborted(report)));
            }
            return Ok(Step::Halt(RunOutcome::Suspended {
                checkpoint,
                entity_path: pending.entity_path,
            }));
        };

        self.commit(
            Transition::new(format!("checkpoint {} {}", checkpoint, decision))
                .op(Op::ResolveCheckpoint { decision }),
        )?;
        self.emit(LoopEvent::CheckpointResolved {
            checkpoint,
            decision,
        });
        match decision {
            Decision::Proceed => Ok(Step::Continue),
            Decision::Defer => {
                info!(checkpoint = %checkpoint, "checkpoint deferred");
                Ok(Step::Halt(RunOutcome::Deferred {
                    checkpoint,
                    entity_path: pending.entity_path,
                }))
            }
        }
    }

    async fn execute(
        &self,
        snapshot: &Snapshot,
        action: NextAction,
    ) -> Result<Step, OrchestratorError> {
        let mut transition = Transition::new(action.summary());
        if snapshot
            .loop_record
            .grant
            .as_ref()
            .is_some_and(|g| g.action_key == action.action_key())
        {
            transition.push(Op::ConsumeGrant);
        }
        if snapshot.loop_record.pending.is_some() {
            transition.push(Op::ClearCheckpoint);
        }

        match action {
            NextAction::Complete => self.finish(snapshot, transition),
            NextAction::Abort(report) => self.abort_with(transition, report),
            NextAction::EnterEpic { epic_id, .. } => {
                let pending_epic = snapshot
                    .active_feature()
                    .and_then(|f| f.epic(&epic_id))
                    .is_some_and(|e| e.status == EpicStatus::Pending);
                transition.push(Op::SetPosition {
                    epic_id: Some(epic_id.clone()),
                    story_id: None,
                });
                if pending_epic {
                    transition.push(Op::SetEpicStatus {
                        epic_id: epic_id.clone(),
                        status: EpicStatus::InProgress,
                    });
                }
                info!(epic = %epic_id, "entering epic");
                self.commit(transition)?;
                Ok(Step::Continue)
            }
            NextAction::EnterStory { story_id, .. } => {
                transition.push(Op::SetPosition {
                    epic_id: snapshot.position.epic_id.clone(),
                    story_id: Some(story_id.clone()),
                });
                info!(story = %story_id, "entering story");
                self.commit(transition)?;
                Ok(Step::Continue)
            }
            NextAction::DispatchBatch { story_id, task_ids } => {
                self.dispatch_batch(snapshot, &story_id, task_ids, transition)
                    .await
            }
            NextAction::AwaitReview { story_id } => {
                transition.push(Op::SetStoryStatus {
                    story_id,
                    status: StoryStatus::WaitingReview,
                });
                self.commit(transition)?;
                Ok(Step::Continue)
            }
            NextAction::Evaluate { story_id } => {
                self.evaluate(snapshot, &story_id, transition).await
            }
            NextAction::ActOnVerdict { story_id, .. } => {
                self.act_on_verdict(snapshot, &story_id, transition)
            }
            NextAction::CloseStory { story_id } => {
                let story = story_in(snapshot, &story_id)?;
                transition.push(Op::SetStoryStatus {
                    story_id: story_id.clone(),
                    status: StoryStatus::Done,
                });
                transition.push(Op::SetPosition {
                    epic_id: Some(story.epic_id.clone()),
                    story_id: None,
                });
                let mut events = vec![LoopEvent::StoryCompleted {
                    story_id: story_id.clone(),
                }];
                self.roll_up(
                    snapshot,
                    &story.epic_id,
                    Some(&story_id),
                    &mut transition,
                    &mut events,
                );
                info!(story = %story_id, "story closed");
                self.commit_rollup(transition, events)
            }
            NextAction::CompleteEpic { epic_id } => {
                let mut events = Vec::new();
                self.roll_up(snapshot, &epic_id, None, &mut transition, &mut events);
                self.commit_rollup(transition, events)
            }
            NextAction::CompleteFeature { feature_id } => {
                let mut events = Vec::new();
                complete_feature(snapshot, &feature_id, &mut transition, &mut events);
                self.commit_rollup(transition, events)
            }
        }
    }

    fn finish(
        &self,
        snapshot: &Snapshot,
        mut transition: Transition,
    ) -> Result<Step, OrchestratorError> {
        if snapshot.loop_record.status != LoopStatus::Complete {
            transition.push(Op::SetLoopStatus {
                status: LoopStatus::Complete,
            });
        }
        if !transition.is_empty() {
            self.commit(transition)?;
        }
        info!("no active feature left");
        Ok(Step::Halt(RunOutcome::Complete))
    }

    #[instrument(skip_all, fields(story = %story_id))]
    async fn dispatch_batch(
        &self,
        snapshot: &Snapshot,
        story_id: &str,
        task_ids: Vec<String>,
        mut transition: Transition,
    ) -> Result<Step, OrchestratorError> {
        let story = story_in(snapshot, story_id)?;
        let sp = entity_path_of(snapshot, story_id);

        let exhausted: Vec<String> = story
            .incomplete_tasks()
            .filter(|t| t.attempts >= self.retry_limit)
            .map(|t| t.id.clone())
            .collect();
        if let Some(first) = exhausted.first() {
            let report = self.aborts.retry_exhausted(
                &entity_path_of(snapshot, first),
                format!(
                    "task(s) {} already failed {} time(s)",
                    exhausted.join(", "),
                    self.retry_limit
                ),
                exhausted.clone(),
            );
            return self.abort_with(transition, report);
        }

        let batch: Vec<TaskDescriptor> = task_ids
            .iter()
            .filter_map(|id| story.task(id))
            .map(|task| TaskDescriptor::from_task(snapshot, task))
            .collect();
        let done: HashSet<String> = story
            .tasks
            .iter()
            .filter(|t| t.done)
            .map(|t| t.id.clone())
            .collect();

        info!(units = batch.len(), "dispatching batch");
        self.emit(LoopEvent::BatchDispatched {
            story_id: story_id.to_string(),
            tasks: task_ids,
        });

        let token = self.cancel.child_token();
        let watcher = self.watch_for_abort(token.clone());
        let result = self.dispatcher.dispatch(batch, &done, &token).await;
        watcher.abort();

        let report = match result {
            Ok(report) => report,
            Err(err) => {
                let report = match &err {
                    DispatchError::UnsatisfiedDependency { task, .. } => self
                        .aborts
                        .missing_entity(&entity_path_of(snapshot, task), err.to_string()),
                    DispatchError::Cycle { .. } | DispatchError::DuplicateTask { .. } => {
                        self.aborts.ambiguity(&sp, err.to_string())
                    }
                };
                return self.abort_with(transition, report);
            }
        };

        for result in report.terminal() {
            if let Some(status) = result.status.run_status() {
                transition.push(Op::RecordTaskRun {
                    task_id: result.task_id.clone(),
                    status,
                    error: result.error.clone(),
                });
            }
        }
        info!(
            succeeded = report.count(UnitStatus::Success),
            failed = report.count(UnitStatus::Failure),
            skipped = report.count(UnitStatus::Skipped),
            cancelled = report.count(UnitStatus::Cancelled),
            "batch joined"
        );

        if report.cancelled {
            let abort = self.aborts.cancelled(&sp);
            return self.abort_with(transition, abort);
        }

        let exhausted: Vec<(String, Option<String>)> = report
            .results
            .iter()
            .filter(|r| r.status == UnitStatus::Failure)
            .filter(|r| {
                story
                    .task(&r.task_id)
                    .is_some_and(|t| t.attempts + 1 >= self.retry_limit)
            })
            .map(|r| (r.task_id.clone(), r.error.clone()))
            .collect();
        if let Some((first, last_error)) = exhausted.first() {
            let ids: Vec<String> = exhausted.iter().map(|(id, _)| id.clone()).collect();
            let abort = self.aborts.retry_exhausted(
                &entity_path_of(snapshot, first),
                format!(
                    "task(s) {} failed {} time(s); last error: {}",
                    ids.join(", "),
                    self.retry_limit,
                    last_error.as_deref().unwrap_or("unknown")
                ),
                ids,
            );
            return self.abort_with(transition, abort);
        }

        self.commit(transition)?;
        Ok(Step::Continue)
    }

    /// Cancels `token` when another process records an abort (`stride cancel`)
    /// while units or a review are in flight.
    fn watch_for_abort(&self, token: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ABORT_POLL_INTERVAL);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = interval.tick() => {}
                }
                match store.read_async().await {
                    Ok(snapshot) if snapshot.loop_record.abort.is_some() => {
                        warn!("abort recorded externally; cancelling in-flight work");
                        token.cancel();
                        return;
                    }
                    Ok(_) => {}
                    Err(err) => debug!(error = %err, "abort watcher could not read state"),
                }
            }
        })
    }

    #[instrument(skip_all, fields(story = %story_id))]
    async fn evaluate(
        &self,
        snapshot: &Snapshot,
        story_id: &str,
        mut transition: Transition,
    ) -> Result<Step, OrchestratorError> {
        let story = story_in(snapshot, story_id)?;
        let sp = entity_path_of(snapshot, story_id);

        let token = self.cancel.child_token();
        let watcher = self.watch_for_abort(token.clone());
        let evaluated = tokio::select! {
            result = self.gate.evaluate(snapshot, story) => Some(result),
            _ = token.cancelled() => None,
        };
        watcher.abort();
        let Some(evaluated) = evaluated else {
            info!("review cut off by cancellation; nothing recorded");
            if let Some(report) = self.store.get_state()?.loop_record.abort {
                self.emit(LoopEvent::Aborted {
                    report: report.clone(),
                });
                return Ok(Step::Halt(RunOutcome::Aborted(report)));
            }
            let report = self.aborts.cancelled(&sp);
            return self.abort_with(transition, report);
        };

        let outcome = match evaluated {
            Ok(outcome) => outcome,
            Err(err) => {
                let error = format!("{:#}", err);
                let failures = story.review_failures + 1;
                warn!(failures, error = %error, "review could not be completed");
                transition.push(Op::RecordReviewError {
                    story_id: story_id.to_string(),
                    error: error.clone(),
                });
                if failures >= self.retry_limit {
                    let report = self.aborts.retry_exhausted(
                        &sp,
                        format!(
                            "reviewer failed {} time(s); last error: {}",
                            failures, error
                        ),
                        Vec::new(),
                    );
                    return self.abort_with(transition, report);
                }
                self.commit(transition)?;
                return Ok(Step::Continue);
            }
        };

        let event = LoopEvent::ReviewCompleted {
            story_id: story_id.to_string(),
            round: story.review_round + 1,
            verdict: outcome.verdict,
            findings: outcome.findings.len(),
        };
        info!(
            round = story.review_round + 1,
            verdict = %outcome.verdict,
            findings = outcome.findings.len(),
            "review recorded"
        );
        transition.push(Op::RecordReview {
            story_id: story_id.to_string(),
            verdict: outcome.verdict,
            findings: outcome.findings.clone(),
        });

        if !outcome.out_of_scope.is_empty() {
            let locations: Vec<&str> = outcome
                .out_of_scope
                .iter()
                .map(|f| f.location.as_str())
                .collect();
            let report = self.aborts.scope_exceeded(
                &sp,
                format!(
                    "finding(s) at {} lie outside the declared scope [{}]",
                    locations.join(", "),
                    story.scope.join(", ")
                ),
            );
            self.emit(event);
            return self.abort_with(transition, report);
        }

        self.commit(transition)?;
        self.emit(event);
        Ok(Step::Continue)
    }

    fn act_on_verdict(
        &self,
        snapshot: &Snapshot,
        story_id: &str,
        mut transition: Transition,
    ) -> Result<Step, OrchestratorError> {
        let story = story_in(snapshot, story_id)?;
        let Some(review) = &story.review else {
            return Err(OrchestratorError::Other(anyhow::anyhow!(
                "{} has no review to act on",
                entity_path_of(snapshot, story_id)
            )));
        };

        transition.push(Op::AcknowledgeReview {
            story_id: story_id.to_string(),
        });
        if review.verdict.is_fail() {
            let tasks =
                ReviewGate::remediation_tasks(snapshot, story, review.round, &review.findings);
            info!(
                story = %story_id,
                round = review.round,
                tasks = tasks.len(),
                "review failed; appending remediation tasks"
            );
            transition.push(Op::AppendTasks {
                story_id: story_id.to_string(),
                tasks,
            });
            transition.push(Op::SetStoryStatus {
                story_id: story_id.to_string(),
                status: StoryStatus::InProgress,
            });
        } else {
            info!(story = %story_id, round = review.round, "review passed");
        }
        self.commit(transition)?;
        Ok(Step::Continue)
    }

    /// Fold epic and feature completion into `transition` when closing
    /// `closing` (or nothing) finishes `epic_id`.
    fn roll_up(
        &self,
        snapshot: &Snapshot,
        epic_id: &str,
        closing: Option<&str>,
        transition: &mut Transition,
        events: &mut Vec<LoopEvent>,
    ) {
        let Some(feature) = snapshot.active_feature() else {
            return;
        };
        let Some(epic) = feature.epic(epic_id) else {
            return;
        };
        let epic_done = epic
            .stories
            .iter()
            .all(|s| s.status == StoryStatus::Done || Some(s.id.as_str()) == closing);
        if !epic_done {
            return;
        }
        transition.push(Op::SetEpicStatus {
            epic_id: epic_id.to_string(),
            status: EpicStatus::Completed,
        });
        transition.push(Op::SetPosition {
            epic_id: None,
            story_id: None,
        });
        events.push(LoopEvent::EpicCompleted {
            epic_id: epic_id.to_string(),
        });
        info!(epic = %epic_id, "epic completed");

        let feature_done = feature
            .epics
            .iter()
            .all(|e| e.status == EpicStatus::Completed || e.id == epic_id);
        if feature_done {
            complete_feature(snapshot, &feature.id, transition, events);
        }
    }

    fn commit_rollup(
        &self,
        transition: Transition,
        events: Vec<LoopEvent>,
    ) -> Result<Step, OrchestratorError> {
        self.commit(transition)?;
        let mut completed = None;
        for event in events {
            if let LoopEvent::FeatureCompleted { feature_id } = &event {
                completed = Some(feature_id.clone());
            }
            self.emit(event);
        }
        Ok(match completed {
            Some(feature_id) => Step::Halt(RunOutcome::FeatureCompleted { feature_id }),
            None => Step::Continue,
        })
    }
}

fn complete_feature(
    snapshot: &Snapshot,
    feature_id: &str,
    transition: &mut Transition,
    events: &mut Vec<LoopEvent>,
) {
    transition.push(Op::CompleteFeature {
        feature_id: feature_id.to_string(),
    });
    events.push(LoopEvent::FeatureCompleted {
        feature_id: feature_id.to_string(),
    });
    info!(feature = %feature_id, "feature completed and archived");
    match snapshot
        .features
        .iter()
        .find(|f| f.id != feature_id && f.status != FeatureStatus::Completed)
    {
        Some(next) => transition.push(Op::ActivateFeature {
            feature_id: next.id.clone(),
        }),
        None => transition.push(Op::SetLoopStatus {
            status: LoopStatus::Complete,
        }),
    }
}

fn is_granted(snapshot: &Snapshot, checkpoint: CheckpointId, action_key: &str) -> bool {
    snapshot
        .loop_record
        .grant
        .as_ref()
        .is_some_and(|g| g.checkpoint == checkpoint && g.action_key == action_key)
}

fn story_in<'a>(snapshot: &'a Snapshot, story_id: &str) -> Result<&'a Story, OrchestratorError> {
    snapshot.current_story().filter(|s| s.id == story_id).ok_or_else(|| {
        OrchestratorError::Other(anyhow::anyhow!(
            "story {} is not the current story",
            story_id
        ))
    })
}

fn entity_path_of(snapshot: &Snapshot, id: &str) -> String {
    snapshot
        .entity_path(id)
        .unwrap_or_else(|| position_path(snapshot))
}

fn action_path(snapshot: &Snapshot, action: &NextAction) -> String {
    let id = match action {
        NextAction::EnterEpic { epic_id, .. } | NextAction::CompleteEpic { epic_id } => epic_id,
        NextAction::EnterStory { story_id, .. }
        | NextAction::DispatchBatch { story_id, .. }
        | NextAction::AwaitReview { story_id }
        | NextAction::Evaluate { story_id }
        | NextAction::ActOnVerdict { story_id, .. }
        | NextAction::CloseStory { story_id } => story_id,
        NextAction::CompleteFeature { feature_id } => feature_id,
        NextAction::Complete | NextAction::Abort(_) => return position_path(snapshot),
    };
    entity_path_of(snapshot, id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointPolicy, PolicyPreset};
    use crate::gates::{AutoApprove, Detached};
    use crate::review::ReviewReport;
    use crate::state::PlanFile;
    use anyhow::Result;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct Succeed;

    #[async_trait]
    impl Worker for Succeed {
        async fn execute(&self, task: &TaskDescriptor) -> Result<String> {
            Ok(format!("did {}", task.task_id))
        }
    }

    struct Approve;

    #[async_trait]
    impl Reviewer for Approve {
        async fn review(&self, _request: &crate::review::ReviewRequest) -> Result<ReviewReport> {
            Ok(ReviewReport::pass())
        }
    }

    const PLAN: &str = r#"{"features": [{"id": "F1", "description": "Accounts", "epics": [
        {"id": "E1", "title": "Auth", "stories": [
            {"id": "S1", "title": "Login", "tasks": [
                {"id": "T1", "description": "form"},
                {"id": "T2", "description": "submit", "depends_on": ["T1"]}]}]}]}]}"#;

    fn store_with(preset: PolicyPreset) -> (TempDir, Arc<StateStore>) {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path().join("state.json")).unwrap();
        let plan = PlanFile::parse(PLAN).unwrap();
        let current = store.get_state().unwrap();
        store.apply(&plan.import_transition(&current, "test")).unwrap();
        store
            .apply(&Transition::new("policy").op(Op::SetPolicy {
                policy: CheckpointPolicy::from_preset(preset),
            }))
            .unwrap();
        (dir, Arc::new(store))
    }

    fn orchestration(
        store: Arc<StateStore>,
        confirmations: Arc<dyn ConfirmationSource>,
    ) -> OrchestrationLoop {
        OrchestrationLoop::new(store, Arc::new(Succeed), Arc::new(Approve), confirmations)
    }

    #[tokio::test]
    async fn test_detached_run_suspends_at_first_checkpoint() {
        let (_dir, store) = store_with(PolicyPreset::Manual);
        let outcome = orchestration(store.clone(), Arc::new(Detached))
            .run()
            .await
            .unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Suspended {
                checkpoint: CheckpointId::BeforeTask,
                entity_path: "feature:F1/epic:E1/story:S1".into(),
            }
        );
        let snap = store.get_state().unwrap();
        assert_eq!(snap.loop_record.status, LoopStatus::AwaitingCheckpoint);
        assert_eq!(
            snap.loop_record.pending.as_ref().map(|p| p.action_key.as_str()),
            Some("dispatch:S1:T1,T2")
        );
    }

    #[tokio::test]
    async fn test_stale_pending_checkpoint_is_cleared_when_policy_relaxes() {
        let (_dir, store) = store_with(PolicyPreset::Manual);
        orchestration(store.clone(), Arc::new(Detached))
            .run()
            .await
            .unwrap();
        store
            .apply(&Transition::new("policy").op(Op::SetPolicy {
                policy: CheckpointPolicy::from_preset(PolicyPreset::StoryAutonomous),
            }))
            .unwrap();

        let outcome = orchestration(store.clone(), Arc::new(Detached))
            .run()
            .await
            .unwrap();
        assert_eq!(
            outcome,
            RunOutcome::FeatureCompleted {
                feature_id: "F1".into()
            }
        );
        let snap = store.get_state().unwrap();
        assert!(snap.loop_record.pending.is_none());
        assert_eq!(snap.loop_record.status, LoopStatus::Complete);
    }

    #[tokio::test]
    async fn test_cancel_before_run_aborts_with_cancelled() {
        let (_dir, store) = store_with(PolicyPreset::EpicAutonomous);
        let orchestration = orchestration(store.clone(), Arc::new(AutoApprove));
        orchestration.cancel();
        let outcome = orchestration.run().await.unwrap();
        let RunOutcome::Aborted(report) = outcome else {
            panic!("expected abort, got {:?}", outcome);
        };
        assert_eq!(report.reason, crate::abort::AbortReason::Cancelled);

        // A second run refuses until resumed.
        let err = orchestration.run().await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Aborted { .. }));
    }

    #[tokio::test]
    async fn test_events_are_emitted_for_every_commit() {
        let (_dir, store) = store_with(PolicyPreset::EpicAutonomous);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = orchestration(store.clone(), Arc::new(AutoApprove))
            .with_event_channel(tx)
            .run()
            .await
            .unwrap();
        assert!(matches!(outcome, RunOutcome::FeatureCompleted { .. }));

        let mut state_changes = 0;
        let mut saw_feature_completed = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                LoopEvent::StateChanged { .. } => state_changes += 1,
                LoopEvent::FeatureCompleted { .. } => saw_feature_completed = true,
                _ => {}
            }
        }
        let snap = store.get_state().unwrap();
        // import + policy were applied before the loop started
        assert_eq!(state_changes as u64, snap.revision - 2);
        assert!(saw_feature_completed);
    }
}
