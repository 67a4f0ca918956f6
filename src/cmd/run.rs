//! The orchestration loop entry point: `stride run`.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use stride::config::Config;
use stride::gates::{AutoApprove, ConfirmationSource, Detached, InteractivePrompt, StorePoller};
use stride::orchestrator::{LoopEvent, OrchestrationLoop, RunOutcome};
use stride::review::CommandReviewer;
use stride::ui::{OrchestratorUI, UiMode};
use stride::worker::CommandWorker;

/// Exit status of `stride run` when the loop aborted.
pub const EXIT_ABORTED: i32 = 2;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub yes: bool,
    pub no_wait: bool,
    pub max_parallel: Option<usize>,
    pub retry_limit: Option<u32>,
    pub ui: UiMode,
    pub verbose: bool,
}

/// Which confirmation source answers checkpoints for this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfirmMode {
    Auto,
    Detached,
    Prompt,
    Poll,
}

fn confirm_mode(options: &RunOptions, interactive: bool) -> ConfirmMode {
    if options.yes {
        ConfirmMode::Auto
    } else if options.no_wait {
        ConfirmMode::Detached
    } else if interactive && options.ui != UiMode::Json {
        ConfirmMode::Prompt
    } else {
        ConfirmMode::Poll
    }
}

fn exit_code(outcome: &RunOutcome) -> i32 {
    match outcome {
        RunOutcome::Aborted(_) => EXIT_ABORTED,
        _ => 0,
    }
}

pub async fn cmd_run(project_dir: &Path, options: RunOptions) -> Result<i32> {
    let mut config = Config::new(project_dir.to_path_buf(), options.verbose)?;
    for warning in config.warnings() {
        warn!("{}", warning);
    }
    if let Some(max) = options.max_parallel {
        config.settings_mut().dispatch.max_parallel = max;
    }
    if let Some(limit) = options.retry_limit {
        config.settings_mut().retry.limit = limit;
    }
    let settings = config.settings().clone();

    if settings.worker.command.is_empty() {
        anyhow::bail!(
            "No worker command configured. Set [worker] command in {} or STRIDE_WORKER_CMD.",
            config.config_file.display()
        );
    }
    if settings.review.command.is_empty() {
        anyhow::bail!(
            "No review command configured. Set [review] command in {} or STRIDE_REVIEW_CMD.",
            config.config_file.display()
        );
    }

    let store = Arc::new(config.open_store()?);
    let ui = Arc::new(OrchestratorUI::new(options.ui, options.verbose));

    let interactive = console::Term::stdout().is_term() && console::user_attended();
    let confirmations: Arc<dyn ConfirmationSource> = match confirm_mode(&options, interactive) {
        ConfirmMode::Auto => Arc::new(AutoApprove),
        ConfirmMode::Detached => Arc::new(Detached),
        ConfirmMode::Prompt => Arc::new(InteractivePrompt::new(ui.clone())),
        ConfirmMode::Poll => Arc::new(StorePoller::new(store.clone())),
    };

    let worker = Arc::new(
        CommandWorker::new(settings.worker.command.clone())
            .with_working_dir(config.project_dir.clone()),
    );
    let reviewer = Arc::new(
        CommandReviewer::new(settings.review.command.clone())
            .with_working_dir(config.project_dir.clone()),
    );

    let (tx, mut rx) = mpsc::unbounded_channel::<LoopEvent>();
    let orchestrator = OrchestrationLoop::new(store, worker, reviewer, confirmations)
        .with_retry_limit(settings.retry.limit)
        .with_max_parallel(settings.dispatch.max_parallel)
        .with_task_timeout(Duration::from_secs(settings.dispatch.task_timeout_secs))
        .with_review_timeout(Duration::from_secs(settings.review.timeout_secs))
        .with_event_channel(tx);

    let ui_events = ui.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            ui_events.handle_event(&event);
        }
    });

    let cancel = orchestrator.cancel_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; cancelling");
            cancel.cancel();
        }
    });

    let result = orchestrator.run().await;
    interrupt.abort();
    // Dropping the loop closes the event channel so the forwarder drains and exits.
    drop(orchestrator);
    let _ = forwarder.await;

    let outcome = result.context("Orchestration loop failed")?;
    ui.print_outcome(&outcome);
    if options.ui == UiMode::Json {
        println!("{}", serde_json::to_string(&outcome)?);
    } else if let RunOutcome::Aborted(report) = &outcome
        && !report.exhausted_tasks.is_empty()
    {
        println!(
            "  exhausted: {}",
            style(report.exhausted_tasks.join(", ")).red()
        );
    }
    Ok(exit_code(&outcome))
}
