use console::{Term, style};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use crate::dag::UnitStatus;
use crate::orchestrator::{LoopEvent, RunOutcome};
use crate::state::PendingCheckpoint;
use crate::ui::icons::{BLOCKER, CHECK, CROSS, FOLDER, PAUSE, REVIEW, RUNNING, SKIP, SPARKLE};

/// Output mode for `stride run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UiMode {
    /// Spinners and colors
    #[default]
    Full,
    /// One plain line per notable event
    Minimal,
    /// One JSON object per event
    Json,
}

impl std::str::FromStr for UiMode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "json" => Self::Json,
            "minimal" => Self::Minimal,
            _ => Self::Full,
        })
    }
}

/// Terminal renderer for loop events.
///
/// A header spinner shows what the loop is doing; every in-flight task gets
/// its own spinner until it reports a terminal status.
pub struct OrchestratorUI {
    mode: UiMode,
    multi: MultiProgress,
    header: ProgressBar,
    tasks: Mutex<HashMap<String, ProgressBar>>,
    verbose: bool,
    term: Term,
}

impl OrchestratorUI {
    pub fn new(mode: UiMode, verbose: bool) -> Self {
        let multi = MultiProgress::new();
        let header = multi.add(ProgressBar::new_spinner());
        if let Ok(header_style) = ProgressStyle::default_spinner().template("{prefix:.bold} {spinner} {msg}") {
            header.set_style(header_style);
        }
        header.set_prefix("stride");
        if mode == UiMode::Full {
            header.enable_steady_tick(Duration::from_millis(100));
            header.set_message("starting...");
        } else {
            header.finish_and_clear();
        }
        Self {
            mode,
            multi,
            header,
            tasks: Mutex::new(HashMap::new()),
            verbose,
            term: Term::stdout(),
        }
    }

    /// Print a line above the spinners, falling back to stderr.
    fn print_line(&self, msg: impl AsRef<str>) {
        match self.mode {
            UiMode::Full => {
                if self.multi.println(msg.as_ref()).is_err() {
                    eprintln!("{}", msg.as_ref());
                }
            }
            _ => {
                if writeln!(&self.term, "{}", msg.as_ref()).is_err() {
                    eprintln!("{}", msg.as_ref());
                }
            }
        }
    }

    pub fn handle_event(&self, event: &LoopEvent) {
        match self.mode {
            UiMode::Json => {
                if let Ok(json) = serde_json::to_string(event) {
                    self.print_line(json);
                }
            }
            UiMode::Minimal => self.handle_minimal(event),
            UiMode::Full => self.handle_full(event),
        }
    }

    fn handle_minimal(&self, event: &LoopEvent) {
        match event {
            LoopEvent::BatchDispatched { story_id, tasks } => {
                self.print_line(format!("dispatch {}: {}", story_id, tasks.join(", ")));
            }
            LoopEvent::TaskFinished {
                task_id,
                status,
                error,
            } => match error {
                Some(error) if *status != UnitStatus::Success => {
                    self.print_line(format!("{} {:?}: {}", task_id, status, error))
                }
                _ => self.print_line(format!("{} {:?}", task_id, status)),
            },
            LoopEvent::ReviewCompleted {
                story_id,
                round,
                verdict,
                findings,
            } => self.print_line(format!(
                "review {} round {}: {} ({} findings)",
                story_id, round, verdict, findings
            )),
            LoopEvent::CheckpointReached {
                checkpoint,
                entity_path,
                ..
            } => self.print_line(format!("checkpoint {} at {}", checkpoint, entity_path)),
            LoopEvent::Aborted { report } => self.print_line(format!("aborted: {}", report)),
            LoopEvent::StoryCompleted { story_id } => {
                self.print_line(format!("story {} done", story_id))
            }
            LoopEvent::FeatureCompleted { feature_id } => {
                self.print_line(format!("feature {} completed", feature_id))
            }
            _ => {}
        }
    }

    fn handle_full(&self, event: &LoopEvent) {
        match event {
            LoopEvent::StateChanged { revision, action } => {
                self.header
                    .set_message(format!("{} {}", style(format!("r{}", revision)).dim(), action));
                if self.verbose {
                    self.print_line(format!("  {} {}", style(format!("r{}", revision)).dim(), action));
                }
            }
            LoopEvent::BatchDispatched { story_id, tasks } => {
                self.print_line(format!(
                    "{}Story {}: dispatching {}",
                    FOLDER,
                    style(story_id).yellow(),
                    tasks.join(", ")
                ));
            }
            LoopEvent::TaskStarted { task_id, attempt } => self.on_task_started(task_id, *attempt),
            LoopEvent::TaskFinished {
                task_id,
                status,
                error,
            } => self.on_task_finished(task_id, *status, error.as_deref()),
            LoopEvent::ReviewCompleted {
                story_id,
                round,
                verdict,
                findings,
            } => {
                let verdict = if verdict.is_pass() {
                    style(verdict.to_string()).green()
                } else {
                    style(verdict.to_string()).red()
                };
                self.print_line(format!(
                    "{}Review of {} (round {}): {} with {} finding(s)",
                    REVIEW,
                    style(story_id).yellow(),
                    round,
                    verdict,
                    findings
                ));
            }
            LoopEvent::CheckpointReached {
                checkpoint,
                entity_path,
                ..
            } => {
                self.header
                    .set_message(format!("waiting at {} ({})", checkpoint, entity_path));
            }
            LoopEvent::CheckpointResolved {
                checkpoint,
                decision,
            } => {
                self.print_line(format!(
                    "  {} {}",
                    style(checkpoint.name()).dim(),
                    style(decision).cyan()
                ));
            }
            LoopEvent::StoryCompleted { story_id } => {
                self.print_line(format!("{}Story {} done", CHECK, style(story_id).green()));
            }
            LoopEvent::EpicCompleted { epic_id } => {
                self.print_line(format!(
                    "{}Epic {} completed",
                    CHECK,
                    style(epic_id).green().bold()
                ));
            }
            LoopEvent::FeatureCompleted { feature_id } => {
                self.print_line(format!(
                    "{}Feature {} completed and archived",
                    SPARKLE,
                    style(feature_id).green().bold()
                ));
            }
            LoopEvent::Aborted { report } => {
                self.print_line(format!(
                    "{}{} at {}",
                    BLOCKER,
                    style(format!("Aborted ({})", report.reason)).red().bold(),
                    style(&report.entity_path).yellow()
                ));
                self.print_line(format!("   {}", report.fact));
            }
        }
    }

    fn on_task_started(&self, task_id: &str, attempt: u32) {
        let bar = self.multi.add(ProgressBar::new_spinner());
        if let Ok(task_style) = ProgressStyle::default_spinner().template("  {spinner} {msg}") {
            bar.set_style(task_style);
        }
        let retry = if attempt > 1 {
            format!(" (attempt {})", attempt)
        } else {
            String::new()
        };
        bar.set_message(format!("{}{}{}", RUNNING, style(task_id).cyan(), retry));
        bar.enable_steady_tick(Duration::from_millis(100));
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.insert(task_id.to_string(), bar);
    }

    fn on_task_finished(&self, task_id: &str, status: UnitStatus, error: Option<&str>) {
        let bar = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.remove(task_id)
        };
        if let Some(bar) = bar {
            bar.finish_and_clear();
            self.multi.remove(&bar);
        }
        let line = match status {
            UnitStatus::Success => format!("  {}{}", CHECK, task_id),
            UnitStatus::Failure => format!(
                "  {}{} {}",
                CROSS,
                style(task_id).red(),
                style(error.unwrap_or("failed")).dim()
            ),
            UnitStatus::Skipped => format!(
                "  {}{} {}",
                SKIP,
                style(task_id).dim(),
                style(error.unwrap_or("skipped")).dim()
            ),
            UnitStatus::Cancelled => format!("  {}{} cancelled", SKIP, style(task_id).dim()),
        };
        self.print_line(line);
    }

    /// Describe a pending checkpoint before asking for a decision.
    pub fn print_checkpoint(&self, pending: &PendingCheckpoint) {
        self.print_line("");
        self.print_line(format!(
            "{}{} {}",
            PAUSE,
            style("Checkpoint").bold(),
            style(pending.checkpoint.name()).yellow().bold()
        ));
        self.print_line(format!("   {}", pending.checkpoint.description()));
        self.print_line(format!("   at   {}", style(&pending.entity_path).cyan()));
        self.print_line(format!("   next {}", pending.summary));
    }

    /// Final line for a run.
    pub fn print_outcome(&self, outcome: &RunOutcome) {
        self.header.finish_and_clear();
        if self.mode == UiMode::Json {
            return;
        }
        match outcome {
            RunOutcome::Complete => {
                self.print_line(format!("{}Nothing left to do", SPARKLE));
            }
            RunOutcome::FeatureCompleted { feature_id } => {
                self.print_line(format!(
                    "{}Feature {} complete. Run `stride run` again for the next feature.",
                    SPARKLE, feature_id
                ));
            }
            RunOutcome::Suspended {
                checkpoint,
                entity_path,
            } => {
                self.print_line(format!(
                    "{}Suspended at {} ({}). Record a decision with `stride confirm proceed|defer`.",
                    PAUSE, checkpoint, entity_path
                ));
            }
            RunOutcome::Deferred {
                checkpoint,
                entity_path,
            } => {
                self.print_line(format!(
                    "{}Deferred at {} ({}). Run `stride run` to pick it up again.",
                    PAUSE, checkpoint, entity_path
                ));
            }
            RunOutcome::Aborted(report) => {
                self.print_line(format!(
                    "{}{}. Resolve it, then run `stride resume`.",
                    BLOCKER, report
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ui_mode_parsing_defaults_to_full() {
        assert_eq!("json".parse::<UiMode>().unwrap(), UiMode::Json);
        assert_eq!("Minimal".parse::<UiMode>().unwrap(), UiMode::Minimal);
        assert_eq!("whatever".parse::<UiMode>().unwrap(), UiMode::Full);
    }

    #[test]
    fn test_task_bars_are_released_on_finish() {
        let ui = OrchestratorUI::new(UiMode::Full, false);
        ui.handle_event(&LoopEvent::TaskStarted {
            task_id: "T1".into(),
            attempt: 1,
        });
        assert_eq!(ui.tasks.lock().unwrap().len(), 1);
        ui.handle_event(&LoopEvent::TaskFinished {
            task_id: "T1".into(),
            status: UnitStatus::Success,
            error: None,
        });
        assert!(ui.tasks.lock().unwrap().is_empty());
    }
}
