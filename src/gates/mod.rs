//! Confirmation sources for checkpoint suspensions.
//!
//! The loop persists a [`PendingCheckpoint`] before it asks anyone anything,
//! then waits on a [`ConfirmationSource`]. A source may answer with a
//! [`Decision`] or decline to answer (`None`), in which case the loop stays
//! suspended and returns; the operator can later record a decision with
//! `stride confirm`, which the next run picks up from the persisted state.

use anyhow::Result;
use async_trait::async_trait;
use dialoguer::{Select, theme::ColorfulTheme};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use crate::state::{Decision, PendingCheckpoint, StateStore};
use crate::ui::OrchestratorUI;

#[async_trait]
pub trait ConfirmationSource: Send + Sync {
    async fn wait(&self, pending: &PendingCheckpoint) -> Result<Option<Decision>>;
}

/// Approves every checkpoint (`stride run --yes`).
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

#[async_trait]
impl ConfirmationSource for AutoApprove {
    async fn wait(&self, _pending: &PendingCheckpoint) -> Result<Option<Decision>> {
        Ok(Some(Decision::Proceed))
    }
}

/// Never answers; the loop suspends and exits at the first checkpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct Detached;

#[async_trait]
impl ConfirmationSource for Detached {
    async fn wait(&self, _pending: &PendingCheckpoint) -> Result<Option<Decision>> {
        Ok(None)
    }
}

/// Decisions fed through a channel. A closed channel means "no answer".
pub struct ChannelConfirmations {
    rx: Mutex<mpsc::UnboundedReceiver<Decision>>,
}

impl ChannelConfirmations {
    pub fn new() -> (mpsc::UnboundedSender<Decision>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx: Mutex::new(rx) })
    }

    /// A source preloaded with a fixed script of decisions.
    pub fn scripted(decisions: impl IntoIterator<Item = Decision>) -> Self {
        let (tx, source) = Self::new();
        for decision in decisions {
            let _ = tx.send(decision);
        }
        source
    }
}

#[async_trait]
impl ConfirmationSource for ChannelConfirmations {
    async fn wait(&self, _pending: &PendingCheckpoint) -> Result<Option<Decision>> {
        let mut rx = self.rx.lock().await;
        // A scripted source with no sender left yields what was queued, then None.
        Ok(rx.recv().await)
    }
}

/// Waits for a decision recorded in the state file by another process
/// (`stride confirm`). Gives up when the checkpoint disappears, e.g. because
/// the loop was cancelled.
pub struct StorePoller {
    store: Arc<StateStore>,
    interval: Duration,
}

impl StorePoller {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self {
            store,
            interval: Duration::from_secs(1),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

#[async_trait]
impl ConfirmationSource for StorePoller {
    async fn wait(&self, pending: &PendingCheckpoint) -> Result<Option<Decision>> {
        loop {
            let snapshot = self.store.read_async().await?;
            match &snapshot.loop_record.pending {
                Some(current) if current.id == pending.id => {
                    if let Some(decision) = current.decision {
                        return Ok(Some(decision));
                    }
                }
                _ => return Ok(None),
            }
            debug!(checkpoint = %pending.checkpoint, "waiting for a recorded decision");
            tokio::time::sleep(self.interval).await;
        }
    }
}

/// Interactive terminal prompt.
pub struct InteractivePrompt {
    ui: Arc<OrchestratorUI>,
}

impl InteractivePrompt {
    pub fn new(ui: Arc<OrchestratorUI>) -> Self {
        Self { ui }
    }
}

#[async_trait]
impl ConfirmationSource for InteractivePrompt {
    async fn wait(&self, pending: &PendingCheckpoint) -> Result<Option<Decision>> {
        self.ui.print_checkpoint(pending);
        let prompt = format!("Checkpoint '{}': proceed?", pending.checkpoint);
        let selection = tokio::task::spawn_blocking(move || {
            let options = &["Proceed", "Defer (stop here, resume later)"];
            Select::with_theme(&ColorfulTheme::default())
                .with_prompt(prompt)
                .items(options)
                .default(0)
                .interact_opt()
        })
        .await??;

        Ok(match selection {
            Some(0) => Some(Decision::Proceed),
            Some(_) => Some(Decision::Defer),
            // Esc / q: leave it pending without recording anything.
            None => None,
        })
    }
}
