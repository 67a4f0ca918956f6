use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use stride::config::STRIDE_DIR;
use stride::telemetry::{self, TelemetryOptions};

mod cmd;

#[derive(Parser)]
#[command(name = "stride")]
#[command(
    version,
    about = "Checkpointed orchestrator: drive features through epics, stories and tasks"
)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Emit logs on stderr as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the .stride directory and a default stride.toml
    Init,
    /// Import features from a plan file
    Import {
        /// Path to the plan JSON
        plan: PathBuf,
    },
    /// Show the active feature, loop status and position
    Status {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the transition history
    History {
        /// Show only the last N entries
        #[arg(short = 'n', long)]
        limit: Option<usize>,

        /// Include entries moved to the history archive
        #[arg(long)]
        all: bool,
    },
    /// Show or change the checkpoint policy
    Policy {
        /// manual, balanced, story_autonomous, epic_autonomous or custom
        preset: Option<String>,

        /// Enabled checkpoints for the custom preset (comma-separated)
        #[arg(long, value_delimiter = ',')]
        checkpoints: Vec<String>,

        /// step or epic (custom preset only)
        #[arg(long)]
        granularity: Option<String>,
    },
    /// Run the orchestration loop until it completes, suspends or aborts
    Run {
        /// Approve every checkpoint
        #[arg(long)]
        yes: bool,

        /// Suspend at the first checkpoint instead of waiting for a decision
        #[arg(long, conflicts_with = "yes")]
        no_wait: bool,

        /// Maximum concurrent tasks. Overrides stride.toml.
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Failed attempts allowed per task. Overrides stride.toml.
        #[arg(long)]
        retry_limit: Option<u32>,

        /// UI output mode: full, minimal, json
        #[arg(long, default_value = "full")]
        ui: String,
    },
    /// Record a decision on the pending checkpoint
    Confirm {
        /// proceed or defer
        decision: String,
    },
    /// Clear an abort and reset exhausted retry counters
    Resume,
    /// Abort the loop with reason "cancelled"
    Cancel,
    /// Reopen a completed task
    Reopen {
        task: String,

        /// Why the task is being reopened (recorded in history)
        #[arg(long)]
        reason: String,
    },
    /// Manage blockers
    Blocker {
        #[command(subcommand)]
        command: BlockerCommands,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// List or restore backups of the state file
    Backup {
        #[command(subcommand)]
        command: BackupCommands,
    },
    /// Move old history entries to the archive file
    Compact {
        /// History entries to keep in the state file. Defaults to half of
        /// storage.history_limit.
        #[arg(long)]
        keep: Option<usize>,
    },
    /// Upgrade the state file to the current format
    Migrate,
}

#[derive(Subcommand, Clone)]
pub enum BackupCommands {
    /// Show the kept backups, newest first
    List,
    /// Replace the current state with a backup
    Restore {
        /// Backup slot; 1 is the most recent
        slot: usize,
    },
}

#[derive(Subcommand, Clone)]
pub enum BlockerCommands {
    /// Record an unresolved blocker
    Add {
        id: String,
        description: String,

        /// low, medium, high or critical
        #[arg(long, default_value = "medium")]
        severity: String,

        /// Entity id (feature, epic, story or task) the blocker applies to
        #[arg(long)]
        entity: Option<String>,
    },
    /// Mark a blocker resolved
    Resolve { id: String },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default stride.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let log_dir = project_dir.join(STRIDE_DIR).join("logs");
    let log_guard = telemetry::init(
        Some(&log_dir),
        TelemetryOptions {
            verbose: cli.verbose,
            json: cli.log_json,
        },
    );

    let mut exit_code = 0;
    match &cli.command {
        Commands::Init => cmd::cmd_init(&project_dir)?,
        Commands::Import { plan } => cmd::cmd_import(&project_dir, plan)?,
        Commands::Status { json } => cmd::cmd_status(&project_dir, *json)?,
        Commands::History { limit, all } => cmd::cmd_history(&project_dir, *limit, *all)?,
        Commands::Policy {
            preset,
            checkpoints,
            granularity,
        } => cmd::cmd_policy(
            &project_dir,
            preset.as_deref(),
            checkpoints,
            granularity.as_deref(),
        )?,
        Commands::Run {
            yes,
            no_wait,
            max_parallel,
            retry_limit,
            ui,
        } => {
            let options = cmd::RunOptions {
                yes: *yes,
                no_wait: *no_wait,
                max_parallel: *max_parallel,
                retry_limit: *retry_limit,
                ui: ui.parse().unwrap_or_default(),
                verbose: cli.verbose,
            };
            exit_code = cmd::cmd_run(&project_dir, options).await?;
        }
        Commands::Confirm { decision } => cmd::cmd_confirm(&project_dir, decision)?,
        Commands::Resume => cmd::cmd_resume(&project_dir)?,
        Commands::Cancel => cmd::cmd_cancel(&project_dir)?,
        Commands::Reopen { task, reason } => cmd::cmd_reopen(&project_dir, task, reason)?,
        Commands::Blocker { command } => cmd::cmd_blocker(&project_dir, command.clone())?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
        Commands::Backup { command } => cmd::cmd_backup(&project_dir, command.clone())?,
        Commands::Compact { keep } => cmd::cmd_compact(&project_dir, *keep)?,
        Commands::Migrate => cmd::cmd_migrate(&project_dir)?,
    }

    // Flush the log file before a non-zero exit skips destructors.
    drop(log_guard);
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}
