//! Operator controls: `stride policy`, `confirm`, `resume`, `cancel`,
//! `reopen`, `blocker`.
//!
//! Each is a single transition against the state file. None of them needs
//! the loop to be running; a running loop sees the change on its next read.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;

use super::super::BlockerCommands;
use stride::checkpoint::{CheckpointId, CheckpointPolicy, Granularity, PolicyPreset};
use stride::config::Config;
use stride::orchestrator::control;
use stride::state::{BlockerSeverity, Decision};

/// Build a policy from CLI arguments. Explicit checkpoints or granularity
/// only make sense for `custom`.
pub fn parse_policy(
    preset: &str,
    checkpoints: &[String],
    granularity: Option<&str>,
) -> Result<CheckpointPolicy> {
    let preset: PolicyPreset = preset.parse()?;
    if preset != PolicyPreset::Custom {
        if !checkpoints.is_empty() || granularity.is_some() {
            anyhow::bail!(
                "--checkpoints and --granularity only apply to the custom preset (got '{}')",
                preset
            );
        }
        return Ok(CheckpointPolicy::from_preset(preset));
    }
    let enabled = checkpoints
        .iter()
        .map(|c| c.trim().parse::<CheckpointId>())
        .collect::<Result<Vec<_>>>()?;
    let granularity = granularity
        .map(str::parse::<Granularity>)
        .transpose()?
        .unwrap_or_default();
    Ok(CheckpointPolicy::custom(&enabled, granularity))
}

fn print_policy(policy: &CheckpointPolicy) {
    println!(
        "Policy: {} (granularity {})",
        style(policy.preset).cyan().bold(),
        policy.granularity
    );
    for checkpoint in CheckpointId::ALL {
        let effective = policy.is_enabled(checkpoint);
        let mark = if effective {
            style("on ").green()
        } else if policy.flag(checkpoint) {
            // flagged but overridden by epic granularity
            style("off").yellow()
        } else {
            style("off").dim()
        };
        println!("  {} {:<20} {}", mark, checkpoint.name(), checkpoint.description());
    }
}

pub fn cmd_policy(
    project_dir: &Path,
    preset: Option<&str>,
    checkpoints: &[String],
    granularity: Option<&str>,
) -> Result<()> {
    let config = Config::new(project_dir.to_path_buf(), false)?;
    let store = config.open_store()?;

    println!();
    let Some(preset) = preset else {
        print_policy(&store.get_state()?.policy);
        println!();
        return Ok(());
    };

    let policy = parse_policy(preset, checkpoints, granularity)?;
    let snapshot = control::set_policy(&store, policy).context("Failed to set policy")?;
    print_policy(&snapshot.policy);
    if snapshot.policy.suppresses_all() && snapshot.open_blockers().next().is_some() {
        println!();
        println!(
            "{} every checkpoint is suppressed while blockers are open; the next run will abort",
            style("Warning:").yellow()
        );
    }
    println!();
    Ok(())
}

pub fn cmd_confirm(project_dir: &Path, decision: &str) -> Result<()> {
    let config = Config::new(project_dir.to_path_buf(), false)?;
    let store = config.open_store()?;
    let decision: Decision = decision.parse()?;

    let snapshot = control::confirm(&store, decision)?;
    if let Some(pending) = &snapshot.loop_record.pending {
        println!(
            "Recorded '{}' for {} at {}",
            style(decision).cyan(),
            pending.checkpoint,
            pending.entity_path
        );
    }
    match decision {
        Decision::Proceed => println!("A waiting `stride run` continues now; otherwise run it again."),
        Decision::Defer => println!("The loop stays suspended at this checkpoint."),
    }
    Ok(())
}

pub fn cmd_resume(project_dir: &Path) -> Result<()> {
    let config = Config::new(project_dir.to_path_buf(), false)?;
    let store = config.open_store()?;
    let before = store.get_state()?;
    control::resume(&store)?;
    if let Some(report) = &before.loop_record.abort {
        println!("Cleared abort: {}", report);
        if !report.exhausted_tasks.is_empty() {
            println!(
                "Reset retry counters for {}",
                report.exhausted_tasks.join(", ")
            );
        }
    }
    println!("Run `stride run` to continue.");
    Ok(())
}

pub fn cmd_cancel(project_dir: &Path) -> Result<()> {
    let config = Config::new(project_dir.to_path_buf(), false)?;
    let store = config.open_store()?;
    let snapshot = control::cancel(&store)?;
    if let Some(report) = &snapshot.loop_record.abort {
        println!("{} {}", style("Loop aborted:").yellow(), report);
    }
    Ok(())
}

pub fn cmd_reopen(project_dir: &Path, task: &str, reason: &str) -> Result<()> {
    let config = Config::new(project_dir.to_path_buf(), false)?;
    let store = config.open_store()?;
    let snapshot = control::reopen(&store, task, reason)?;
    let path = snapshot
        .entity_path(task)
        .unwrap_or_else(|| format!("task:{}", task));
    println!("Reopened {}", style(path).cyan());
    Ok(())
}

pub fn cmd_blocker(project_dir: &Path, command: BlockerCommands) -> Result<()> {
    let config = Config::new(project_dir.to_path_buf(), false)?;
    let store = config.open_store()?;

    match command {
        BlockerCommands::Add {
            id,
            description,
            severity,
            entity,
        } => {
            let severity: BlockerSeverity = severity.parse()?;
            let snapshot = control::add_blocker(&store, &id, &description, severity, entity)?;
            println!("Added blocker {}", style(&id).red());
            if snapshot.policy.suppresses_all() {
                println!(
                    "{} every checkpoint is suppressed; the next run will abort until it is resolved",
                    style("Warning:").yellow()
                );
            }
        }
        BlockerCommands::Resolve { id } => {
            control::resolve_blocker(&store, &id)?;
            println!("Resolved blocker {}", style(&id).green());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_named_preset() {
        let policy = parse_policy("balanced", &[], None).unwrap();
        assert_eq!(policy, CheckpointPolicy::from_preset(PolicyPreset::Balanced));
    }

    #[test]
    fn test_parse_custom_preset() {
        let policy = parse_policy(
            "custom",
            &["before_task".to_string(), "before_next_epic".to_string()],
            Some("step"),
        )
        .unwrap();
        assert!(policy.is_enabled(CheckpointId::BeforeTask));
        assert!(policy.is_enabled(CheckpointId::BeforeNextEpic));
        assert!(!policy.is_enabled(CheckpointId::BeforeCommit));
    }

    #[test]
    fn test_checkpoints_rejected_for_named_preset() {
        let err = parse_policy("manual", &["before_task".to_string()], None).unwrap_err();
        assert!(err.to_string().contains("custom"));
    }

    #[test]
    fn test_unknown_checkpoint_rejected() {
        assert!(parse_policy("custom", &["after_lunch".to_string()], None).is_err());
    }
}
