//! State file upkeep: `stride backup`, `stride compact`, `stride migrate`.
//!
//! A restore is refused while a loop holds the writer lease. Compaction and
//! migration take the same lock as every other write.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;

use super::super::BackupCommands;
use stride::config::Config;
use stride::state::STATE_VERSION;
use stride::state::store::DEFAULT_HISTORY_LIMIT;

pub fn cmd_backup(project_dir: &Path, command: BackupCommands) -> Result<()> {
    let config = Config::new(project_dir.to_path_buf(), false)?;
    let store = config.open_store()?;

    match command {
        BackupCommands::List => {
            let backups = store.list_backups();
            println!();
            if backups.is_empty() {
                println!("No backups yet. One is kept each time the state changes.");
                println!();
                return Ok(());
            }
            for backup in backups {
                println!(
                    "  {:>2}  revision {:<6} {}",
                    backup.slot,
                    backup
                        .revision
                        .map(|r| r.to_string())
                        .unwrap_or_else(|| "?".into()),
                    style(
                        backup
                            .modified
                            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                            .unwrap_or_default()
                    )
                    .dim()
                );
            }
            println!();
        }
        BackupCommands::Restore { slot } => {
            let before = store.get_state()?.revision;
            let restored = store
                .restore_backup(slot)
                .with_context(|| format!("Failed to restore backup {}", slot))?;
            println!(
                "{} state restored from backup {} (revision {} → {}).",
                style("✓").green(),
                slot,
                before,
                restored.revision
            );
            println!("  the replaced state is now backup 1");
        }
    }
    Ok(())
}

pub fn cmd_compact(project_dir: &Path, keep: Option<usize>) -> Result<()> {
    let config = Config::new(project_dir.to_path_buf(), false)?;
    let store = config.open_store()?;
    let limit = match config.settings().storage.history_limit {
        0 => DEFAULT_HISTORY_LIMIT,
        n => n,
    };
    let keep = keep.unwrap_or(limit / 2);

    let report = store.compact_history(keep)?;
    if report.archived == 0 {
        println!("Nothing to compact; {} entries in history.", report.kept);
    } else {
        println!(
            "{} archived {} entries to {}; {} kept.",
            style("✓").green(),
            report.archived,
            report.archive_path.display(),
            report.kept
        );
    }
    Ok(())
}

pub fn cmd_migrate(project_dir: &Path) -> Result<()> {
    let config = Config::new(project_dir.to_path_buf(), false)?;
    let store = config.open_store()?;

    match store.migrate()? {
        Some(from) => println!(
            "{} state file upgraded from version {} to {}.",
            style("✓").green(),
            from,
            STATE_VERSION
        ),
        None => println!("State file is already at version {}.", STATE_VERSION),
    }
    Ok(())
}
