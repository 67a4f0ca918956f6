//! Configuration view and validation commands: `stride config`.

use anyhow::Result;

use super::super::ConfigCommands;
use stride::config::Config;
use stride::stride_config::StrideToml;

fn print_settings(toml: &StrideToml) {
    println!("[policy]");
    println!("  preset = \"{}\"", toml.policy.preset);
    if let Some(granularity) = toml.policy.granularity {
        println!("  granularity = \"{}\"", granularity);
    }
    if !toml.policy.checkpoints.is_empty() {
        let names: Vec<String> = toml
            .policy
            .checkpoints
            .iter()
            .map(|c| format!("\"{}\"", c))
            .collect();
        println!("  checkpoints = [{}]", names.join(", "));
    }
    println!();
    println!("[retry]");
    println!("  limit = {}", toml.retry.limit);
    println!();
    println!("[dispatch]");
    println!("  max_parallel = {}", toml.dispatch.max_parallel);
    println!("  task_timeout_secs = {}", toml.dispatch.task_timeout_secs);
    println!();
    println!("[worker]");
    println!("  command = {:?}", toml.worker.command);
    println!();
    println!("[review]");
    println!("  command = {:?}", toml.review.command);
    println!("  timeout_secs = {}", toml.review.timeout_secs);
    println!();
    println!("[storage]");
    println!("  backups = {}", toml.storage.backups);
    println!("  history_limit = {}", toml.storage.history_limit);
    println!();
}

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    let config = Config::new(project_dir.to_path_buf(), false)?;
    let config_path = &config.config_file;

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Stride Configuration");
            println!("====================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
                println!();
                print_settings(&StrideToml::load(config_path)?);
            } else {
                println!("No stride.toml found at {}", config_path.display());
                println!();
            }

            println!("Effective values (with env overrides):");
            println!();
            print_settings(config.settings());
            println!(
                "Checkpoints a fresh state starts with: {:?}",
                config
                    .settings()
                    .policy
                    .to_policy()
                    .checkpoints
                    .iter()
                    .filter(|(_, on)| **on)
                    .map(|(c, _)| c.name())
                    .collect::<Vec<_>>()
            );
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let warnings = config.warnings();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("stride.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            config.ensure_directories()?;
            StrideToml::default().save(config_path)?;

            println!("Created stride.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [worker] and [review] commands");
            println!("  - [policy] preset and checkpoints");
            println!("  - [retry] limit and [dispatch] parallelism");
            println!("  - [storage] backups and history archiving");
            println!();
        }
    }

    Ok(())
}
