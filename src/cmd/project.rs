//! Project setup commands: `stride init`, `stride import`.

use anyhow::{Context, Result};
use std::path::Path;

use stride::config::Config;
use stride::orchestrator::control;
use stride::state::PlanFile;
use stride::stride_config::StrideToml;

pub fn cmd_init(project_dir: &Path) -> Result<()> {
    let config = Config::new(project_dir.to_path_buf(), false)?;
    let existed = config.is_initialized();
    config.ensure_directories()?;

    if !config.config_file.exists() {
        StrideToml::default().save(&config.config_file)?;
    }

    println!();
    if existed {
        println!(
            "{} already exists at {}",
            stride::config::STRIDE_DIR,
            config.stride_dir.display()
        );
    } else {
        println!(
            "{} Initialized stride in {}",
            console::style("✓").green(),
            config.stride_dir.display()
        );
    }
    println!();
    println!("Next steps:");
    println!("  1. Set [worker] and [review] commands in .stride/stride.toml");
    println!("  2. stride import <plan.json>");
    println!("  3. stride run");
    println!();
    Ok(())
}

pub fn cmd_import(project_dir: &Path, plan_path: &Path) -> Result<()> {
    let config = Config::new(project_dir.to_path_buf(), false)?;
    let store = config.open_store()?;
    let plan_path = config.resolve(plan_path);

    let (plan, hash) = PlanFile::load(&plan_path)?;
    let mut current = store.get_state()?;
    // stride.toml's policy seeds a fresh state; afterwards `stride policy` owns it.
    if current.revision == 0 {
        let policy = config.settings().policy.to_policy();
        if policy != current.policy {
            current = control::set_policy(&store, policy)?;
        }
    }
    let transition = plan.import_transition(&current, &hash);
    let snapshot = store
        .apply(&transition)
        .with_context(|| format!("Failed to import {}", plan_path.display()))?;

    println!();
    println!(
        "Imported {} feature(s) from {} (plan {})",
        plan.features.len(),
        plan_path.display(),
        console::style(&hash).dim()
    );
    for feature in &plan.features {
        let stories: usize = feature.epics.iter().map(|e| e.stories.len()).sum();
        let tasks: usize = feature
            .epics
            .iter()
            .flat_map(|e| e.stories.iter())
            .map(|s| s.tasks.len())
            .sum();
        println!(
            "  {:<12} {} epic(s), {} story(ies), {} task(s)",
            feature.id,
            feature.epics.len(),
            stories,
            tasks
        );
    }
    if let Some(active) = snapshot.active_feature() {
        println!();
        println!("Active feature: {}", console::style(&active.id).cyan());
    }
    println!();
    Ok(())
}
