//! Read-only inspection: `stride status`, `stride history`.

use anyhow::Result;
use console::style;
use serde_json::json;
use std::path::Path;

use stride::config::Config;
use stride::state::{EpicStatus, Op, Snapshot, StoryStatus};

fn status_json(snapshot: &Snapshot) -> serde_json::Value {
    let active = snapshot.active_feature().map(|feature| {
        json!({
            "id": feature.id,
            "description": feature.description,
            "status": feature.status,
            "epics": feature.epics.iter().map(|epic| json!({
                "id": epic.id,
                "status": epic.status,
                "stories": epic.stories.iter().map(|story| json!({
                    "id": story.id,
                    "status": story.status,
                    "tasks_done": story.tasks.iter().filter(|t| t.done).count(),
                    "tasks_total": story.tasks.len(),
                    "review_round": story.review_round,
                })).collect::<Vec<_>>(),
            })).collect::<Vec<_>>(),
        })
    });
    json!({
        "revision": snapshot.revision,
        "archived_history": snapshot.archive.entries,
        "loop_status": snapshot.loop_record.status,
        "policy": snapshot.policy,
        "effective_checkpoints": snapshot.effective_checkpoints(),
        "position": snapshot.position,
        "active_feature": active,
        "pending_checkpoint": snapshot.loop_record.pending,
        "abort": snapshot.loop_record.abort,
        "open_blockers": snapshot.open_blockers().collect::<Vec<_>>(),
        "archived_features": snapshot
            .features
            .iter()
            .filter(|f| f.is_archived())
            .map(|f| f.id.as_str())
            .collect::<Vec<_>>(),
    })
}

pub fn cmd_status(project_dir: &Path, as_json: bool) -> Result<()> {
    let config = Config::new(project_dir.to_path_buf(), false)?;
    let store = config.open_store()?;
    let snapshot = store.get_state()?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&status_json(&snapshot))?);
        return Ok(());
    }

    println!();
    println!("{}", style("Stride Status").bold().cyan());
    println!("─────────────");
    println!(
        "Revision: {}   Loop: {}   Policy: {} ({})",
        snapshot.revision,
        serde_json::to_value(snapshot.loop_record.status)?
            .as_str()
            .unwrap_or("unknown"),
        snapshot.policy.preset,
        snapshot.policy.granularity
    );
    let enabled: Vec<&str> = snapshot
        .effective_checkpoints()
        .iter()
        .map(|c| c.name())
        .collect();
    println!(
        "Checkpoints: {}",
        if enabled.is_empty() {
            "none".to_string()
        } else {
            enabled.join(", ")
        }
    );
    println!();

    let Some(feature) = snapshot.active_feature() else {
        println!("No active feature. Import a plan with `stride import <plan.json>`.");
        println!();
        return Ok(());
    };

    println!(
        "Feature {}: {}",
        style(&feature.id).bold(),
        feature.description
    );
    for epic in &feature.epics {
        let marker = match epic.status {
            EpicStatus::Completed => style("✓").green(),
            EpicStatus::InProgress => style("▶").yellow(),
            EpicStatus::Pending => style("·").dim(),
        };
        let here = snapshot.position.epic_id.as_deref() == Some(epic.id.as_str());
        println!(
            "  {} {} {}{}",
            marker,
            epic.id,
            epic.title,
            if here { style(" ◀").cyan().to_string() } else { String::new() }
        );
        for story in &epic.stories {
            let done = story.tasks.iter().filter(|t| t.done).count();
            let status = match story.status {
                StoryStatus::Done => style(story.status.to_string()).green(),
                StoryStatus::WaitingReview => style(story.status.to_string()).yellow(),
                StoryStatus::InProgress if story.has_progress() => {
                    style(story.status.to_string()).yellow()
                }
                StoryStatus::InProgress => style(story.status.to_string()).dim(),
            };
            let here = snapshot.position.story_id.as_deref() == Some(story.id.as_str());
            println!(
                "      {:<10} {:<16} {}/{} tasks{}",
                story.id,
                status,
                done,
                story.tasks.len(),
                if here { style(" ◀").cyan().to_string() } else { String::new() }
            );
            for task in story.tasks.iter().filter(|t| !t.done && t.last_status.is_some()) {
                println!(
                    "          {} attempts={} {}",
                    style(&task.id).red(),
                    task.attempts,
                    style(task.last_error.as_deref().unwrap_or("")).dim()
                );
            }
        }
    }
    println!();

    if let Some(pending) = &snapshot.loop_record.pending {
        println!(
            "{} {} at {}",
            style("Pending checkpoint:").yellow().bold(),
            pending.checkpoint,
            pending.entity_path
        );
        println!("  next: {}", pending.summary);
        match pending.decision {
            Some(decision) => println!("  decision recorded: {}", decision),
            None => println!("  record a decision with `stride confirm proceed|defer`"),
        }
        println!();
    }
    if let Some(report) = &snapshot.loop_record.abort {
        println!("{} {}", style("Aborted:").red().bold(), report);
        println!("  resolve the cause, then `stride resume`");
        println!();
    }
    let blockers: Vec<_> = snapshot.open_blockers().collect();
    if !blockers.is_empty() {
        println!("{}", style("Open blockers:").red());
        for blocker in blockers {
            println!(
                "  {} [{:?}] {}{}",
                blocker.id,
                blocker.severity,
                blocker.description,
                blocker
                    .entity
                    .as_deref()
                    .map(|e| format!(" ({})", e))
                    .unwrap_or_default()
            );
        }
        println!();
    }
    Ok(())
}

pub fn cmd_history(project_dir: &Path, limit: Option<usize>, all: bool) -> Result<()> {
    let config = Config::new(project_dir.to_path_buf(), false)?;
    let store = config.open_store()?;
    let snapshot = store.get_state()?;

    let mut entries = if all {
        store.archived_history()?
    } else {
        Vec::new()
    };
    entries.extend(snapshot.history.iter().cloned());
    let skip = limit
        .map(|n| entries.len().saturating_sub(n))
        .unwrap_or(0);

    println!();
    if entries.is_empty() {
        println!("No transitions recorded yet.");
        println!();
        return Ok(());
    }
    if !all && skip == 0 && snapshot.archive.entries > 0 {
        println!(
            "{}",
            style(format!(
                "{} earlier entries archived; `stride history --all` includes them",
                snapshot.archive.entries
            ))
            .dim()
        );
    }
    for entry in entries.iter().skip(skip) {
        let ops: Vec<&str> = entry
            .delta
            .iter()
            .filter(|op| !matches!(op, Op::ExpectLive))
            .map(|op| op.name())
            .collect();
        println!(
            "{:>5}  {}  {}",
            entry.seq,
            style(entry.timestamp.format("%Y-%m-%d %H:%M:%S")).dim(),
            entry.action
        );
        if config.verbose || ops.len() > 1 {
            println!("       {}", style(ops.join(", ")).dim());
        }
    }
    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stride::state::{Op, PlanFile, StateStore, Transition};

    #[test]
    fn test_status_json_reports_active_feature_and_position() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path().join("state.json")).unwrap();
        let plan = PlanFile::parse(
            r#"{"features":[{"id":"F1","description":"d","epics":[
                {"id":"E1","title":"e","stories":[
                    {"id":"S1","title":"s","tasks":[{"id":"T1","description":"t"}]}]}]}]}"#,
        )
        .unwrap();
        let current = store.get_state().unwrap();
        store.apply(&plan.import_transition(&current, "abc")).unwrap();
        store
            .apply(&Transition::new("enter").op(Op::SetPosition {
                epic_id: Some("E1".into()),
                story_id: Some("S1".into()),
            }))
            .unwrap();

        let value = status_json(&store.get_state().unwrap());
        assert_eq!(value["active_feature"]["id"], "F1");
        assert_eq!(value["position"]["story_id"], "S1");
        assert_eq!(value["active_feature"]["epics"][0]["stories"][0]["tasks_total"], 1);
        assert_eq!(value["loop_status"], "idle");
    }
}
