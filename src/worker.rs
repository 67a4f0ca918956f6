//! Workers execute a single task. The loop never looks inside them: a worker
//! gets a [`TaskDescriptor`], and either returns opaque output (success) or an
//! error (failure).

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

use crate::state::{Snapshot, Task, TaskOrigin};
use crate::util::run_piped;

/// Everything a worker is told about a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub task_id: String,
    pub story_id: String,
    pub entity_path: String,
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// 1-based attempt number for this dispatch.
    pub attempt: u32,
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default)]
    pub origin: TaskOrigin,
}

impl TaskDescriptor {
    pub fn from_task(snapshot: &Snapshot, task: &Task) -> Self {
        let scope = snapshot
            .find_story(&task.story_id)
            .map(|s| s.scope.clone())
            .unwrap_or_default();
        Self {
            task_id: task.id.clone(),
            story_id: task.story_id.clone(),
            entity_path: snapshot
                .entity_path(&task.id)
                .unwrap_or_else(|| format!("task:{}", task.id)),
            description: task.description.clone(),
            depends_on: task.depends_on.clone(),
            attempt: task.attempts + 1,
            scope,
            origin: task.origin.clone(),
        }
    }
}

#[async_trait]
pub trait Worker: Send + Sync {
    /// Run one task to completion. `Ok` carries the worker's output.
    async fn execute(&self, task: &TaskDescriptor) -> Result<String>;
}

/// Runs an external command per task.
///
/// The descriptor is written to stdin as JSON and `STRIDE_TASK_ID` /
/// `STRIDE_STORY_ID` are set in the environment. Exit code 0 is success.
#[derive(Debug, Clone)]
pub struct CommandWorker {
    command: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandWorker {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }
}

#[async_trait]
impl Worker for CommandWorker {
    async fn execute(&self, task: &TaskDescriptor) -> Result<String> {
        let input = serde_json::to_string(task)?;
        debug!(task = %task.task_id, command = ?self.command, "spawning worker");
        let output = run_piped(
            &self.command,
            &input,
            &[
                ("STRIDE_TASK_ID", task.task_id.as_str()),
                ("STRIDE_STORY_ID", task.story_id.as_str()),
            ],
            self.working_dir.as_deref(),
        )
        .await?;
        if !output.success() {
            bail!("{}", output.error_summary());
        }
        Ok(output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> TaskDescriptor {
        TaskDescriptor {
            task_id: "T1".into(),
            story_id: "S1".into(),
            entity_path: "feature:F1/epic:E1/story:S1/task:T1".into(),
            description: "write the parser".into(),
            depends_on: vec![],
            attempt: 1,
            scope: vec![],
            origin: TaskOrigin::Planned,
        }
    }

    fn sh(script: &str) -> CommandWorker {
        CommandWorker::new(vec!["sh".into(), "-c".into(), script.into()])
    }

    #[tokio::test]
    async fn test_command_worker_success_returns_stdout() {
        let worker = sh("printf 'done %s' \"$STRIDE_TASK_ID\"");
        let out = worker.execute(&descriptor()).await.unwrap();
        assert_eq!(out, "done T1");
    }

    #[tokio::test]
    async fn test_command_worker_receives_descriptor_on_stdin() {
        let worker = sh("cat");
        let out = worker.execute(&descriptor()).await.unwrap();
        let parsed: TaskDescriptor = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed, descriptor());
    }

    #[tokio::test]
    async fn test_command_worker_failure_uses_stderr() {
        let worker = sh("echo 'tests failed' >&2; exit 1");
        let err = worker.execute(&descriptor()).await.unwrap_err();
        assert_eq!(err.to_string(), "tests failed");
    }
}
