//! Project configuration read from `.stride/stride.toml`.
//!
//! Layering is file → environment → CLI flags. Every field has a default, so
//! a missing file or a missing section is never an error.
//!
//! # Configuration File Format
//!
//! ```toml
//! [policy]
//! preset = "balanced"            # manual | balanced | story_autonomous | epic_autonomous | custom
//! granularity = "step"           # step | epic (custom only; other presets imply it)
//! checkpoints = ["before_task"]  # custom only
//!
//! [retry]
//! limit = 3
//!
//! [dispatch]
//! max_parallel = 4
//! task_timeout_secs = 900
//!
//! [worker]
//! command = ["./scripts/run-task.sh"]
//!
//! [review]
//! command = ["./scripts/review.sh"]
//! timeout_secs = 600
//!
//! [storage]
//! backups = 3            # previous state.json revisions kept; 0 disables
//! history_limit = 1000   # history entries before the oldest are archived; 0 disables
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::checkpoint::{CheckpointId, CheckpointPolicy, Granularity, PolicyPreset};
use crate::dag::{DEFAULT_MAX_PARALLEL, DEFAULT_TASK_TIMEOUT_SECS};
use crate::orchestrator::DEFAULT_RETRY_LIMIT;
use crate::review::gate::DEFAULT_REVIEW_TIMEOUT_SECS;
use crate::state::archive::DEFAULT_BACKUPS;
use crate::state::store::DEFAULT_HISTORY_LIMIT;

pub const CONFIG_FILE_NAME: &str = "stride.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicySection {
    #[serde(default)]
    pub preset: PolicyPreset,
    /// Only meaningful for `custom`; other presets imply their granularity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granularity: Option<Granularity>,
    /// Enabled checkpoints for `custom`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checkpoints: Vec<CheckpointId>,
}

impl PolicySection {
    pub fn to_policy(&self) -> CheckpointPolicy {
        match self.preset {
            PolicyPreset::Custom => {
                CheckpointPolicy::custom(&self.checkpoints, self.granularity.unwrap_or_default())
            }
            preset => CheckpointPolicy::from_preset(preset),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySection {
    /// Failed attempts allowed per task before the loop aborts.
    #[serde(default = "default_retry_limit")]
    pub limit: u32,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            limit: default_retry_limit(),
        }
    }
}

fn default_retry_limit() -> u32 {
    DEFAULT_RETRY_LIMIT
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchSection {
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            task_timeout_secs: default_task_timeout_secs(),
        }
    }
}

fn default_max_parallel() -> usize {
    DEFAULT_MAX_PARALLEL
}

fn default_task_timeout_secs() -> u64 {
    DEFAULT_TASK_TIMEOUT_SECS
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerSection {
    /// argv of the worker process; the task descriptor arrives on stdin.
    #[serde(default)]
    pub command: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewSection {
    /// argv of the reviewer process; the review request arrives on stdin.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default = "default_review_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ReviewSection {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: default_review_timeout_secs(),
        }
    }
}

fn default_review_timeout_secs() -> u64 {
    DEFAULT_REVIEW_TIMEOUT_SECS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_backups")]
    pub backups: usize,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            backups: default_backups(),
            history_limit: default_history_limit(),
        }
    }
}

fn default_backups() -> usize {
    DEFAULT_BACKUPS
}

fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}

/// The complete stride.toml structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrideToml {
    #[serde(default)]
    pub policy: PolicySection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub dispatch: DispatchSection,
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub review: ReviewSection,
    #[serde(default)]
    pub storage: StorageSection,
}

impl StrideToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse stride.toml")
    }

    /// Load `.stride/stride.toml`, or the defaults when it does not exist.
    pub fn load_or_default(stride_dir: &Path) -> Result<Self> {
        let path = stride_dir.join(CONFIG_FILE_NAME);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize stride.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Overlay `STRIDE_*` environment variables. Unparseable values are
    /// reported and ignored.
    pub fn apply_env(&mut self) -> Vec<String> {
        let mut warnings = Vec::new();
        if let Some(limit) = env_parse::<u32>("STRIDE_RETRY_LIMIT", &mut warnings) {
            self.retry.limit = limit;
        }
        if let Some(max) = env_parse::<usize>("STRIDE_MAX_PARALLEL", &mut warnings) {
            self.dispatch.max_parallel = max;
        }
        if let Some(secs) = env_parse::<u64>("STRIDE_TASK_TIMEOUT_SECS", &mut warnings) {
            self.dispatch.task_timeout_secs = secs;
        }
        if let Ok(cmd) = std::env::var("STRIDE_WORKER_CMD") {
            self.worker.command = split_command(&cmd);
        }
        if let Ok(cmd) = std::env::var("STRIDE_REVIEW_CMD") {
            self.review.command = split_command(&cmd);
        }
        warnings
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.retry.limit == 0 {
            warnings.push("retry.limit is 0; it will be treated as 1".to_string());
        }
        if self.dispatch.max_parallel == 0 {
            warnings.push("dispatch.max_parallel is 0; it will be treated as 1".to_string());
        }
        if self.dispatch.task_timeout_secs == 0 {
            warnings.push(
                "dispatch.task_timeout_secs is 0; every task will time out immediately"
                    .to_string(),
            );
        }
        if self.worker.command.is_empty() {
            warnings.push(
                "worker.command is not set; `stride run` needs a worker (or STRIDE_WORKER_CMD)"
                    .to_string(),
            );
        }
        if self.review.command.is_empty() {
            warnings.push(
                "review.command is not set; `stride run` needs a reviewer (or STRIDE_REVIEW_CMD)"
                    .to_string(),
            );
        }

        if self.storage.backups == 0 {
            warnings.push(
                "storage.backups is 0; `stride backup restore` will have nothing to restore"
                    .to_string(),
            );
        }

        if self.policy.preset != PolicyPreset::Custom {
            if !self.policy.checkpoints.is_empty() {
                warnings.push(format!(
                    "policy.checkpoints is ignored for preset '{}'",
                    self.policy.preset
                ));
            }
            if let (Some(configured), Some(implied)) =
                (self.policy.granularity, self.policy.preset.granularity())
                && configured != implied
            {
                warnings.push(format!(
                    "policy.granularity '{}' is ignored; preset '{}' implies '{}'",
                    configured, self.policy.preset, implied
                ));
            }
        } else if self.policy.to_policy().suppresses_all() {
            warnings.push(
                "custom policy suppresses every checkpoint; any open blocker will abort the loop"
                    .to_string(),
            );
        }

        warnings
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, warnings: &mut Vec<String>) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warnings.push(format!("Ignoring {}='{}': not a valid number", name, raw));
            None
        }
    }
}

fn split_command(cmd: &str) -> Vec<String> {
    cmd.split_whitespace().map(String::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_empty_file_uses_defaults() {
        let toml = StrideToml::parse("").unwrap();
        assert_eq!(toml, StrideToml::default());
        assert_eq!(toml.retry.limit, 3);
        assert_eq!(toml.dispatch.max_parallel, 4);
        assert_eq!(toml.policy.to_policy(), CheckpointPolicy::default());
    }

    #[test]
    fn test_custom_policy_section() {
        let toml = StrideToml::parse(
            r#"
[policy]
preset = "custom"
granularity = "epic"
checkpoints = ["before_task", "before_next_epic"]
"#,
        )
        .unwrap();
        let policy = toml.policy.to_policy();
        assert_eq!(policy.preset, PolicyPreset::Custom);
        assert!(policy.flag(CheckpointId::BeforeTask));
        // epic granularity hides within-story checkpoints
        assert!(!policy.is_enabled(CheckpointId::BeforeTask));
        assert!(policy.is_enabled(CheckpointId::BeforeNextEpic));
    }

    #[test]
    fn test_unknown_checkpoint_is_a_parse_error() {
        let err = StrideToml::parse(
            r#"
[policy]
preset = "custom"
checkpoints = ["after_lunch"]
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("stride.toml"));
    }

    #[test]
    fn test_env_overrides_file() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let mut toml = StrideToml::parse("[retry]\nlimit = 5\n").unwrap();
        unsafe {
            std::env::set_var("STRIDE_RETRY_LIMIT", "2");
            std::env::set_var("STRIDE_MAX_PARALLEL", "lots");
            std::env::set_var("STRIDE_WORKER_CMD", "sh -c true");
        }
        let warnings = toml.apply_env();
        unsafe {
            std::env::remove_var("STRIDE_RETRY_LIMIT");
            std::env::remove_var("STRIDE_MAX_PARALLEL");
            std::env::remove_var("STRIDE_WORKER_CMD");
        }
        assert_eq!(toml.retry.limit, 2);
        assert_eq!(toml.dispatch.max_parallel, 4);
        assert_eq!(toml.worker.command, vec!["sh", "-c", "true"]);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("STRIDE_MAX_PARALLEL"));
    }

    #[test]
    fn test_validate_reports_ignored_settings() {
        let toml = StrideToml::parse(
            r#"
[policy]
preset = "balanced"
granularity = "epic"
checkpoints = ["before_task"]

[worker]
command = ["run"]

[review]
command = ["review"]
"#,
        )
        .unwrap();
        let warnings = toml.validate();
        assert_eq!(warnings.len(), 2);
        assert!(warnings.iter().any(|w| w.contains("checkpoints is ignored")));
        assert!(warnings.iter().any(|w| w.contains("granularity 'epic' is ignored")));
    }

    #[test]
    fn test_storage_section() {
        let toml = StrideToml::parse("[storage]\nhistory_limit = 0\n").unwrap();
        assert_eq!(toml.storage.backups, 3);
        assert_eq!(toml.storage.history_limit, 0);

        let toml = StrideToml::parse(
            "[storage]\nbackups = 0\n[worker]\ncommand = [\"w\"]\n[review]\ncommand = [\"r\"]\n",
        )
        .unwrap();
        let warnings = toml.validate();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("storage.backups"));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let mut toml = StrideToml::default();
        toml.worker.command = vec!["./run.sh".into()];
        toml.save(&dir.path().join(CONFIG_FILE_NAME)).unwrap();
        let loaded = StrideToml::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded, toml);
    }
}
