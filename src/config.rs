use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::state::StateStore;
use crate::stride_config::{CONFIG_FILE_NAME, StrideToml};

pub const STRIDE_DIR: &str = ".stride";

/// Runtime configuration for stride.
///
/// Resolves every path under the project's `.stride/` directory and carries
/// the layered [`StrideToml`] settings (file, then environment).
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub stride_dir: PathBuf,
    pub state_file: PathBuf,
    pub log_dir: PathBuf,
    pub config_file: PathBuf,
    pub verbose: bool,
    settings: StrideToml,
    /// Problems found while overlaying the environment.
    env_warnings: Vec<String>,
}

impl Config {
    pub fn new(project_dir: PathBuf, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let stride_dir = project_dir.join(STRIDE_DIR);
        let mut settings = StrideToml::load_or_default(&stride_dir)?;
        let env_warnings = settings.apply_env();

        Ok(Self {
            state_file: stride_dir.join("state.json"),
            log_dir: stride_dir.join("logs"),
            config_file: stride_dir.join(CONFIG_FILE_NAME),
            stride_dir,
            project_dir,
            verbose,
            settings,
            env_warnings,
        })
    }

    pub fn settings(&self) -> &StrideToml {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut StrideToml {
        &mut self.settings
    }

    /// Warnings from the environment overlay plus [`StrideToml::validate`].
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = self.env_warnings.clone();
        warnings.extend(self.settings.validate());
        warnings
    }

    pub fn is_initialized(&self) -> bool {
        self.stride_dir.is_dir()
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.stride_dir)
            .context("Failed to create .stride directory")?;
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        Ok(())
    }

    /// Open the state store, failing with a hint when `stride init` was never run.
    pub fn open_store(&self) -> Result<StateStore> {
        if !self.is_initialized() {
            anyhow::bail!(
                "No {} directory in {}. Run `stride init` first.",
                STRIDE_DIR,
                self.project_dir.display()
            );
        }
        let storage = &self.settings.storage;
        let store = StateStore::open(&self.state_file).with_context(|| {
            format!("Failed to open state store at {}", self.state_file.display())
        })?;
        Ok(store
            .with_backups(storage.backups)
            .with_history_limit(Some(storage.history_limit)))
    }

    /// Resolve `path` relative to the project directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }
}
