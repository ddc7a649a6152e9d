//! Registry configuration
//!
//! Loaded from YAML, then overridden from `CALREG_*` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cleanup::CleanupPolicy;
use crate::locks::LockPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSettings {
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_acquire_timeout_secs() -> u64 {
    30
}

fn default_max_age_secs() -> u64 {
    4 * 60 * 60
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_serial_width() -> usize {
    4
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            acquire_timeout_secs: default_acquire_timeout_secs(),
            max_age_secs: default_max_age_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl LockSettings {
    pub fn policy(&self) -> LockPolicy {
        LockPolicy {
            acquire_timeout: Duration::from_secs(self.acquire_timeout_secs),
            max_age: Duration::from_secs(self.max_age_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub project: String,
    /// Canonical storage root (`rules/` and `references/` live below it).
    pub storage_root: PathBuf,
    pub catalog_dir: PathBuf,
    pub delivery_dirs: Vec<PathBuf>,
    #[serde(default = "default_serial_width")]
    pub serial_width: usize,
    #[serde(default)]
    pub locks: LockSettings,
    #[serde(default)]
    pub cleanup: CleanupPolicy,
}

impl RegistryConfig {
    /// Config rooted at one directory, for tests and first runs.
    pub fn rooted_at(project: &str, root: &Path) -> Self {
        Self {
            project: project.to_string(),
            storage_root: root.join("storage"),
            catalog_dir: root.join("catalogs"),
            delivery_dirs: vec![root.join("deliveries")],
            serial_width: default_serial_width(),
            locks: LockSettings::default(),
            cleanup: CleanupPolicy::default(),
        }
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse registry config")
    }

    /// Load from `path`, apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading registry configuration from {}", path.display());
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `CALREG_*` variables, read through `lookup`.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(project) = lookup("CALREG_PROJECT") {
            self.project = project;
        }
        if let Some(root) = lookup("CALREG_STORAGE_ROOT") {
            self.storage_root = PathBuf::from(root);
        }
        if let Some(dir) = lookup("CALREG_CATALOG_DIR") {
            self.catalog_dir = PathBuf::from(dir);
        }
        if let Some(dirs) = lookup("CALREG_DELIVERY_DIRS") {
            self.delivery_dirs = dirs
                .split(',')
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(PathBuf::from)
                .collect();
        }
        if let Some(secs) = lookup("CALREG_LOCK_TIMEOUT_SECS") {
            self.locks.acquire_timeout_secs = secs
                .parse()
                .with_context(|| format!("CALREG_LOCK_TIMEOUT_SECS is not a number: {secs}"))?;
        }
        if let Some(secs) = lookup("CALREG_LOCK_MAX_AGE_SECS") {
            self.locks.max_age_secs = secs
                .parse()
                .with_context(|| format!("CALREG_LOCK_MAX_AGE_SECS is not a number: {secs}"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.project.is_empty() {
            bail!("project must not be empty");
        }
        // Underscores separate name fields, so they cannot appear in the project.
        if !self.project.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(anyhow!(
                "project '{}' must contain only letters, digits and '-'",
                self.project
            ));
        }
        if self.serial_width == 0 {
            bail!("serial_width must be at least 1");
        }
        if self.delivery_dirs.is_empty() {
            bail!("at least one delivery directory is required");
        }
        if self.locks.poll_interval_ms == 0 {
            bail!("locks.poll_interval_ms must be at least 1");
        }
        Ok(())
    }
}
