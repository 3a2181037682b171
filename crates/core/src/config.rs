//! Per-root configuration.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ViewError};

/// Name of the optional JSON config file at the watched root.
pub const CONFIG_FILE_NAME: &str = ".livetreeconfig";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewConfig {
    /// Minimum age of a tombstone before age-out may purge it.
    pub gc_age_seconds: u64,

    /// How often the reconciler runs age-out; 0 disables it.
    pub gc_interval_seconds: u64,

    /// How long the reconciler waits for work before re-checking state.
    pub settle_ms: u64,

    /// How long the notification thread blocks on the source per poll.
    pub notify_poll_ms: u64,

    /// Root-relative directories excluded from the view entirely.
    pub ignore_dirs: Vec<String>,

    /// Root-relative directories tracked as entries but never crawled.
    pub ignore_vcs: Vec<String>,

    pub cookie_prefix: String,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            gc_age_seconds: 12 * 60 * 60,
            gc_interval_seconds: 24 * 60 * 60,
            settle_ms: 20,
            notify_poll_ms: 500,
            ignore_dirs: Vec::new(),
            ignore_vcs: vec![".git".to_string(), ".hg".to_string(), ".svn".to_string()],
            cookie_prefix: ".livetree-cookie-".to_string(),
        }
    }
}

impl ViewConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `<root>/.livetreeconfig`, falling back to defaults when absent.
    pub fn load_for_root(root: &Path) -> Result<Self> {
        let path = root.join(CONFIG_FILE_NAME);
        match Self::load(&path) {
            Err(ViewError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                Ok(Self::default())
            }
            other => other,
        }
    }

    pub fn validate(&self) -> Result<()> {
        for dir in self.ignore_dirs.iter().chain(&self.ignore_vcs) {
            let rel = Path::new(dir);
            if dir.is_empty()
                || !rel
                    .components()
                    .all(|c| matches!(c, Component::Normal(_)))
            {
                return Err(ViewError::Config(format!(
                    "ignore entries must be relative paths below the root, got {dir:?}"
                )));
            }
        }
        if self.cookie_prefix.is_empty() || self.cookie_prefix.contains('/') {
            return Err(ViewError::Config(format!(
                "invalid cookie prefix {:?}",
                self.cookie_prefix
            )));
        }
        Ok(())
    }

    pub fn with_gc_age(mut self, age: Duration) -> Self {
        self.gc_age_seconds = age.as_secs();
        self
    }

    pub fn with_gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval_seconds = interval.as_secs();
        self
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle_ms = settle.as_millis() as u64;
        self
    }

    pub fn with_notify_poll(mut self, poll: Duration) -> Self {
        self.notify_poll_ms = poll.as_millis() as u64;
        self
    }

    pub fn ignore_dir(mut self, dir: impl Into<String>) -> Self {
        self.ignore_dirs.push(dir.into());
        self
    }

    pub fn gc_age(&self) -> Duration {
        Duration::from_secs(self.gc_age_seconds)
    }

    pub fn gc_interval(&self) -> Option<Duration> {
        (self.gc_interval_seconds > 0).then(|| Duration::from_secs(self.gc_interval_seconds))
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms.max(1))
    }

    pub fn notify_poll(&self) -> Duration {
        Duration::from_millis(self.notify_poll_ms.max(1))
    }
}

/// Absolute forms of the ignore lists for one root.
#[derive(Debug, Clone, Default)]
pub struct IgnoreSet {
    ignored: Vec<PathBuf>,
    vcs: Vec<PathBuf>,
}

impl IgnoreSet {
    pub fn new(root: &Path, config: &ViewConfig) -> Self {
        Self {
            ignored: config.ignore_dirs.iter().map(|d| root.join(d)).collect(),
            vcs: config.ignore_vcs.iter().map(|d| root.join(d)).collect(),
        }
    }

    /// `path` is, or is below, an ignored directory.
    pub fn is_ignored(&self, path: &Path) -> bool {
        self.ignored.iter().any(|dir| path.starts_with(dir))
    }

    /// `path` is strictly below a VCS directory.
    pub fn is_vcs_contents(&self, path: &Path) -> bool {
        self.vcs.iter().any(|dir| path != dir && path.starts_with(dir))
    }

    /// `path` is a VCS directory itself.
    pub fn is_vcs_dir(&self, path: &Path) -> bool {
        self.vcs.iter().any(|dir| path == dir)
    }
}
