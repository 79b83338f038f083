//! Workspace root and reclamation thresholds.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const MB: u64 = 1024 * 1024;

/// Configuration for a [`WorkspaceManager`](crate::WorkspaceManager).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScratchConfig {
    /// Directory holding one subdirectory per workspace.
    pub root: PathBuf,

    /// Unleased workspaces idle longer than this are always removed.
    pub max_age: Duration,

    /// How often the background sweeper runs.
    pub sweep_interval: Duration,

    /// Total usage above which the sweep starts evicting by age.
    pub high_water_bytes: u64,

    /// Eviction stops once usage is at or below this.
    pub low_water_bytes: u64,
}

impl Default for ScratchConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            max_age: Duration::from_secs(60 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            high_water_bytes: 500 * MB,
            low_water_bytes: 400 * MB,
        }
    }
}

/// `~/.cache/remaster/workspaces` (platform cache dir), or a relative path.
fn default_root() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.cache_dir().join("remaster").join("workspaces"))
        .unwrap_or_else(|| PathBuf::from(".remaster/workspaces"))
}

impl ScratchConfig {
    /// Defaults with a specific root.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Set the watermarks in megabytes.
    pub fn with_watermarks_mb(mut self, high: u64, low: u64) -> Self {
        self.high_water_bytes = high * MB;
        self.low_water_bytes = low.min(high) * MB;
        self
    }
}
