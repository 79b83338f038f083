//! Per-request scratch workspaces.
//!
//! Each request gets its own directory under a shared root, named by a random
//! [`WorkspaceId`]. A [`WorkspaceLease`] marks the workspace in flight; the
//! background sweep only reclaims workspaces nobody holds.
//!
//! ```rust,no_run
//! use scratch::{ScratchConfig, WorkspaceManager};
//!
//! # async fn demo() -> scratch::Result<()> {
//! let manager = WorkspaceManager::new(ScratchConfig::with_root("/tmp/remaster"))?;
//! let lease = manager.create()?;
//! let id = lease.id().to_string();
//! lease.write_artifact("input.mid", b"MThd").await?;
//! drop(lease);
//!
//! // Later, from the download path. The handle keeps the workspace leased.
//! let artifact = manager.resolve_artifact(&id, "input.mid")?;
//! let bytes = artifact.read().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Sweep policy, in order:
//! 1. unleased workspaces idle longer than `max_age` are removed;
//! 2. if usage (leased included) is still above `high_water_bytes`, unleased
//!    workspaces are removed oldest-first until usage reaches `low_water_bytes`.

pub mod config;
pub mod id;
pub mod manager;
pub mod sweeper;
pub mod workspace;

pub use config::ScratchConfig;
pub use id::{validate_filename, WorkspaceId};
pub use manager::{ReclaimReport, WorkspaceManager};
pub use sweeper::spawn_sweeper;
pub use workspace::{LeasedArtifact, WorkspaceLease};

use std::path::{Path, PathBuf};

/// Errors from workspace operations.
#[derive(Debug, thiserror::Error)]
pub enum ScratchError {
    #[error("invalid workspace id: {0:?}")]
    InvalidId(String),

    #[error("invalid artifact filename: {0:?}")]
    InvalidFilename(String),

    #[error("workspace not found: {0}")]
    NotFound(String),

    #[error("workspace {0} is being reclaimed")]
    Reclaiming(String),

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ScratchError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, ScratchError>;
