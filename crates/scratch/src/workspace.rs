use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::id::{validate_filename, WorkspaceId};
use crate::manager::WorkspaceManager;
use crate::{Result, ScratchError};

/// A workspace held in flight.
///
/// While any lease on a workspace is alive the sweep never reclaims it.
/// Dropping the lease releases it and refreshes its idle clock.
#[derive(Debug)]
pub struct WorkspaceLease {
    manager: Arc<WorkspaceManager>,
    id: WorkspaceId,
    path: PathBuf,
}

impl WorkspaceLease {
    pub(crate) fn new(manager: Arc<WorkspaceManager>, id: WorkspaceId, path: PathBuf) -> Self {
        Self { manager, id, path }
    }

    pub fn id(&self) -> &WorkspaceId {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of a named artifact inside this workspace.
    pub fn artifact_path(&self, filename: &str) -> Result<PathBuf> {
        Ok(self.path.join(validate_filename(filename)?))
    }

    /// Write an artifact, replacing any existing file of the same name.
    pub async fn write_artifact(&self, filename: &str, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.artifact_path(filename)?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| ScratchError::io(&path, e))?;
        Ok(path)
    }

    /// Delete an artifact if present.
    pub async fn remove_artifact(&self, filename: &str) -> Result<()> {
        let path = self.artifact_path(filename)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ScratchError::io(&path, e)),
        }
    }

    /// Release the lease and delete the workspace once no other lease holds it.
    pub fn discard(self) {
        self.manager.mark_discard(&self.id);
    }
}

impl Drop for WorkspaceLease {
    fn drop(&mut self) {
        self.manager.release(&self.id);
    }
}

/// A resolved artifact that keeps its workspace leased.
///
/// Hold it until the file has been streamed out; the sweep cannot reclaim
/// the workspace underneath it.
#[derive(Debug)]
pub struct LeasedArtifact {
    path: PathBuf,
    lease: WorkspaceLease,
}

impl LeasedArtifact {
    pub(crate) fn new(path: PathBuf, lease: WorkspaceLease) -> Self {
        Self { path, lease }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lease(&self) -> &WorkspaceLease {
        &self.lease
    }

    /// Read the whole artifact.
    pub async fn read(&self) -> Result<Vec<u8>> {
        tokio::fs::read(&self.path)
            .await
            .map_err(|e| ScratchError::io(&self.path, e))
    }
}
