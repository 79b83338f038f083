//! Workspace bookkeeping and reclamation.
//!
//! The metadata map sits behind a `std::sync::Mutex` that is only held for
//! bookkeeping. Filesystem work (sizing, renaming, deleting) happens with the
//! lock released, so a slow delete never stalls request handling.
//!
//! Reclamation is snapshot-then-act: candidates are chosen under the lock and
//! marked `reclaiming`, which makes [`WorkspaceManager::lease`] refuse them.
//! A marked directory is first renamed to `.reclaim-<id>` (atomic on one
//! filesystem) and only then deleted, so nothing can resolve into a
//! half-deleted workspace.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ScratchConfig;
use crate::id::{validate_filename, WorkspaceId};
use crate::workspace::{LeasedArtifact, WorkspaceLease};
use crate::{Result, ScratchError};

const RECLAIM_PREFIX: &str = ".reclaim-";

#[derive(Debug, Clone)]
struct Entry {
    last_touched: SystemTime,
    leases: usize,
    reclaiming: bool,
    discard_on_release: bool,
}

impl Entry {
    fn fresh(at: SystemTime) -> Self {
        Self {
            last_touched: at,
            leases: 0,
            reclaiming: false,
            discard_on_release: false,
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReclaimReport {
    pub adopted: usize,
    pub expired: Vec<WorkspaceId>,
    pub evicted: Vec<WorkspaceId>,
    pub freed_bytes: u64,
    pub usage_before: u64,
    pub usage_after: u64,
}

impl ReclaimReport {
    pub fn removed(&self) -> usize {
        self.expired.len() + self.evicted.len()
    }
}

/// Owns the workspace root and every workspace under it.
#[derive(Debug)]
pub struct WorkspaceManager {
    config: ScratchConfig,
    entries: Mutex<HashMap<WorkspaceId, Entry>>,
}

impl WorkspaceManager {
    /// Create the root directory if needed and start with an empty map.
    ///
    /// Directories left by a previous process are adopted by the first sweep.
    pub fn new(config: ScratchConfig) -> Result<Arc<Self>> {
        fs::create_dir_all(&config.root).map_err(|e| ScratchError::io(&config.root, e))?;
        Ok(Arc::new(Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }))
    }

    pub fn config(&self) -> &ScratchConfig {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<WorkspaceId, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dir_of(&self, id: &WorkspaceId) -> PathBuf {
        self.config.root.join(id.as_str())
    }

    /// Allocate a new workspace directory and return it leased.
    pub fn create(self: &Arc<Self>) -> Result<WorkspaceLease> {
        let id = WorkspaceId::new();
        let path = self.dir_of(&id);
        fs::create_dir(&path).map_err(|e| ScratchError::io(&path, e))?;

        let mut entry = Entry::fresh(SystemTime::now());
        entry.leases = 1;
        self.entries().insert(id.clone(), entry);

        debug!(workspace.id = %id, "workspace created");
        Ok(WorkspaceLease::new(Arc::clone(self), id, path))
    }

    /// Take an additional lease on an existing workspace.
    pub fn lease(self: &Arc<Self>, id: &str) -> Result<WorkspaceLease> {
        let id = WorkspaceId::parse(id)?;
        let path = self.dir_of(&id);
        {
            let mut entries = self.entries();
            let entry = entries
                .get_mut(&id)
                .ok_or_else(|| ScratchError::NotFound(id.to_string()))?;
            if entry.reclaiming || entry.discard_on_release {
                return Err(ScratchError::Reclaiming(id.to_string()));
            }
            entry.leases += 1;
            entry.last_touched = SystemTime::now();
        }
        Ok(WorkspaceLease::new(Arc::clone(self), id, path))
    }

    /// Mark a workspace as recently used.
    pub fn touch(&self, id: &str) -> Result<()> {
        let id = WorkspaceId::parse(id)?;
        let mut entries = self.entries();
        match entries.get_mut(&id) {
            Some(entry) if !entry.reclaiming => {
                entry.last_touched = SystemTime::now();
                Ok(())
            }
            Some(_) => Err(ScratchError::Reclaiming(id.to_string())),
            None => Err(ScratchError::NotFound(id.to_string())),
        }
    }

    /// Resolve a stored artifact for download.
    ///
    /// The returned handle holds a lease, so the workspace survives sweeps
    /// until the handle is dropped.
    pub fn resolve_artifact(self: &Arc<Self>, id: &str, filename: &str) -> Result<LeasedArtifact> {
        let id = WorkspaceId::parse(id)?;
        let filename = validate_filename(filename)?;
        let dir = self.dir_of(&id);
        let path = dir.join(filename);

        let mut entries = self.entries();
        let entry = entries
            .get_mut(&id)
            .filter(|e| !e.reclaiming && !e.discard_on_release)
            .ok_or_else(|| ScratchError::NotFound(id.to_string()))?;
        if !path.is_file() {
            return Err(ScratchError::NotFound(format!("{id}/{filename}")));
        }
        entry.leases += 1;
        entry.last_touched = SystemTime::now();
        drop(entries);

        let lease = WorkspaceLease::new(Arc::clone(self), id, dir);
        Ok(LeasedArtifact::new(path, lease))
    }

    /// Number of workspaces currently tracked.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &WorkspaceId) -> bool {
        self.entries().contains_key(id)
    }

    /// Bytes used by every tracked workspace, leased or not.
    pub fn usage_bytes(&self) -> u64 {
        let ids: Vec<WorkspaceId> = self.entries().keys().cloned().collect();
        ids.iter().map(|id| dir_size(&self.dir_of(id))).sum()
    }

    pub(crate) fn release(&self, id: &WorkspaceId) {
        let discard = {
            let mut entries = self.entries();
            match entries.get_mut(id) {
                Some(entry) => {
                    entry.leases = entry.leases.saturating_sub(1);
                    entry.last_touched = SystemTime::now();
                    if entry.leases == 0 && entry.discard_on_release && !entry.reclaiming {
                        entry.reclaiming = true;
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if discard {
            if let Err(e) = self.delete_marked(id) {
                warn!(workspace.id = %id, error = %e, "failed to discard workspace");
            }
        }
    }

    pub(crate) fn mark_discard(&self, id: &WorkspaceId) {
        if let Some(entry) = self.entries().get_mut(id) {
            entry.discard_on_release = true;
        }
    }

    /// Run a sweep against the current clock.
    pub fn reclaim_if_needed(&self) -> ReclaimReport {
        self.reclaim_at(SystemTime::now())
    }

    /// Run a sweep as if the clock read `now`.
    pub fn reclaim_at(&self, now: SystemTime) -> ReclaimReport {
        let mut report = ReclaimReport::default();
        let on_disk = self.scan_root();

        // Phase 1: adopt unknown directories and snapshot candidates.
        let snapshot: Vec<(WorkspaceId, SystemTime, bool)> = {
            let mut entries = self.entries();
            for (id, modified) in on_disk {
                if !entries.contains_key(&id) {
                    entries.insert(id, Entry::fresh(modified));
                    report.adopted += 1;
                }
            }
            entries
                .iter()
                .filter(|(_, e)| !e.reclaiming)
                .map(|(id, e)| (id.clone(), e.last_touched, e.leases == 0))
                .collect()
        };

        // Phase 2: size everything, leased workspaces included.
        let mut sized: Vec<(WorkspaceId, SystemTime, bool, u64)> = snapshot
            .into_iter()
            .map(|(id, touched, candidate)| {
                let size = dir_size(&self.dir_of(&id));
                (id, touched, candidate, size)
            })
            .collect();
        // Oldest first; id breaks ties so the order is stable.
        sized.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

        report.usage_before = sized.iter().map(|s| s.3).sum();
        let mut usage = report.usage_before;

        let mut expired = Vec::new();
        let mut evicted = Vec::new();
        for (id, touched, candidate, size) in &sized {
            if !candidate {
                continue;
            }
            let age = now.duration_since(*touched).unwrap_or(Duration::ZERO);
            if age > self.config.max_age {
                expired.push((id.clone(), *size));
                usage = usage.saturating_sub(*size);
            }
        }
        if usage > self.config.high_water_bytes {
            for (id, _, candidate, size) in &sized {
                if usage <= self.config.low_water_bytes {
                    break;
                }
                if *candidate && !expired.iter().any(|(e, _)| e == id) {
                    evicted.push((id.clone(), *size));
                    usage = usage.saturating_sub(*size);
                }
            }
        }

        // Phase 3: mark under the lock, re-checking leases taken since the snapshot.
        let mark = |list: Vec<(WorkspaceId, u64)>| -> Vec<(WorkspaceId, u64)> {
            let mut entries = self.entries();
            list.into_iter()
                .filter(|(id, _)| match entries.get_mut(id) {
                    Some(entry) if entry.leases == 0 && !entry.reclaiming => {
                        entry.reclaiming = true;
                        true
                    }
                    _ => false,
                })
                .collect()
        };
        let expired = mark(expired);
        let evicted = mark(evicted);

        // Phase 4: delete with the lock released.
        for (id, size) in expired {
            if self.finish_reclaim(&id) {
                report.freed_bytes += size;
                report.expired.push(id);
            }
        }
        for (id, size) in evicted {
            if self.finish_reclaim(&id) {
                report.freed_bytes += size;
                report.evicted.push(id);
            }
        }

        report.usage_after = report.usage_before.saturating_sub(report.freed_bytes);
        if report.removed() > 0 || report.adopted > 0 {
            info!(
                adopted = report.adopted,
                expired = report.expired.len(),
                evicted = report.evicted.len(),
                freed_bytes = report.freed_bytes,
                usage_after = report.usage_after,
                "workspace sweep"
            );
        }
        report
    }

    fn finish_reclaim(&self, id: &WorkspaceId) -> bool {
        match self.delete_marked(id) {
            Ok(()) => true,
            Err(e) => {
                warn!(workspace.id = %id, error = %e, "workspace reclaim failed");
                if let Some(entry) = self.entries().get_mut(id) {
                    entry.reclaiming = false;
                }
                false
            }
        }
    }

    /// Rename then delete a workspace already marked `reclaiming`.
    fn delete_marked(&self, id: &WorkspaceId) -> Result<()> {
        let path = self.dir_of(id);
        let doomed = self
            .config
            .root
            .join(format!("{RECLAIM_PREFIX}{}", id.as_str()));

        match fs::rename(&path, &doomed) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.entries().remove(id);
                return Ok(());
            }
            Err(e) => return Err(ScratchError::io(&path, e)),
        }

        // Unreachable by id from here on; a failed delete is retried by the
        // next scan as a stale reclaim dir.
        self.entries().remove(id);
        fs::remove_dir_all(&doomed).map_err(|e| ScratchError::io(&doomed, e))?;
        debug!(workspace.id = %id, "workspace removed");
        Ok(())
    }

    /// Workspace directories on disk with their mtimes; clears stale
    /// `.reclaim-*` leftovers from an interrupted delete.
    fn scan_root(&self) -> Vec<(WorkspaceId, SystemTime)> {
        let dir = match fs::read_dir(&self.config.root) {
            Ok(dir) => dir,
            Err(e) => {
                warn!(root = %self.config.root.display(), error = %e, "cannot scan workspace root");
                return Vec::new();
            }
        };

        let mut found = Vec::new();
        for entry in dir.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            if name.starts_with(RECLAIM_PREFIX) {
                if let Err(e) = fs::remove_dir_all(entry.path()) {
                    warn!(path = %entry.path().display(), error = %e, "stale reclaim dir");
                }
                continue;
            }
            if let Ok(id) = WorkspaceId::parse(name) {
                let modified = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .unwrap_or_else(|_| SystemTime::now());
                found.push((id, modified));
            }
        }
        found
    }
}

fn dir_size(path: &Path) -> u64 {
    walkdir::WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter_map(|e| e.metadata().ok())
        .filter(|m| m.is_file())
        .map(|m| m.len())
        .sum()
}
