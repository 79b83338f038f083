//! Workspace lifecycle: leases, artifact resolution and reclamation.

use std::fs;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use scratch::{spawn_sweeper, ScratchConfig, ScratchError, WorkspaceId, WorkspaceManager};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn manager(dir: &TempDir) -> Result<Arc<WorkspaceManager>> {
    Ok(WorkspaceManager::new(ScratchConfig::with_root(dir.path()))?)
}

fn later(by: Duration) -> SystemTime {
    SystemTime::now() + by
}

#[tokio::test]
async fn create_writes_and_resolves() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = manager(&dir)?;

    let lease = manager.create()?;
    let id = lease.id().clone();
    assert!(lease.path().is_dir());
    lease.write_artifact("song.mid", b"MThd").await?;
    drop(lease);

    let artifact = manager.resolve_artifact(id.as_str(), "song.mid")?;
    assert_eq!(artifact.read().await?, b"MThd");
    assert_eq!(artifact.lease().id(), &id);
    assert_eq!(manager.len(), 1);
    Ok(())
}

#[test]
fn resolve_rejects_bad_input() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = manager(&dir)?;
    let lease = manager.create()?;
    let id = lease.id().as_str().to_string();

    assert!(matches!(
        manager.resolve_artifact("../etc", "passwd"),
        Err(ScratchError::InvalidId(_))
    ));
    assert!(matches!(
        manager.resolve_artifact(&id, "../../passwd"),
        Err(ScratchError::InvalidFilename(_))
    ));
    assert!(matches!(
        manager.resolve_artifact(&id, "missing.mp3"),
        Err(ScratchError::NotFound(_))
    ));
    let unknown = WorkspaceId::new();
    assert!(matches!(
        manager.resolve_artifact(unknown.as_str(), "x.mid"),
        Err(ScratchError::NotFound(_))
    ));
    Ok(())
}

#[tokio::test]
async fn expired_workspaces_are_reclaimed() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = manager(&dir)?;

    let lease = manager.create()?;
    let path = lease.path().to_path_buf();
    lease.write_artifact("render.wav", &[0u8; 1024]).await?;
    drop(lease);

    // Young: untouched.
    let report = manager.reclaim_at(later(Duration::from_secs(60)));
    assert_eq!(report.removed(), 0);
    assert!(path.exists());

    let report = manager.reclaim_at(later(Duration::from_secs(2 * 3600)));
    assert_eq!(report.expired.len(), 1);
    assert_eq!(report.freed_bytes, 1024);
    assert!(!path.exists());
    assert!(manager.is_empty());
    Ok(())
}

#[tokio::test]
async fn leased_workspaces_survive_any_sweep() -> Result<()> {
    let dir = TempDir::new()?;
    let config = ScratchConfig::with_root(dir.path()).with_watermarks_mb(0, 0);
    let manager = WorkspaceManager::new(config)?;

    let lease = manager.create()?;
    lease.write_artifact("input.mid", &[1u8; 4096]).await?;

    let report = manager.reclaim_at(later(Duration::from_secs(48 * 3600)));
    assert_eq!(report.removed(), 0);
    assert!(lease.path().exists());
    // Leased usage still counts toward the total.
    assert_eq!(report.usage_before, 4096);
    Ok(())
}

#[tokio::test]
async fn high_water_evicts_oldest_first() -> Result<()> {
    let dir = TempDir::new()?;
    let mut config = ScratchConfig::with_root(dir.path());
    config.high_water_bytes = 3000;
    config.low_water_bytes = 1500;
    let manager = WorkspaceManager::new(config)?;

    let mut ids = Vec::new();
    for _ in 0..3 {
        let lease = manager.create()?;
        lease.write_artifact("render.wav", &[0u8; 1000]).await?;
        ids.push(lease.id().clone());
        drop(lease);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    // Usage is 3000, not above high water.
    assert_eq!(manager.reclaim_if_needed().removed(), 0);

    let lease = manager.create()?;
    lease.write_artifact("render.wav", &[0u8; 1000]).await?;
    drop(lease);

    // 4000 > 3000: evict oldest until <= 1500, i.e. three removals.
    let report = manager.reclaim_if_needed();
    assert_eq!(report.evicted, ids);
    assert_eq!(report.usage_after, 1000);
    assert_eq!(manager.len(), 1);
    Ok(())
}

#[test]
fn unknown_directories_are_adopted() -> Result<()> {
    let dir = TempDir::new()?;
    let orphan = WorkspaceId::new();
    fs::create_dir(dir.path().join(orphan.as_str()))?;
    fs::write(dir.path().join(orphan.as_str()).join("a.mp3"), b"xyz")?;
    fs::create_dir(dir.path().join("not-a-workspace"))?;

    let manager = manager(&dir)?;
    let report = manager.reclaim_if_needed();
    assert_eq!(report.adopted, 1);
    assert!(manager.contains(&orphan));
    assert!(manager.resolve_artifact(orphan.as_str(), "a.mp3").is_ok());

    let report = manager.reclaim_at(later(Duration::from_secs(3 * 3600)));
    assert_eq!(report.expired, vec![orphan]);
    assert!(dir.path().join("not-a-workspace").exists());
    Ok(())
}

#[test]
fn reclaiming_refuses_new_leases_and_discard_deletes() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = manager(&dir)?;

    let lease = manager.create()?;
    let id = lease.id().clone();
    let path = lease.path().to_path_buf();
    lease.discard();

    assert!(!path.exists());
    assert!(matches!(
        manager.lease(id.as_str()),
        Err(ScratchError::NotFound(_))
    ));
    assert!(manager.is_empty());
    Ok(())
}

#[test]
fn second_lease_delays_discard() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = manager(&dir)?;

    let lease = manager.create()?;
    let other = manager.lease(lease.id().as_str())?;
    let path = lease.path().to_path_buf();
    lease.discard();
    assert!(path.exists());
    drop(other);
    assert!(!path.exists());
    Ok(())
}

#[tokio::test]
async fn download_handle_blocks_reclaim() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = manager(&dir)?;

    let lease = manager.create()?;
    let id = lease.id().clone();
    lease.write_artifact("song.mp3", b"ID3").await?;
    drop(lease);

    let artifact = manager.resolve_artifact(id.as_str(), "song.mp3")?;
    let report = manager.reclaim_at(later(Duration::from_secs(48 * 3600)));
    assert_eq!(report.removed(), 0);
    assert_eq!(artifact.read().await?, b"ID3");

    drop(artifact);
    let report = manager.reclaim_at(later(Duration::from_secs(48 * 3600)));
    assert_eq!(report.expired, vec![id]);
    Ok(())
}

#[tokio::test]
async fn remove_artifact_tolerates_missing() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = manager(&dir)?;

    let lease = manager.create()?;
    let path = lease.write_artifact("render.wav", b"RIFF").await?;
    lease.remove_artifact("render.wav").await?;
    assert!(!path.exists());
    lease.remove_artifact("render.wav").await?;
    Ok(())
}

#[tokio::test]
async fn sweeper_stops_on_cancel() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = manager(&dir)?;
    let cancel = CancellationToken::new();

    let handle = spawn_sweeper(Arc::clone(&manager), Duration::from_millis(10), cancel.clone());
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle).await??;
    Ok(())
}
