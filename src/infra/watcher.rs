//! Configuration file watcher
//!
//! Polls the file's modification time and length instead of relying on
//! OS-specific notification APIs. Any difference, including the file
//! disappearing or reappearing, counts as a change.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Snapshot of the watched file's metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileFingerprint(Option<(SystemTime, u64)>);

impl FileFingerprint {
    pub fn of(path: &Path) -> Self {
        let meta = fs::metadata(path).ok();
        Self(meta.and_then(|m| m.modified().ok().map(|modified| (modified, m.len()))))
    }

    pub fn exists(&self) -> bool {
        self.0.is_some()
    }
}

/// Watch `path` until `stop` fires, cancelling `changed` on the first change.
///
/// `baseline` should be taken before the file is read so that edits made
/// while loading are not missed.
pub fn spawn_config_watcher(
    path: PathBuf,
    baseline: FileFingerprint,
    poll_interval: Duration,
    changed: CancellationToken,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!(path = %path.display(), interval_ms = poll_interval.as_millis() as u64, "config_watcher_started");
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = interval.tick() => {
                    let current = FileFingerprint::of(&path);
                    if current != baseline {
                        info!(path = %path.display(), exists = current.exists(), "config_file_changed");
                        changed.cancel();
                        break;
                    }
                }
            }
        }

        debug!(path = %path.display(), "config_watcher_stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio::time::timeout;

    #[test]
    fn test_fingerprint_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let fingerprint = FileFingerprint::of(&dir.path().join("missing.json"));
        assert!(!fingerprint.exists());
    }

    #[tokio::test]
    async fn test_change_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{}").unwrap();

        let changed = CancellationToken::new();
        let stop = CancellationToken::new();
        let handle = spawn_config_watcher(
            path.clone(),
            FileFingerprint::of(&path),
            Duration::from_millis(20),
            changed.clone(),
            stop.clone(),
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!changed.is_cancelled());

        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"\n").unwrap();
        drop(file);

        timeout(Duration::from_secs(2), changed.cancelled()).await.unwrap();
        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_deletion_is_a_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{}").unwrap();

        let changed = CancellationToken::new();
        let _handle = spawn_config_watcher(
            path.clone(),
            FileFingerprint::of(&path),
            Duration::from_millis(20),
            changed.clone(),
            CancellationToken::new(),
        );

        fs::remove_file(&path).unwrap();
        timeout(Duration::from_secs(2), changed.cancelled()).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_ends_watcher() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let stop = CancellationToken::new();
        let handle = spawn_config_watcher(
            path.clone(),
            FileFingerprint::of(&path),
            Duration::from_millis(20),
            CancellationToken::new(),
            stop.clone(),
        );
        stop.cancel();
        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
