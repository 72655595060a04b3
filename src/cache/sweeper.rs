use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub removed: usize,
}

/// Delete regular files in `dir` whose `max(atime, mtime)` is more than
/// `max_age` before `now`. Errors on single files are logged and skipped.
pub fn sweep_dir(dir: &Path, max_age: Duration, now: SystemTime) -> std::io::Result<SweepReport> {
    let mut report = SweepReport::default();
    for entry in std::fs::read_dir(dir)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read cache entry");
                continue;
            }
        };
        let path = entry.path();
        let meta = match entry.metadata() {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to stat cache entry");
                continue;
            }
        };
        report.scanned += 1;

        let last_used = match (meta.accessed(), meta.modified()) {
            (Ok(a), Ok(m)) => a.max(m),
            (Ok(t), Err(_)) | (Err(_), Ok(t)) => t,
            (Err(e), Err(_)) => {
                tracing::warn!(path = %path.display(), error = %e, "No timestamps on cache entry");
                continue;
            }
        };
        let age = now.duration_since(last_used).unwrap_or(Duration::ZERO);
        if age <= max_age {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!(path = %path.display(), age_secs = age.as_secs(), "Evicted cache entry");
                report.removed += 1;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to evict cache entry");
            }
        }
    }
    Ok(report)
}

/// Periodic eviction pass over the cache directory.
pub struct CacheSweeper {
    dir: PathBuf,
    max_age: Duration,
    interval: Duration,
}

impl CacheSweeper {
    pub fn new(dir: impl Into<PathBuf>, max_age: Duration, interval: Duration) -> Self {
        Self {
            dir: dir.into(),
            max_age,
            interval,
        }
    }

    /// Sweep once per interval until `shutdown` fires. A failed sweep is
    /// logged; the next one runs on schedule.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.cancelled() => break,
            }

            let dir = self.dir.clone();
            let max_age = self.max_age;
            let swept =
                tokio::task::spawn_blocking(move || sweep_dir(&dir, max_age, SystemTime::now()))
                    .await;
            match swept {
                Ok(Ok(report)) => {
                    tracing::info!(scanned = report.scanned, removed = report.removed, "Cache sweep finished");
                }
                Ok(Err(e)) => tracing::warn!(error = %e, "Cache sweep failed"),
                Err(e) => tracing::error!(error = %e, "Cache sweep task panicked"),
            }
        }
        tracing::debug!("Cache sweeper stopped");
    }
}
