//! Retention-based pruning of the temp directory.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

/// Default age after which temp files are deleted.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Counts from one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub deleted: usize,
    pub failed: usize,
}

/// Deletes regular files older than `retention` from `dir`.
#[derive(Debug, Clone)]
pub struct TempSweeper {
    dir: PathBuf,
    retention: Duration,
}

impl TempSweeper {
    pub fn new(dir: impl Into<PathBuf>, retention: Duration) -> Self {
        Self {
            dir: dir.into(),
            retention,
        }
    }

    pub fn sweep(&self) -> std::io::Result<SweepReport> {
        self.sweep_at(SystemTime::now())
    }

    /// One pass using `now` as the reference time.
    ///
    /// Only a failure to list the directory is returned as an error; per-file
    /// failures are logged and counted.
    pub fn sweep_at(&self, now: SystemTime) -> std::io::Result<SweepReport> {
        let mut report = SweepReport::default();

        for dirent in std::fs::read_dir(&self.dir)? {
            let dirent = match dirent {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!(error = %e, "temp sweep: unreadable directory entry");
                    report.failed += 1;
                    continue;
                }
            };
            let path = dirent.path();

            let modified = match dirent.metadata().and_then(|m| {
                if m.is_file() {
                    m.modified().map(Some)
                } else {
                    Ok(None)
                }
            }) {
                Ok(Some(modified)) => modified,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "temp sweep: stat failed");
                    report.failed += 1;
                    continue;
                }
            };
            report.scanned += 1;

            // A timestamp in the future counts as brand new.
            let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
            if age <= self.retention {
                continue;
            }

            match std::fs::remove_file(&path) {
                Ok(()) => {
                    tracing::info!(path = %path.display(), age_secs = age.as_secs(), "deleted expired temp file");
                    report.deleted += 1;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "temp sweep: delete failed");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}
