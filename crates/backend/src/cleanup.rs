use std::{
    fs, io,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use serde::Serialize;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ServiceError, ServiceResult};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub removed: usize,
    pub failed: usize,
}

/// Staging entries younger than this are assumed to belong to a live render.
pub const STAGING_GRACE: Duration = Duration::from_secs(3600);

pub fn hours(hours: u64) -> Duration {
    Duration::from_secs(hours.saturating_mul(3600))
}

/// Deletes regular files directly under `dir` whose age is at least
/// `max_age`. Subdirectories are left alone. A missing directory is an
/// empty sweep; a file that cannot be removed is counted and skipped.
pub fn sweep(dir: &Path, max_age: Duration) -> io::Result<SweepReport> {
    sweep_entries(dir, max_age, false)
}

/// Reclaims render directories and files left under the staging directory
/// by a crashed or aborted render.
pub fn sweep_staging(dir: &Path, max_age: Duration) -> io::Result<SweepReport> {
    sweep_entries(dir, max_age, true)
}

fn sweep_entries(dir: &Path, max_age: Duration, with_dirs: bool) -> io::Result<SweepReport> {
    let mut report = SweepReport::default();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(report),
        Err(err) => return Err(err),
    };
    let now = SystemTime::now();

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(target = "tts_gateway::cleanup", %err, "unreadable directory entry");
                report.failed += 1;
                continue;
            }
        };
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!(target = "tts_gateway::cleanup", file = %entry.path().display(), %err, "stat failed");
                report.failed += 1;
                continue;
            }
        };
        let is_dir = metadata.is_dir();
        if !(metadata.is_file() || (with_dirs && is_dir)) {
            continue;
        }
        report.scanned += 1;

        let stamp = metadata.created().or_else(|_| metadata.modified());
        let age = stamp
            .ok()
            .and_then(|stamp| now.duration_since(stamp).ok())
            .unwrap_or_default();
        if age < max_age {
            continue;
        }

        let path = entry.path();
        let removed = if is_dir {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match removed {
            Ok(()) => {
                debug!(target = "tts_gateway::cleanup", file = %path.display(), "removed");
                report.removed += 1;
            }
            // raced with another sweep
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(target = "tts_gateway::cleanup", file = %path.display(), %err, "remove failed");
                report.failed += 1;
            }
        }
    }

    if report.removed > 0 || report.failed > 0 {
        info!(
            target = "tts_gateway::cleanup",
            dir = %dir.display(),
            scanned = report.scanned,
            removed = report.removed,
            failed = report.failed,
            "sweep finished"
        );
    }
    Ok(report)
}

/// Runs [`sweep`] on the blocking pool.
pub async fn sweep_in_background(dir: PathBuf, max_age: Duration) -> ServiceResult<SweepReport> {
    let display = dir.display().to_string();
    tokio::task::spawn_blocking(move || sweep(&dir, max_age))
        .await
        .map_err(|err| ServiceError::Cleanup(err.to_string()))?
        .map_err(|err| ServiceError::Cleanup(format!("{display}: {err}")))
}

/// Runs [`sweep_staging`] on the blocking pool.
pub async fn sweep_staging_in_background(
    dir: PathBuf,
    max_age: Duration,
) -> ServiceResult<SweepReport> {
    let display = dir.display().to_string();
    tokio::task::spawn_blocking(move || sweep_staging(&dir, max_age))
        .await
        .map_err(|err| ServiceError::Cleanup(err.to_string()))?
        .map_err(|err| ServiceError::Cleanup(format!("{display}: {err}")))
}

/// Periodic sweep of the output and staging directories, stopped through
/// its token.
pub struct CleanupTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl CleanupTask {
    pub fn spawn(
        dir: PathBuf,
        staging_dir: PathBuf,
        interval: Duration,
        max_age: Duration,
    ) -> Self {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        info!(
            target = "tts_gateway::cleanup",
            dir = %dir.display(),
            interval_secs = interval.as_secs(),
            max_age_secs = max_age.as_secs(),
            "periodic cleanup scheduled"
        );

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = sweep_in_background(dir.clone(), max_age).await {
                            error!(target = "tts_gateway::cleanup", %err, "periodic cleanup failed");
                        }
                        let staging_age = max_age.max(STAGING_GRACE);
                        let staged = sweep_staging_in_background(staging_dir.clone(), staging_age);
                        if let Err(err) = staged.await {
                            error!(target = "tts_gateway::cleanup", %err, "staging cleanup failed");
                        }
                    }
                }
            }
            debug!(target = "tts_gateway::cleanup", "periodic cleanup stopped");
        });

        Self { token, handle }
    }

    /// Cancels the loop and waits for an in-progress sweep to finish.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(err) = self.handle.await {
            warn!(target = "tts_gateway::cleanup", %err, "cleanup task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_age_removes_every_file_but_keeps_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tts_a.wav"), b"a").unwrap();
        std::fs::write(dir.path().join("vc_b.mp3"), b"b").unwrap();
        std::fs::create_dir(dir.path().join(".staging")).unwrap();
        std::fs::write(dir.path().join(".staging/in_progress.wav"), b"c").unwrap();

        let report = sweep(dir.path(), Duration::ZERO).unwrap();

        assert_eq!(report.removed, 2);
        assert_eq!(report.failed, 0);
        assert!(dir.path().join(".staging/in_progress.wav").exists());
    }

    #[test]
    fn fresh_files_survive_a_long_threshold() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tts_a.wav"), b"a").unwrap();

        let report = sweep(dir.path(), hours(24)).unwrap();

        assert_eq!(report, SweepReport { scanned: 1, removed: 0, failed: 0 });
        assert!(dir.path().join("tts_a.wav").exists());
    }

    #[test]
    fn missing_directory_is_an_empty_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let report = sweep(&dir.path().join("absent"), Duration::ZERO).unwrap();
        assert_eq!(report, SweepReport::default());
    }

    #[test]
    fn staging_sweep_reclaims_abandoned_render_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let abandoned = dir.path().join("render_abc123");
        std::fs::create_dir(&abandoned).unwrap();
        std::fs::write(abandoned.join("tts_x.wav"), b"partial").unwrap();
        std::fs::write(dir.path().join("stray.tmp"), b"x").unwrap();

        let report = sweep_staging(dir.path(), hours(1)).unwrap();
        assert_eq!(report.removed, 0);
        assert!(abandoned.exists());

        let report = sweep_staging(dir.path(), Duration::ZERO).unwrap();
        assert_eq!(report, SweepReport { scanned: 2, removed: 2, failed: 0 });
        assert!(!abandoned.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn background_sweep_reports_counts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old.wav"), b"a").unwrap();
        let report = sweep_in_background(dir.path().to_path_buf(), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(report.removed, 1);
    }

    #[tokio::test]
    async fn periodic_task_sweeps_and_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("tts_old.wav");
        std::fs::write(&file, b"a").unwrap();

        let task = CleanupTask::spawn(
            dir.path().to_path_buf(),
            dir.path().join(".staging"),
            Duration::from_millis(20),
            Duration::ZERO,
        );
        let mut waited = Duration::ZERO;
        while file.exists() && waited < Duration::from_secs(2) {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += Duration::from_millis(10);
        }
        assert!(!file.exists());

        tokio::time::timeout(Duration::from_secs(1), task.shutdown())
            .await
            .unwrap();
    }
}
