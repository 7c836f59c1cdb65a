//! Periodic online backups of a file database.
//!
//! A [`BackupScheduler`] owns a timer thread that copies the source database
//! into the target every interval using the engine's online-backup API. The
//! copy uses its own connections, so it never touches the server's handler.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use rusqlite::backup::{Backup, StepResult};
use rusqlite::Connection;
use tracing::{debug, error, info};

use crate::error::{BackupError, ConfigError};

/// Oldest engine with WAL and the online-backup API.
pub const MIN_SQLITE_VERSION: i32 = 3_007_000;

const BUSY_RETRY: Duration = Duration::from_millis(25);

/// Whether this build of the engine supports online backups of WAL
/// databases.
pub fn is_backup_supported() -> bool {
    rusqlite::version_number() >= MIN_SQLITE_VERSION
}

/// One source/target pair and its schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct BackupJob {
    source_path: PathBuf,
    target_path: PathBuf,
    interval: Duration,
    pages_per_step: i32,
}

impl BackupJob {
    pub fn new(
        source: impl AsRef<Path>,
        target: impl Into<PathBuf>,
        interval: Duration,
    ) -> Result<Self, ConfigError> {
        if !is_backup_supported() {
            return Err(ConfigError::BackupUnsupported(format!(
                "SQLite {} is older than 3.7.0",
                rusqlite::version()
            )));
        }

        let source = source.as_ref();
        if source.as_os_str() == ":memory:" || source.as_os_str().is_empty() {
            return Err(ConfigError::BackupUnsupported(
                "in-memory databases cannot be backed up".to_string(),
            ));
        }
        if interval.is_zero() {
            return Err(ConfigError::BackupUnsupported(
                "backup interval must be positive".to_string(),
            ));
        }

        Ok(Self {
            source_path: source.to_path_buf(),
            target_path: target.into(),
            interval,
            pages_per_step: -1,
        })
    }

    /// Pages copied per step; negative copies everything in one step.
    pub fn with_pages_per_step(mut self, pages: i32) -> Self {
        self.pages_per_step = if pages == 0 { -1 } else { pages };
        self
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn target_path(&self) -> &Path {
        &self.target_path
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Copies the source into the target once.
    pub fn run(&self) -> Result<(), BackupError> {
        let source = Connection::open(&self.source_path)?;
        let mut target = Connection::open(&self.target_path)?;
        let backup = Backup::new(&source, &mut target)?;

        loop {
            let step = backup.step(self.pages_per_step)?;
            let progress = backup.progress();
            info!(
                "Copied {} of {} pages",
                progress.pagecount - progress.remaining,
                progress.pagecount
            );

            match step {
                StepResult::Done => break,
                StepResult::More => {}
                StepResult::Busy | StepResult::Locked => thread::sleep(BUSY_RETRY),
                #[allow(unreachable_patterns)]
                _ => thread::sleep(BUSY_RETRY),
            }
        }

        info!(
            "Finished backup: source {}, target {}",
            self.source_path.display(),
            self.target_path.display()
        );
        Ok(())
    }
}

/// Runs a [`BackupJob`] every interval on a background thread until
/// cancelled. Dropping the scheduler cancels it.
#[derive(Debug)]
pub struct BackupScheduler {
    cancel: Option<mpsc::Sender<()>>,
}

impl BackupScheduler {
    pub fn start(job: BackupJob) -> std::io::Result<Self> {
        let (cancel, cancelled) = mpsc::channel::<()>();

        thread::Builder::new()
            .name("sqlite-backup".to_string())
            .spawn(move || {
                info!(
                    "Backup of {} every {:?} into {}",
                    job.source_path.display(),
                    job.interval,
                    job.target_path.display()
                );
                loop {
                    match cancelled.recv_timeout(job.interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            if let Err(e) = job.run() {
                                error!("Backup of {} failed: {e}", job.source_path.display());
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("Backup scheduler stopped");
            })?;

        Ok(Self {
            cancel: Some(cancel),
        })
    }

    /// Stops the timer. A backup already in progress finishes first.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_none()
    }
}

impl Drop for BackupScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn seed(path: &Path, rows: i64) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch("CREATE TABLE stocks (date text, trans text, symbol text, qty real, price real)")
            .unwrap();
        for i in 0..rows {
            conn.execute(
                "INSERT INTO stocks VALUES ('2006-01-05', 'BUY', 'RHAT', ?1, 35.14)",
                [i],
            )
            .unwrap();
        }
    }

    fn count(path: &Path) -> i64 {
        Connection::open(path)
            .unwrap()
            .query_row("SELECT COUNT(*) FROM stocks", [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn memory_sources_are_rejected() {
        let err = BackupJob::new(":memory:", "/tmp/x.db", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, ConfigError::BackupUnsupported(_)));
    }

    #[test]
    fn zero_interval_is_rejected() {
        assert!(BackupJob::new("/tmp/a.db", "/tmp/b.db", Duration::ZERO).is_err());
    }

    #[test]
    fn run_copies_every_page() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("main.db");
        let target = dir.path().join("backup.db");
        seed(&source, 27);

        BackupJob::new(&source, &target, Duration::from_secs(60))
            .unwrap()
            .run()
            .unwrap();
        assert_eq!(count(&target), 27);
    }

    #[test]
    fn stepwise_copy_gives_the_same_result() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("main.db");
        let target = dir.path().join("backup.db");
        seed(&source, 500);

        BackupJob::new(&source, &target, Duration::from_secs(60))
            .unwrap()
            .with_pages_per_step(1)
            .run()
            .unwrap();
        assert_eq!(count(&target), 500);
    }

    #[test]
    fn scheduler_runs_on_its_interval_and_cancels() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("main.db");
        let target = dir.path().join("backup.db");
        seed(&source, 3);

        let job = BackupJob::new(&source, &target, Duration::from_millis(100)).unwrap();
        let mut scheduler = BackupScheduler::start(job).unwrap();
        thread::sleep(Duration::from_millis(600));
        scheduler.cancel();
        assert!(scheduler.is_cancelled());

        assert_eq!(count(&target), 3);
    }
}
