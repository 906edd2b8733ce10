//! Background sync daemon.
//!
//! A single tokio task that wakes every `interval`, and under the database
//! lock flushes pending writes and takes the online backup when it is due.
//! Failures are logged and retried on the next tick.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backup::OnlineBackup;
use crate::db::Database;
use crate::error::StoreResult;

/// Extra time granted to the task on shutdown on top of one interval.
const STOP_MARGIN: Duration = Duration::from_secs(2);

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub flushed: bool,
    pub backed_up: bool,
}

/// Handle to the running daemon task.
pub struct SyncDaemon {
    inner: Arc<DaemonInner>,
    handle: Mutex<Option<JoinHandle<()>>>,
    interval: Duration,
}

struct DaemonInner {
    stop: AtomicBool,
    wake: Notify,
    ticks: AtomicU64,
}

impl SyncDaemon {
    /// Spawn the daemon. Must be called from within a tokio runtime.
    pub fn start(db: Database, interval: Duration, online_backup: Option<Arc<OnlineBackup>>) -> Self {
        let inner = Arc::new(DaemonInner {
            stop: AtomicBool::new(false),
            wake: Notify::new(),
            ticks: AtomicU64::new(0),
        });

        let task_inner = Arc::clone(&inner);
        let handle = tokio::spawn(async move {
            info!(interval_secs = interval.as_secs_f64(), "sync daemon started");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = task_inner.wake.notified() => {}
                }
                if task_inner.stop.load(Ordering::Acquire) {
                    break;
                }
                match Self::tick(&db, online_backup.as_ref()).await {
                    Ok(report) => {
                        task_inner.ticks.fetch_add(1, Ordering::Relaxed);
                        if report.flushed || report.backed_up {
                            debug!(?report, "sync tick");
                        }
                    }
                    Err(err) => error!(%err, "sync tick failed, retrying next interval"),
                }
            }
            info!("sync daemon stopped");
        });

        Self {
            inner,
            handle: Mutex::new(Some(handle)),
            interval,
        }
    }

    /// One flush-and-backup pass, run under the database lock.
    pub async fn tick(db: &Database, online_backup: Option<&Arc<OnlineBackup>>) -> StoreResult<TickReport> {
        let flusher = db.clone();
        let backup = online_backup.cloned();
        db.execute(move |conn| {
            let flushed = flusher.flush_locked(conn)?;
            let backed_up = match &backup {
                Some(backup) => match backup.run_if_due(conn) {
                    Ok(done) => done,
                    Err(err) => {
                        error!(dest = %backup.dest().display(), %err, "online backup failed");
                        false
                    }
                },
                None => false,
            };
            Ok(TickReport { flushed, backed_up })
        })
        .await
    }

    /// Completed ticks since start.
    pub fn ticks(&self) -> u64 {
        self.inner.ticks.load(Ordering::Relaxed)
    }

    /// Ask the task to stop and wait up to one interval plus a small margin
    /// for it to finish. The caller performs the final flush.
    pub async fn stop(&self) {
        self.inner.stop.store(true, Ordering::Release);
        // Stores a permit if the task is mid-tick.
        self.inner.wake.notify_one();

        let handle = match self.handle.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        let Some(mut handle) = handle else {
            return;
        };

        match tokio::time::timeout(self.interval.saturating_add(STOP_MARGIN), &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(%err, "sync daemon task failed"),
            Err(_) => {
                warn!("sync daemon did not stop in time, aborting");
                handle.abort();
            }
        }
    }
}

impl Drop for SyncDaemon {
    fn drop(&mut self) {
        self.inner.stop.store(true, Ordering::Release);
        self.inner.wake.notify_one();
    }
}

// ── tests ────────────────────────────────────────────────────────────
