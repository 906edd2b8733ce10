//! Usage ledger.
//!
//! One row per completed request in `usage_events`. Rows are never updated;
//! exact `(user, timestamp, model)` repeats are dropped on insert and rows
//! past the retention horizon are pruned at startup.
//!
//! Request handlers do not write to the ledger directly. They hand events
//! to a [`UsageRecorder`], a bounded queue drained by a small worker pool,
//! so recording never waits on the database lock.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{Days, Local, NaiveDate, TimeZone};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::db::{Database, unix_now};
use crate::error::{StoreError, StoreResult};
use crate::user_store;

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// Which models a count covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelFilter {
    /// Every model (`"all"`).
    Any,
    /// One model by name.
    Model(String),
}

impl FromStr for ModelFilter {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "all" => Self::Any,
            other => Self::Model(other.to_string()),
        })
    }
}

impl fmt::Display for ModelFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("all"),
            Self::Model(m) => f.write_str(m),
        }
    }
}

/// One completed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub user_id: String,
    pub model: String,
    /// Unix seconds.
    pub timestamp: f64,
}

impl UsageEvent {
    /// An event stamped with the current time.
    pub fn now(user_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self::at(user_id, model, unix_now())
    }

    pub fn at(user_id: impl Into<String>, model: impl Into<String>, timestamp: f64) -> Self {
        Self {
            user_id: user_id.into(),
            model: model.into(),
            timestamp,
        }
    }
}

/// Per-model request counts of one local calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyModelUsage {
    pub date: NaiveDate,
    pub models: BTreeMap<String, i64>,
}

/// A count attached to one local calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DailyCount {
    pub date: NaiveDate,
    pub count: i64,
}

// ═══════════════════════════════════════════════════════════════════════
//  UsageLedger
// ═══════════════════════════════════════════════════════════════════════

/// Append-only usage table and its aggregate queries.
#[derive(Clone)]
pub struct UsageLedger {
    db: Database,
}

impl UsageLedger {
    /// Create a ledger backed by `db`.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append an event unless an identical one is already stored.
    ///
    /// Returns `true` when a row was inserted.
    #[instrument(skip(self), fields(user_id = %event.user_id, model = %event.model))]
    pub async fn record(&self, event: UsageEvent) -> StoreResult<bool> {
        let db = self.db.clone();
        self.db
            .execute(move |conn| {
                let exists: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM usage_events
                     WHERE user_id = ?1 AND access_time = ?2 AND model_used = ?3",
                    rusqlite::params![event.user_id, event.timestamp, event.model],
                    |row| row.get(0),
                )?;
                if exists > 0 {
                    debug!("duplicate usage event skipped");
                    return Ok(false);
                }
                conn.execute(
                    "INSERT INTO usage_events (user_id, access_time, model_used) VALUES (?1, ?2, ?3)",
                    rusqlite::params![event.user_id, event.timestamp, event.model],
                )?;
                db.mark_dirty(1);
                Ok(true)
            })
            .await
    }

    /// Requests by `user_id` within the last `window`.
    #[instrument(skip(self))]
    pub async fn count_since(&self, user_id: &str, model: &ModelFilter, window: Duration) -> StoreResult<i64> {
        let user_id = user_id.to_string();
        let model = model.clone();
        let since = unix_now() - window.as_secs_f64();
        self.db
            .execute(move |conn| {
                let count = match model {
                    ModelFilter::Any => conn.query_row(
                        "SELECT COUNT(*) FROM usage_events WHERE user_id = ?1 AND access_time > ?2",
                        rusqlite::params![user_id, since],
                        |row| row.get(0),
                    )?,
                    ModelFilter::Model(model) => conn.query_row(
                        "SELECT COUNT(*) FROM usage_events
                         WHERE user_id = ?1 AND model_used = ?2 AND access_time > ?3",
                        rusqlite::params![user_id, model, since],
                        |row| row.get(0),
                    )?,
                };
                Ok(count)
            })
            .await
    }

    /// Every recorded request.
    pub async fn count_all(&self) -> StoreResult<i64> {
        self.scalar("SELECT COUNT(*) FROM usage_events", None).await
    }

    /// Users with at least one recorded request.
    pub async fn distinct_users(&self) -> StoreResult<i64> {
        self.scalar("SELECT COUNT(DISTINCT user_id) FROM usage_events", None)
            .await
    }

    /// Users with a request within the last `window`.
    pub async fn distinct_users_since(&self, window: Duration) -> StoreResult<i64> {
        self.scalar(
            "SELECT COUNT(DISTINCT user_id) FROM usage_events WHERE access_time > ?1",
            Some(unix_now() - window.as_secs_f64()),
        )
        .await
    }

    /// Users first met within the last `window` who have made at least one
    /// request.
    pub async fn new_users_since(&self, window: Duration) -> StoreResult<i64> {
        self.scalar(
            "SELECT COUNT(DISTINCT e.user_id)
             FROM usage_events AS e
             INNER JOIN users AS u ON e.user_id = u.id
             WHERE u.first_meet > ?1",
            Some(unix_now() - window.as_secs_f64()),
        )
        .await
    }

    /// Requests per model within the last `window`.
    #[instrument(skip(self))]
    pub async fn model_usage_since(&self, window: Duration) -> StoreResult<BTreeMap<String, i64>> {
        let since = unix_now() - window.as_secs_f64();
        self.db
            .execute(move |conn| model_usage_between(conn, since, f64::MAX))
            .await
    }

    /// Timestamp of the first request by `user_id`.
    pub async fn first_seen(&self, user_id: &str) -> StoreResult<Option<f64>> {
        let user_id = user_id.to_string();
        self.db
            .execute(move |conn| user_store::first_seen(conn, &user_id))
            .await
    }

    /// Per-model counts for the `days` local days ending yesterday, oldest
    /// first.
    #[instrument(skip(self))]
    pub async fn model_usage_per_day(&self, days: u32) -> StoreResult<Vec<DailyModelUsage>> {
        let windows = day_windows(Local::now().date_naive(), days);
        self.db
            .execute(move |conn| {
                windows
                    .into_iter()
                    .map(|(date, start, end)| -> StoreResult<DailyModelUsage> {
                        Ok(DailyModelUsage {
                            date,
                            models: model_usage_between(conn, start, end)?,
                        })
                    })
                    .collect()
            })
            .await
    }

    /// Distinct active users for the `days` local days ending yesterday,
    /// oldest first.
    pub async fn active_users_per_day(&self, days: u32) -> StoreResult<Vec<DailyCount>> {
        self.daily_counts(
            "SELECT COUNT(DISTINCT user_id) FROM usage_events
             WHERE access_time >= ?1 AND access_time < ?2",
            days,
        )
        .await
    }

    /// Users first met on each of the `days` local days ending yesterday
    /// who have made at least one request, oldest first.
    pub async fn new_users_per_day(&self, days: u32) -> StoreResult<Vec<DailyCount>> {
        self.daily_counts(
            "SELECT COUNT(DISTINCT e.user_id)
             FROM usage_events AS e
             INNER JOIN users AS u ON e.user_id = u.id
             WHERE u.first_meet >= ?1 AND u.first_meet < ?2",
            days,
        )
        .await
    }

    /// Delete events older than `horizon`. Returns the number removed.
    #[instrument(skip(self))]
    pub async fn prune_older_than(&self, horizon: Duration) -> StoreResult<usize> {
        let cutoff = unix_now() - horizon.as_secs_f64();
        let db = self.db.clone();
        self.db
            .execute(move |conn| {
                let removed = conn.execute(
                    "DELETE FROM usage_events WHERE access_time < ?1",
                    rusqlite::params![cutoff],
                )?;
                db.mark_dirty(removed as u64);
                if removed > 0 {
                    info!(removed, "old usage events pruned");
                }
                Ok(removed)
            })
            .await
    }

    async fn scalar(&self, sql: &'static str, since: Option<f64>) -> StoreResult<i64> {
        self.db
            .execute(move |conn| {
                let count = match since {
                    Some(since) => conn.query_row(sql, rusqlite::params![since], |row| row.get(0))?,
                    None => conn.query_row(sql, [], |row| row.get(0))?,
                };
                Ok(count)
            })
            .await
    }

    async fn daily_counts(&self, sql: &'static str, days: u32) -> StoreResult<Vec<DailyCount>> {
        let windows = day_windows(Local::now().date_naive(), days);
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(sql)?;
                let counts = windows
                    .into_iter()
                    .map(|(date, start, end)| -> StoreResult<DailyCount> {
                        let count = stmt.query_row(rusqlite::params![start, end], |row| row.get(0))?;
                        Ok(DailyCount { date, count })
                    })
                    .collect::<StoreResult<Vec<_>>>()?;
                Ok(counts)
            })
            .await
    }
}

fn model_usage_between(conn: &Connection, start: f64, end: f64) -> StoreResult<BTreeMap<String, i64>> {
    let mut stmt = conn.prepare(
        "SELECT model_used, COUNT(*) FROM usage_events
         WHERE access_time >= ?1 AND access_time < ?2
         GROUP BY model_used",
    )?;
    let usage = stmt
        .query_map(rusqlite::params![start, end], |row| {
            Ok((row.get::<_, Option<String>>(0)?.unwrap_or_default(), row.get::<_, i64>(1)?))
        })?
        .collect::<Result<BTreeMap<_, _>, _>>()?;
    Ok(usage)
}

/// `(date, start, end)` for the `days` local days before `today`, oldest
/// first. `end` is the next local midnight, so DST days are 23 or 25 hours.
pub(crate) fn day_windows(today: NaiveDate, days: u32) -> Vec<(NaiveDate, f64, f64)> {
    (1..=u64::from(days))
        .rev()
        .filter_map(|back| {
            let date = today.checked_sub_days(Days::new(back))?;
            let next = date.succ_opt()?;
            Some((date, local_midnight(date), local_midnight(next)))
        })
        .collect()
}

/// Unix seconds of local midnight starting `date`.
pub(crate) fn local_midnight(date: NaiveDate) -> f64 {
    let naive = date.and_time(chrono::NaiveTime::MIN);
    match Local.from_local_datetime(&naive).earliest() {
        Some(dt) => dt.timestamp() as f64,
        // Midnight skipped by a DST jump; treat the day as starting at UTC.
        None => naive.and_utc().timestamp() as f64,
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  UsageRecorder
// ═══════════════════════════════════════════════════════════════════════

/// Fire-and-forget front end of the [`UsageLedger`].
///
/// [`UsageRecorder::record`] never blocks: events go onto a bounded queue
/// that a pool of workers drains into the ledger. When the queue is full
/// the event is dropped with a warning.
#[derive(Clone)]
pub struct UsageRecorder {
    inner: Arc<RecorderInner>,
}

struct RecorderInner {
    /// `None` once shut down; dropping the sender closes the queue.
    tx: Mutex<Option<mpsc::Sender<UsageEvent>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Events accepted but not yet written.
    pending: AtomicUsize,
    /// Signalled whenever `pending` drops to zero.
    idle: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl UsageRecorder {
    /// Spawn `workers` tasks draining a queue of `capacity` events into
    /// `ledger`. Must be called from within a tokio runtime.
    pub fn start(ledger: UsageLedger, capacity: usize, workers: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let inner = Arc::new(RecorderInner {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(Vec::new()),
            pending: AtomicUsize::new(0),
            idle: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });

        let handles: Vec<_> = (0..workers.max(1))
            .map(|n| {
                let inner = Arc::clone(&inner);
                let rx = Arc::clone(&rx);
                let ledger = ledger.clone();
                tokio::spawn(async move {
                    debug!(worker = n, "usage worker started");
                    Self::worker_loop(&inner, &rx, &ledger).await;
                    debug!(worker = n, "usage worker stopped");
                })
            })
            .collect();

        if let Ok(mut slot) = inner.workers.lock() {
            *slot = handles;
        }
        info!(capacity, workers, "usage recorder started");

        Self { inner }
    }

    /// Queue an event. Returns `false` if it was dropped (queue full or
    /// recorder shut down).
    pub fn record(&self, event: UsageEvent) -> bool {
        let Ok(tx) = self.inner.tx.lock() else {
            return false;
        };
        let Some(tx) = tx.as_ref() else {
            debug!("usage recorder closed, event dropped");
            return false;
        };

        self.inner.pending.fetch_add(1, Ordering::AcqRel);
        match tx.try_send(event) {
            Ok(()) => true,
            Err(err) => {
                self.finish_one();
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                match err {
                    mpsc::error::TrySendError::Full(event) => {
                        warn!(user_id = %event.user_id, model = %event.model, "usage queue full, event dropped");
                    }
                    mpsc::error::TrySendError::Closed(_) => debug!("usage queue closed, event dropped"),
                }
                false
            }
        }
    }

    /// Wait until every event queued so far has been written.
    pub async fn flush(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Events accepted but not yet written.
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    /// Events refused since start.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Close the queue, let the workers drain it, and wait for them.
    pub async fn shutdown(&self) -> StoreResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(pending = self.pending(), "usage recorder shutting down");

        let handles = {
            let mut tx = self
                .inner
                .tx
                .lock()
                .map_err(|e| StoreError::TaskJoin(format!("mutex poisoned: {e}")))?;
            tx.take();
            let mut workers = self
                .inner
                .workers
                .lock()
                .map_err(|e| StoreError::TaskJoin(format!("mutex poisoned: {e}")))?;
            std::mem::take(&mut *workers)
        };

        for handle in handles {
            handle.await?;
        }
        Ok(())
    }

    fn finish_one(&self) {
        Self::finish(&self.inner);
    }

    fn finish(inner: &RecorderInner) {
        if inner.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            inner.idle.notify_waiters();
        }
    }

    async fn worker_loop(
        inner: &RecorderInner,
        rx: &tokio::sync::Mutex<mpsc::Receiver<UsageEvent>>,
        ledger: &UsageLedger,
    ) {
        loop {
            let event = { rx.lock().await.recv().await };
            let Some(event) = event else {
                break;
            };
            if let Err(err) = ledger.record(event).await {
                error!(%err, "failed to record usage event");
            }
            Self::finish(inner);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════
