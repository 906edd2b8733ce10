//! SQLite connection ownership.
//!
//! The [`Database`] struct wraps the single `rusqlite::Connection` behind an
//! `Arc<Mutex<>>`. That mutex is the store's global lock: every statement
//! anywhere in the crate runs inside [`Database::execute`] or
//! [`Database::execute_mut`], which take it on tokio's blocking pool.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::migration::{self, MigrationReport, SchemaOptions};

/// Current time as fractional unix seconds, the unit of every timestamp
/// column in the store.
pub fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Thread-safe handle to the bot database.
///
/// Cloning is cheap; all clones share the connection, the lock and the
/// pending-write counter.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
    dirty: Arc<AtomicU64>,
}

impl Database {
    /// Open (or create) a database at `path` and apply performance pragmas.
    ///
    /// This call blocks briefly (file I/O), so call it during startup or
    /// wrap it in `spawn_blocking` yourself.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening database");

        let conn = Connection::open(path)?;
        Self::apply_pragmas(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
            dirty: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Create an in-memory database, used by tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        debug!("opening in-memory database");

        let conn = Connection::open_in_memory()?;
        Self::apply_pragmas(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
            dirty: Arc::new(AtomicU64::new(0)),
        })
    }

    /// File backing this database, `None` for in-memory databases.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Execute a closure against the connection on the blocking pool while
    /// holding the global lock.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let count: i64 = db.execute(|conn| {
    ///     let count = conn.query_row("SELECT count(*) FROM users", [], |row| row.get(0))?;
    ///     Ok(count)
    /// }).await?;
    /// ```
    pub async fn execute<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| StoreError::TaskJoin(format!("mutex poisoned: {e}")))?;
            f(&conn)
        })
        .await?
    }

    /// Execute a mutable closure (for transactions) on the blocking pool.
    pub async fn execute_mut<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::TaskJoin(format!("mutex poisoned: {e}")))?;
            f(&mut conn)
        })
        .await?
    }

    /// Bring the schema up to date (see [`migration::run_all`]).
    pub async fn run_migrations(&self, options: SchemaOptions) -> StoreResult<MigrationReport> {
        self.execute(move |conn| migration::run_all(conn, options)).await
    }

    // ── pending writes ───────────────────────────────────────────────

    /// Record `n` writes that have not been flushed into the main file yet.
    pub fn mark_dirty(&self, n: u64) {
        if n > 0 {
            self.dirty.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Writes recorded since the last flush.
    pub fn pending_writes(&self) -> u64 {
        self.dirty.load(Ordering::Relaxed)
    }

    /// Checkpoint the WAL into the main database file if anything was
    /// written since the last flush. Must be called with the lock held,
    /// i.e. from inside an `execute` closure.
    ///
    /// Returns `true` when a checkpoint ran.
    pub fn flush_locked(&self, conn: &Connection) -> StoreResult<bool> {
        let pending = self.dirty.swap(0, Ordering::Relaxed);
        if pending == 0 {
            return Ok(false);
        }

        let result = conn.query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
        });
        match result {
            Ok((busy, log_frames, checkpointed)) => {
                debug!(pending, busy, log_frames, checkpointed, "flushed pending writes");
                Ok(true)
            }
            Err(err) => {
                // Keep the writes pending so the next tick tries again.
                self.dirty.fetch_add(pending, Ordering::Relaxed);
                Err(err.into())
            }
        }
    }

    /// Flush pending writes (see [`Database::flush_locked`]).
    pub async fn flush(&self) -> StoreResult<bool> {
        let this = self.clone();
        self.execute(move |conn| this.flush_locked(conn)).await
    }

    /// Rebuild the database file, reclaiming free pages.
    pub async fn vacuum(&self) -> StoreResult<()> {
        let this = self.clone();
        self.execute(move |conn| {
            this.flush_locked(conn)?;
            conn.execute_batch("VACUUM;")?;
            info!("database vacuumed");
            Ok(())
        })
        .await
    }

    /// Final flush, then release the connection.
    ///
    /// If other clones of this handle are still alive the connection stays
    /// open until the last of them is dropped.
    pub async fn close(self) -> StoreResult<()> {
        self.flush().await?;

        let Self { conn, .. } = self;
        match Arc::try_unwrap(conn) {
            Ok(mutex) => {
                let conn = mutex
                    .into_inner()
                    .map_err(|e| StoreError::TaskJoin(format!("mutex poisoned: {e}")))?;
                conn.close().map_err(|(_, err)| StoreError::Sqlite(err))?;
                info!("database closed");
            }
            Err(_) => warn!("database still shared, connection closes with the last handle"),
        }
        Ok(())
    }

    // ── pragmas ──────────────────────────────────────────────────────

    /// Apply all performance pragmas to a fresh connection.
    fn apply_pragmas(conn: &Connection) -> StoreResult<()> {
        debug!("applying SQLite performance pragmas");

        // WAL mode: readers never wait for the checkpoint.
        conn.pragma_update(None, "journal_mode", "WAL")?;

        // NORMAL sync is safe with WAL: a power failure can lose the last
        // transaction, not corrupt the file.
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        // 256 MiB memory-mapped I/O.
        conn.pragma_update(None, "mmap_size", 268_435_456_i64)?;

        // Negative value means KiB: -64000 = ~62 MiB page cache.
        conn.pragma_update(None, "cache_size", -64_000_i32)?;

        conn.pragma_update(None, "temp_store", "MEMORY")?;

        // The sync daemon checkpoints explicitly; keep automatic
        // checkpoints as a backstop for write bursts between ticks.
        conn.pragma_update(None, "wal_autocheckpoint", 1000_i32)?;

        conn.pragma_update(None, "busy_timeout", 5_000_i32)?;

        info!("database pragmas applied (WAL, mmap 256MiB, cache 62MiB)");
        Ok(())
    }
}

// ── tests ────────────────────────────────────────────────────────────
