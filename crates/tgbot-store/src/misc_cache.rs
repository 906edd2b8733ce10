//! Small keyed text caches.
//!
//! Two tables share one shape: `misc_cache` holds short opaque texts keyed
//! by URL (page summaries and the like) and `im_suggests` holds image
//! prompts keyed by a hash. Both are cheap to keep but expensive to
//! recompute. Every write also drops entries older than the configured
//! TTL, so neither table grows without bound.

use std::time::Duration;

use tracing::{debug, instrument};

use crate::db::{Database, unix_now};
use crate::error::StoreResult;

/// Table and column names of one keyed cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTable {
    pub table: &'static str,
    pub key: &'static str,
    pub value: &'static str,
}

/// `url -> text`.
pub const SUMMARIES: CacheTable = CacheTable {
    table: "misc_cache",
    key: "url",
    value: "text",
};

/// `hash -> prompt`.
pub const IMAGE_SUGGESTIONS: CacheTable = CacheTable {
    table: "im_suggests",
    key: "hash",
    value: "prompt",
};

/// Persistent `key -> text` cache with age-based pruning.
#[derive(Clone)]
pub struct MiscCache {
    db: Database,
    ttl: Duration,
    table: CacheTable,
}

impl MiscCache {
    /// The URL cache backed by `db`; entries older than `ttl` are pruned
    /// on every write.
    pub fn new(db: Database, ttl: Duration) -> Self {
        Self::with_table(db, ttl, SUMMARIES)
    }

    /// The image prompt cache backed by `db`.
    pub fn image_suggestions(db: Database, ttl: Duration) -> Self {
        Self::with_table(db, ttl, IMAGE_SUGGESTIONS)
    }

    pub fn with_table(db: Database, ttl: Duration, table: CacheTable) -> Self {
        Self { db, ttl, table }
    }

    pub fn table(&self) -> CacheTable {
        self.table
    }

    /// Get the text stored for `key`, returning `None` if not found.
    #[instrument(skip(self), fields(table = self.table.table))]
    pub async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let key = key.to_string();
        let CacheTable { table, key: key_col, value } = self.table;
        self.db
            .execute(move |conn| {
                let result = conn.query_row(
                    &format!("SELECT {value} FROM {table} WHERE {key_col} = ?1 ORDER BY date DESC LIMIT 1"),
                    rusqlite::params![key],
                    |row| row.get(0),
                );
                match result {
                    Ok(text) => Ok(Some(text)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await
    }

    /// Store `text` for `key` (insert or update), then prune expired
    /// entries. Returns the number of entries pruned.
    #[instrument(skip(self, text), fields(table = self.table.table, len = text.len()))]
    pub async fn set(&self, key: &str, text: &str) -> StoreResult<usize> {
        let key = key.to_string();
        let text = text.to_string();
        let ttl = self.ttl.as_secs_f64();
        let CacheTable { table, key: key_col, value } = self.table;
        let db = self.db.clone();
        self.db
            .execute(move |conn| {
                let now = unix_now();
                let updated = conn.execute(
                    &format!("UPDATE {table} SET {value} = ?1, date = ?2 WHERE {key_col} = ?3"),
                    rusqlite::params![text, now, key],
                )?;
                if updated == 0 {
                    conn.execute(
                        &format!("INSERT INTO {table} ({key_col}, date, {value}) VALUES (?1, ?2, ?3)"),
                        rusqlite::params![key, now, text],
                    )?;
                }
                let pruned = conn.execute(
                    &format!("DELETE FROM {table} WHERE date < ?1"),
                    rusqlite::params![now - ttl],
                )?;
                db.mark_dirty(1 + pruned as u64);
                debug!(table, key = %key, pruned, "cache entry updated");
                Ok(pruned)
            })
            .await
    }

    /// Delete the entry for `key`, returning `true` if it existed.
    #[instrument(skip(self), fields(table = self.table.table))]
    pub async fn delete(&self, key: &str) -> StoreResult<bool> {
        let key = key.to_string();
        let CacheTable { table, key: key_col, .. } = self.table;
        let db = self.db.clone();
        self.db
            .execute(move |conn| {
                let deleted = conn.execute(
                    &format!("DELETE FROM {table} WHERE {key_col} = ?1"),
                    rusqlite::params![key],
                )?;
                db.mark_dirty(deleted as u64);
                Ok(deleted > 0)
            })
            .await
    }
}

// ── tests ────────────────────────────────────────────────────────────
