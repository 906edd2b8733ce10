//! Translation cache.
//!
//! Maps `(original, lang, help)` to a translation so interface strings are
//! sent to the external translator only once. `help` is the free-form hint
//! that accompanied the request; an empty hint is a distinct key.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::db::Database;
use crate::error::StoreResult;

/// One cached translation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslationEntry {
    pub original: String,
    pub lang: String,
    pub help: String,
    pub translation: String,
}

impl TranslationEntry {
    pub fn new(
        original: impl Into<String>,
        lang: impl Into<String>,
        help: impl Into<String>,
        translation: impl Into<String>,
    ) -> Self {
        Self {
            original: original.into(),
            lang: lang.into(),
            help: help.into(),
            translation: translation.into(),
        }
    }
}

/// Persistent translation cache backed by the `translations` table.
#[derive(Clone)]
pub struct TranslationCache {
    db: Database,
}

impl TranslationCache {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Cached translation, `None` on miss.
    #[instrument(skip(self, original), fields(len = original.len()))]
    pub async fn get(&self, original: &str, lang: &str, help: &str) -> StoreResult<Option<String>> {
        let (original, lang, help) = (original.to_string(), lang.to_string(), help.to_string());
        self.db
            .execute(move |conn| {
                let result = conn.query_row(
                    "SELECT translation FROM translations
                     WHERE original = ?1 AND lang = ?2 AND help = ?3
                     ORDER BY id DESC LIMIT 1",
                    rusqlite::params![original, lang, help],
                    |row| row.get(0),
                );
                match result {
                    Ok(translation) => Ok(Some(translation)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await
    }

    /// Insert or update one translation.
    #[instrument(skip(self, entry), fields(lang = %entry.lang))]
    pub async fn put(&self, entry: TranslationEntry) -> StoreResult<()> {
        let db = self.db.clone();
        self.db
            .execute(move |conn| {
                let updated = conn.execute(
                    "UPDATE translations SET translation = ?1
                     WHERE original = ?2 AND lang = ?3 AND help = ?4",
                    rusqlite::params![entry.translation, entry.original, entry.lang, entry.help],
                )?;
                if updated == 0 {
                    conn.execute(
                        "INSERT INTO translations (original, lang, help, translation)
                         VALUES (?1, ?2, ?3, ?4)",
                        rusqlite::params![entry.original, entry.lang, entry.help, entry.translation],
                    )?;
                }
                db.mark_dirty(1);
                debug!(updated = updated > 0, "translation stored");
                Ok(())
            })
            .await
    }

    /// Replace the whole cache with `entries` in one transaction.
    #[instrument(skip(self, entries), fields(count = entries.len()))]
    pub async fn replace_all(&self, entries: Vec<TranslationEntry>) -> StoreResult<usize> {
        let db = self.db.clone();
        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                let removed = tx.execute("DELETE FROM translations", [])?;
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO translations (original, lang, help, translation)
                         VALUES (?1, ?2, ?3, ?4)",
                    )?;
                    for e in &entries {
                        stmt.execute(rusqlite::params![e.original, e.lang, e.help, e.translation])?;
                    }
                }
                tx.commit()?;
                db.mark_dirty((removed + entries.len()) as u64);
                info!(removed, inserted = entries.len(), "translation cache replaced");
                Ok(entries.len())
            })
            .await
    }

    /// Delete translations longer than `max_chars` characters. Returns the
    /// number removed.
    #[instrument(skip(self))]
    pub async fn prune_longer_than(&self, max_chars: usize) -> StoreResult<usize> {
        let max_chars = i64::try_from(max_chars).unwrap_or(i64::MAX);
        let db = self.db.clone();
        self.db
            .execute(move |conn| {
                let removed = conn.execute(
                    "DELETE FROM translations WHERE LENGTH(translation) > ?1",
                    rusqlite::params![max_chars],
                )?;
                db.mark_dirty(removed as u64);
                info!(removed, max_chars, "long translations pruned");
                Ok(removed)
            })
            .await
    }

    /// Number of cached translations.
    pub async fn count(&self) -> StoreResult<i64> {
        self.db
            .execute(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM translations", [], |row| row.get(0))?)
            })
            .await
    }

    /// Entries whose translation contains `fragment` (case-insensitive for
    /// ASCII, as SQLite `LIKE`).
    #[instrument(skip(self))]
    pub async fn search(&self, fragment: &str) -> StoreResult<Vec<TranslationEntry>> {
        let pattern = format!("%{}%", escape_like(fragment));
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT original, lang, help, translation FROM translations
                     WHERE translation LIKE ?1 ESCAPE '\\'
                     ORDER BY id",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![pattern], |row| {
                        Ok(TranslationEntry {
                            original: row.get(0)?,
                            lang: row.get(1)?,
                            help: row.get(2)?,
                            translation: row.get(3)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

/// Escape `LIKE` wildcards so `fragment` matches literally.
fn escape_like(fragment: &str) -> String {
    let mut out = String::with_capacity(fragment.len());
    for c in fragment.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

// ── tests ────────────────────────────────────────────────────────────
