//! Per-user properties.
//!
//! Every user is one row of the wide `users` table and every
//! [`UserProperty`] is one column of it. Reads go through the
//! [`SmartCache`] first; writes go to SQLite and then to the cache, both
//! while the database lock is held, so the cache can never be left holding
//! a value older than the row.
//!
//! Encoded properties (dialogue histories, the saved file) are stored as
//! [`codec`](crate::codec) blobs. The cache always holds the logical value,
//! never the compressed bytes.

use std::time::Duration;

use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info, instrument, warn};

use crate::cache::{CacheKey, SmartCache};
use crate::codec;
use crate::db::{Database, unix_now};
use crate::error::{StoreError, StoreResult};
use crate::property::{CodecPolicy, ColumnType, PropertyValue, UserProperty};

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// Rows touched by [`PropertyStore::clear_stale_data`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Users whose saved file was dropped.
    pub files_cleared: usize,
    /// Users whose dialogue histories were dropped.
    pub dialogs_cleared: usize,
}

// ═══════════════════════════════════════════════════════════════════════
//  PropertyStore
// ═══════════════════════════════════════════════════════════════════════

/// Cache-aside access to the `users` table.
#[derive(Clone)]
pub struct PropertyStore {
    db: Database,
    cache: SmartCache,
    saved_file_max_bytes: usize,
}

impl PropertyStore {
    /// Create a property store backed by `db` and `cache`. Capped encoded
    /// properties are truncated to `saved_file_max_bytes`.
    pub fn new(db: Database, cache: SmartCache, saved_file_max_bytes: usize) -> Self {
        Self {
            db,
            cache,
            saved_file_max_bytes,
        }
    }

    /// The cache in front of the table.
    pub fn cache(&self) -> &SmartCache {
        &self.cache
    }

    /// Read a property. `None` when the user does not exist, the column is
    /// NULL, or an encoded value cannot be decoded.
    #[instrument(skip(self))]
    pub async fn get(&self, user_id: &str, property: UserProperty) -> StoreResult<Option<PropertyValue>> {
        let key = CacheKey::new(user_id, property.as_str());
        if let Some(value) = self.cache.get(&key) {
            return Ok(present(value));
        }

        let user_id = user_id.to_string();
        let cache = self.cache.clone();
        self.db
            .execute(move |conn| {
                let value = read_column(conn, &user_id, property)?;
                // Populated under the lock: a concurrent write either
                // happened before this read or will overwrite this entry.
                cache.set(key, value.clone());
                debug!(user_id = %user_id, %property, "property loaded from database");
                Ok(present(value))
            })
            .await
    }

    /// Write a property, creating the user row on first write.
    ///
    /// Plain properties must match their column type
    /// ([`UserProperty::coerce`]). Encoded properties accept any value; a
    /// capped one has text and bytes truncated first.
    #[instrument(skip(self, value), fields(kind = value.kind()))]
    pub async fn set(&self, user_id: &str, property: UserProperty, value: PropertyValue) -> StoreResult<()> {
        let logical = self.prepare(property, value)?;
        let stored = stored_form(property, &logical)?;

        let key = CacheKey::new(user_id, property.as_str());
        let user_id = user_id.to_string();
        let cache = self.cache.clone();
        let db = self.db.clone();
        self.db
            .execute(move |conn| match write_column(conn, &user_id, property, stored) {
                Ok(created) => {
                    db.mark_dirty(1);
                    if let Some(first_meet) = created {
                        // A Null may have been cached for the new row.
                        cache.set(CacheKey::new(&user_id, UserProperty::FirstMeet.as_str()), first_meet);
                        info!(user_id = %user_id, "user created");
                    }
                    cache.set(key, logical);
                    Ok(())
                }
                Err(err) => {
                    cache.delete(&key);
                    Err(err)
                }
            })
            .await
    }

    /// Clear a property. A missing user or an already-NULL column is a no-op.
    ///
    /// Returns `true` when a stored value was cleared.
    #[instrument(skip(self))]
    pub async fn delete(&self, user_id: &str, property: UserProperty) -> StoreResult<bool> {
        let key = CacheKey::new(user_id, property.as_str());
        let user_id = user_id.to_string();
        let cache = self.cache.clone();
        let db = self.db.clone();
        self.db
            .execute(move |conn| {
                let sql = format!(
                    "UPDATE users SET {col} = NULL WHERE id = ?1 AND {col} IS NOT NULL",
                    col = property.as_str()
                );
                let result = conn.execute(&sql, rusqlite::params![user_id]);
                cache.delete(&key);
                let cleared = result?;
                db.mark_dirty(cleared as u64);
                if cleared == 0 {
                    debug!(user_id = %user_id, %property, "nothing to delete");
                }
                Ok(cleared > 0)
            })
            .await
    }

    /// Ids of every known user, oldest first.
    #[instrument(skip(self))]
    pub async fn all_user_ids(&self) -> StoreResult<Vec<String>> {
        self.db
            .execute(|conn| {
                let mut stmt = conn.prepare("SELECT id FROM users ORDER BY id_num")?;
                let ids = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok(ids)
            })
            .await
    }

    /// Ids of users with an integer flag column set to 1 (for example
    /// [`UserProperty::Blocked`]).
    #[instrument(skip(self))]
    pub async fn user_ids_with_flag(&self, flag: UserProperty) -> StoreResult<Vec<String>> {
        if flag.column_type() != ColumnType::Integer {
            return Err(StoreError::InvalidArgument(format!(
                "{flag} is not a flag column"
            )));
        }
        self.db
            .execute(move |conn| {
                let sql = format!("SELECT id FROM users WHERE {} = 1 ORDER BY id_num", flag.as_str());
                let mut stmt = conn.prepare(&sql)?;
                let ids = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok(ids)
            })
            .await
    }

    /// Drop saved files of users idle for longer than `file_age`, and
    /// dialogue histories plus persistent memory of users idle for longer
    /// than `dialog_age`. Clears the cache afterwards.
    #[instrument(skip(self))]
    pub async fn clear_stale_data(&self, file_age: Duration, dialog_age: Duration) -> StoreResult<MaintenanceReport> {
        let cache = self.cache.clone();
        let db = self.db.clone();
        self.db
            .execute(move |conn| {
                let now = unix_now();
                let files_cleared = conn.execute(
                    "UPDATE users SET saved_file = NULL, saved_file_name = NULL
                     WHERE last_time_access < ?1
                       AND (saved_file IS NOT NULL OR saved_file_name IS NOT NULL)",
                    rusqlite::params![now - file_age.as_secs_f64()],
                )?;

                let mut columns: Vec<&str> = UserProperty::dialogs().map(UserProperty::as_str).collect();
                columns.push(UserProperty::PersistantMemory.as_str());
                let assignments = columns
                    .iter()
                    .map(|c| format!("{c} = NULL"))
                    .collect::<Vec<_>>()
                    .join(", ");
                let any_set = columns
                    .iter()
                    .map(|c| format!("{c} IS NOT NULL"))
                    .collect::<Vec<_>>()
                    .join(" OR ");
                let sql = format!(
                    "UPDATE users SET {assignments} WHERE last_time_access < ?1 AND ({any_set})"
                );
                let dialogs_cleared =
                    conn.execute(&sql, rusqlite::params![now - dialog_age.as_secs_f64()])?;

                cache.clear();
                db.mark_dirty((files_cleared + dialogs_cleared) as u64);

                let report = MaintenanceReport {
                    files_cleared,
                    dialogs_cleared,
                };
                info!(files_cleared, dialogs_cleared, "stale user data cleared");
                Ok(report)
            })
            .await
    }

    /// Normalise `value` into the logical form that is both stored and
    /// cached.
    fn prepare(&self, property: UserProperty, value: PropertyValue) -> StoreResult<PropertyValue> {
        let value = property.coerce(value)?;
        Ok(match property.codec_policy() {
            CodecPolicy::Encoded { capped: true } => {
                let before = value.approx_size();
                let value = value.truncated(self.saved_file_max_bytes);
                if value.approx_size() < before {
                    warn!(%property, max = self.saved_file_max_bytes, "value truncated");
                }
                value
            }
            _ => value,
        })
    }
}

// ── row access (lock held) ───────────────────────────────────────────

/// NULL reads as absent.
fn present(value: PropertyValue) -> Option<PropertyValue> {
    (!value.is_null()).then_some(value)
}

/// SQL value written for a logical value.
fn stored_form(property: UserProperty, logical: &PropertyValue) -> StoreResult<rusqlite::types::Value> {
    match property.codec_policy() {
        CodecPolicy::Encoded { .. } if !logical.is_null() => {
            Ok(rusqlite::types::Value::Blob(codec::try_encode(logical)?))
        }
        _ => logical.to_sql_value(),
    }
}

/// Read one column and turn it back into its logical value. A missing row
/// reads as `Null`.
fn read_column(conn: &Connection, user_id: &str, property: UserProperty) -> StoreResult<PropertyValue> {
    let sql = format!("SELECT {} FROM users WHERE id = ?1", property.as_str());
    let raw = conn
        .query_row(&sql, rusqlite::params![user_id], |row| {
            Ok(PropertyValue::from_sql_ref(row.get_ref(0)?))
        })
        .optional()?
        .unwrap_or(PropertyValue::Null);

    Ok(match (property.codec_policy(), raw) {
        (CodecPolicy::Encoded { .. }, PropertyValue::Blob(bytes)) => {
            // Corrupt blobs read as absent; codec logs the failure.
            codec::decode::<PropertyValue>(Some(&bytes)).unwrap_or(PropertyValue::Null)
        }
        (_, other) => other,
    })
}

/// Update the row, or insert it when the user is new. Returns the
/// `first_meet` stamped on a freshly created row.
fn write_column(
    conn: &Connection,
    user_id: &str,
    property: UserProperty,
    stored: rusqlite::types::Value,
) -> StoreResult<Option<PropertyValue>> {
    let col = property.as_str();
    let updated = conn.execute(
        &format!("UPDATE users SET {col} = ?1 WHERE id = ?2"),
        rusqlite::params![stored, user_id],
    )?;
    if updated > 0 {
        return Ok(None);
    }

    if property == UserProperty::FirstMeet {
        let first_meet = match stored {
            rusqlite::types::Value::Real(f) => PropertyValue::Real(f),
            _ => PropertyValue::Null,
        };
        conn.execute(
            "INSERT INTO users (id, first_meet) VALUES (?1, ?2)",
            rusqlite::params![user_id, stored],
        )?;
        return Ok(Some(first_meet));
    }

    let first_meet = first_seen(conn, user_id)?.unwrap_or_else(unix_now);
    conn.execute(
        &format!("INSERT INTO users (id, {col}, first_meet) VALUES (?1, ?2, ?3)"),
        rusqlite::params![user_id, stored, first_meet],
    )?;
    Ok(Some(PropertyValue::Real(first_meet)))
}

/// Earliest usage event of `user_id`.
pub(crate) fn first_seen(conn: &Connection, user_id: &str) -> StoreResult<Option<f64>> {
    let first: Option<f64> = conn.query_row(
        "SELECT MIN(access_time) FROM usage_events WHERE user_id = ?1",
        rusqlite::params![user_id],
        |row| row.get(0),
    )?;
    Ok(first)
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::migration::SchemaOptions;

    const MAX_FILE: usize = 1000;

    async fn setup_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations(SchemaOptions::default()).await.unwrap();
        db
    }

    async fn setup() -> (Database, PropertyStore) {
        let db = setup_db().await;
        let store = PropertyStore::new(db.clone(), SmartCache::new(1000, 10 * 1024), MAX_FILE);
        (db, store)
    }

    async fn raw(db: &Database, user_id: &str, property: UserProperty) -> PropertyValue {
        let user_id = user_id.to_string();
        db.execute(move |conn| {
            let sql = format!("SELECT {} FROM users WHERE id = ?1", property.as_str());
            let v = conn
                .query_row(&sql, rusqlite::params![user_id], |row| {
                    Ok(PropertyValue::from_sql_ref(row.get_ref(0)?))
                })
                .optional()?;
            Ok(v.unwrap_or(PropertyValue::Null))
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn unknown_user_reads_as_absent() {
        let (_db, store) = setup().await;
        assert!(store.get("nobody", UserProperty::Role).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn set_then_get_returns_value() {
        let (db, store) = setup().await;
        store.set("u1", UserProperty::Role, "helper".into()).await.unwrap();

        assert_eq!(
            store.get("u1", UserProperty::Role).await.unwrap(),
            Some(PropertyValue::from("helper"))
        );
        assert_eq!(raw(&db, "u1", UserProperty::Role).await, PropertyValue::from("helper"));
        assert_eq!(db.pending_writes(), 1);
    }

    #[tokio::test]
    async fn cache_is_coherent_after_overwrite() {
        let (_db, store) = setup().await;
        store.set("u1", UserProperty::Lang, "en".into()).await.unwrap();
        assert_eq!(store.get("u1", UserProperty::Lang).await.unwrap(), Some(PropertyValue::from("en")));

        store.set("u1", UserProperty::Lang, "ru".into()).await.unwrap();
        assert_eq!(store.get("u1", UserProperty::Lang).await.unwrap(), Some(PropertyValue::from("ru")));
    }

    #[tokio::test]
    async fn first_write_creates_row_with_first_meet() {
        let (db, store) = setup().await;
        let before = unix_now();

        // Cache a Null first_meet for the not-yet-existing user.
        assert!(store.get("u1", UserProperty::FirstMeet).await.unwrap().is_none());

        store.set("u1", UserProperty::Blocked, true.into()).await.unwrap();

        let first_meet = store.get("u1", UserProperty::FirstMeet).await.unwrap().unwrap();
        assert!(first_meet.as_f64().unwrap() >= before);
        assert_eq!(raw(&db, "u1", UserProperty::FirstMeet).await, first_meet);
    }

    #[tokio::test]
    async fn first_meet_prefers_earliest_usage_event() {
        let (db, store) = setup().await;
        db.execute(|conn| {
            conn.execute_batch(
                "INSERT INTO usage_events (user_id, access_time, model_used) VALUES
                    ('u1', 500.0, 'gemini'), ('u1', 100.0, 'groq'), ('u2', 50.0, 'groq');",
            )?;
            Ok(())
        })
        .await
        .unwrap();

        store.set("u1", UserProperty::Lang, "en".into()).await.unwrap();
        assert_eq!(raw(&db, "u1", UserProperty::FirstMeet).await, PropertyValue::Real(100.0));
    }

    #[tokio::test]
    async fn delete_clears_value_and_cache() {
        let (db, store) = setup().await;
        store.set("u1", UserProperty::Role, "helper".into()).await.unwrap();
        assert!(store.delete("u1", UserProperty::Role).await.unwrap());

        assert!(store.get("u1", UserProperty::Role).await.unwrap().is_none());
        assert_eq!(raw(&db, "u1", UserProperty::Role).await, PropertyValue::Null);

        // Second delete and delete on an unknown user are no-ops.
        assert!(!store.delete("u1", UserProperty::Role).await.unwrap());
        assert!(!store.delete("ghost", UserProperty::Role).await.unwrap());
    }

    #[tokio::test]
    async fn type_mismatch_is_rejected_and_leaves_row_alone() {
        let (db, store) = setup().await;
        store.set("u1", UserProperty::Temperature, 0.5.into()).await.unwrap();

        let err = store
            .set("u1", UserProperty::Temperature, "hot".into())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
        assert_eq!(raw(&db, "u1", UserProperty::Temperature).await, PropertyValue::Real(0.5));
    }

    #[tokio::test]
    async fn dialog_round_trips_as_structured_value() {
        let (db, store) = setup().await;
        let history = json!([
            {"role": "user", "parts": [{"text": "hello"}]},
            {"role": "model", "parts": [{"text": "hi"}]},
        ]);
        store
            .set("u1", UserProperty::DialogGemini, history.clone().into())
            .await
            .unwrap();

        // Force the database path.
        store.cache().clear();
        assert_eq!(
            store.get("u1", UserProperty::DialogGemini).await.unwrap(),
            Some(PropertyValue::Structured(history))
        );
        assert!(matches!(
            raw(&db, "u1", UserProperty::DialogGemini).await,
            PropertyValue::Blob(_)
        ));
    }

    #[tokio::test]
    async fn corrupt_blob_reads_as_absent() {
        let (db, store) = setup().await;
        store.set("u1", UserProperty::DialogGroq, json!(["x"]).into()).await.unwrap();
        db.execute(|conn| {
            conn.execute("UPDATE users SET dialog_groq = x'deadbeef' WHERE id = 'u1'", [])?;
            Ok(())
        })
        .await
        .unwrap();

        store.cache().clear();
        assert!(store.get("u1", UserProperty::DialogGroq).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn saved_file_is_truncated_and_compressed() {
        let (db, store) = setup().await;
        let text = "the quick brown fox jumps over the lazy dog. ".repeat(100);
        store
            .set("u1", UserProperty::SavedFile, text.clone().into())
            .await
            .unwrap();

        let expected = PropertyValue::from(text[..MAX_FILE].to_string());
        assert_eq!(store.get("u1", UserProperty::SavedFile).await.unwrap(), Some(expected.clone()));

        let PropertyValue::Blob(blob) = raw(&db, "u1", UserProperty::SavedFile).await else {
            panic!("saved_file must be stored as a blob");
        };
        assert!(blob.len() < MAX_FILE);
        assert_eq!(codec::decode::<PropertyValue>(Some(&blob)), Some(expected));
    }

    #[tokio::test]
    async fn saved_file_rejects_values_the_cap_cannot_cut() {
        let (db, store) = setup().await;
        let err = store
            .set("u1", UserProperty::SavedFile, json!("x".repeat(50_000)).into())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));

        store.cache().clear();
        assert!(store.get("u1", UserProperty::SavedFile).await.unwrap().is_none());
        assert_eq!(raw(&db, "u1", UserProperty::SavedFile).await, PropertyValue::Null);
    }

    #[tokio::test]
    async fn eviction_forces_a_database_read() {
        let db = setup_db().await;
        let store = PropertyStore::new(db, SmartCache::new(2, 1024), MAX_FILE);

        for user in ["a", "b", "c"] {
            store.set(user, UserProperty::Lang, user.into()).await.unwrap();
            store.cache().run_pending_tasks();
        }
        assert_eq!(store.cache().entry_count(), 2);

        let misses = store.cache().stats().misses();
        assert_eq!(store.get("a", UserProperty::Lang).await.unwrap(), Some(PropertyValue::from("a")));
        assert_eq!(store.cache().stats().misses(), misses + 1);
    }

    #[tokio::test]
    async fn oversized_value_is_readable_but_not_cached() {
        let db = setup_db().await;
        let store = PropertyStore::new(db, SmartCache::new(100, 256), MAX_FILE);
        let key = CacheKey::new("u1", UserProperty::PersistantMemory.as_str());
        let big = "x".repeat(4096);

        store.set("u1", UserProperty::PersistantMemory, big.clone().into()).await.unwrap();
        store.cache().run_pending_tasks();
        assert!(!store.cache().contains(&key));

        assert_eq!(
            store.get("u1", UserProperty::PersistantMemory).await.unwrap(),
            Some(PropertyValue::from(big))
        );
        store.cache().run_pending_tasks();
        assert!(!store.cache().contains(&key));
        assert_eq!(store.cache().stats().rejected(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_leave_cache_and_db_agreeing() {
        let (db, store) = setup().await;

        let mut handles = Vec::new();
        for writer in 0..8_i64 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for round in 0..20_i64 {
                    let user = format!("user{}", round % 4);
                    store
                        .set(&user, UserProperty::ImageGeneratedCounter, (writer * 100 + round).into())
                        .await
                        .unwrap();
                    let _ = store.get(&user, UserProperty::ImageGeneratedCounter).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.all_user_ids().await.unwrap().len(), 4);
        for i in 0..4 {
            let user = format!("user{i}");
            let cached = store.get(&user, UserProperty::ImageGeneratedCounter).await.unwrap();
            let stored = raw(&db, &user, UserProperty::ImageGeneratedCounter).await;
            assert_eq!(cached, Some(stored));
        }
    }

    #[tokio::test]
    async fn flag_queries() {
        let (_db, store) = setup().await;
        store.set("a", UserProperty::Blocked, true.into()).await.unwrap();
        store.set("b", UserProperty::Blocked, false.into()).await.unwrap();
        store.set("c", UserProperty::BlockedBing, true.into()).await.unwrap();

        assert_eq!(store.all_user_ids().await.unwrap(), vec!["a", "b", "c"]);
        assert_eq!(store.user_ids_with_flag(UserProperty::Blocked).await.unwrap(), vec!["a"]);
        assert_eq!(store.user_ids_with_flag(UserProperty::BlockedBing).await.unwrap(), vec!["c"]);
        assert!(store.user_ids_with_flag(UserProperty::Role).await.is_err());
    }

    #[tokio::test]
    async fn stale_data_is_cleared() {
        let (db, store) = setup().await;
        let day = 24.0 * 60.0 * 60.0;
        let now = unix_now();

        for (user, idle_days) in [("fresh", 0.0), ("idle2d", 2.0), ("idle10d", 10.0)] {
            store.set(user, UserProperty::LastTimeAccess, (now - idle_days * day).into()).await.unwrap();
            store.set(user, UserProperty::SavedFileName, "notes.txt".into()).await.unwrap();
            store.set(user, UserProperty::SavedFile, "content".into()).await.unwrap();
            store.set(user, UserProperty::DialogGemini, json!(["hi"]).into()).await.unwrap();
        }

        let report = store
            .clear_stale_data(Duration::from_secs(24 * 60 * 60), Duration::from_secs(7 * 24 * 60 * 60))
            .await
            .unwrap();
        assert_eq!(
            report,
            MaintenanceReport {
                files_cleared: 2,
                dialogs_cleared: 1
            }
        );

        assert!(store.get("fresh", UserProperty::SavedFile).await.unwrap().is_some());
        assert!(store.get("idle2d", UserProperty::SavedFile).await.unwrap().is_none());
        assert!(store.get("idle2d", UserProperty::DialogGemini).await.unwrap().is_some());
        assert!(store.get("idle10d", UserProperty::DialogGemini).await.unwrap().is_none());
        assert_eq!(raw(&db, "idle10d", UserProperty::SavedFileName).await, PropertyValue::Null);
    }
}
