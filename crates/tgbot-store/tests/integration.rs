//! Integration tests for the tgbot-store crate.
//!
//! These drive the public [`Store`] handle against a real SQLite file on
//! disk (via tempfile): property round trips through the cache, usage
//! accounting through the background recorder, and persistence across
//! close and reopen.

use std::time::Duration;

use serde_json::json;
use tgbot_store::{
    Database, ModelFilter, PropertyValue, SchemaOptions, Store, StoreConfig, TranslationEntry, UserProperty,
    unix_now,
};

fn config_in(dir: &tempfile::TempDir) -> StoreConfig {
    StoreConfig {
        sync_interval_secs: 3600,
        online_backup_enabled: false,
        ..StoreConfig::with_db_path(dir.path().join("main.db"))
    }
}

const HOUR: Duration = Duration::from_secs(60 * 60);

// ═══════════════════════════════════════════════════════════════════════
//  User properties
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn property_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(config_in(&dir)).await.unwrap();

    assert!(store.get_user_property("7+0", "lang").await.is_none());

    store.set_user_property("7+0", "lang", "ru").await;
    store.set_user_property("7+0", "temperature", 0.7).await;
    store.set_user_property("7+0", "chat_enabled", true).await;
    assert_eq!(
        store.get_user_property("7+0", "lang").await,
        Some(PropertyValue::from("ru"))
    );
    assert_eq!(
        store.get_user_property("7+0", "temperature").await,
        Some(PropertyValue::Real(0.7))
    );
    assert_eq!(
        store.get_user_property("7+0", "chat_enabled").await,
        Some(PropertyValue::Integer(1))
    );

    // A new row gets its first-meet time.
    let first_meet = store.get_user_property("7+0", "first_meet").await;
    assert!(first_meet.and_then(|v| v.as_f64()).is_some());

    store.delete_user_property("7+0", "lang").await;
    assert!(store.get_user_property("7+0", "lang").await.is_none());

    store.close().await.unwrap();
}

#[tokio::test]
async fn dialog_history_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(config_in(&dir)).await.unwrap();

    let history = json!([
        {"role": "user", "parts": [{"text": "hello"}]},
        {"role": "model", "parts": [{"text": "hi there"}]},
    ]);
    store.set_user_property("9+0", "dialog_gemini", history.clone()).await;
    assert_eq!(
        store.get_user_property("9+0", "dialog_gemini").await,
        Some(PropertyValue::Structured(history))
    );

    store.close().await.unwrap();
}

#[tokio::test]
async fn values_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(&dir);

    let store = Store::open(config.clone()).await.unwrap();
    store.set_user_property("1+0", "role", "poet").await;
    store.set_user_property("1+0", "bot_name", "Ada").await;
    store.set_user_property("1+0", "dialog_groq", json!(["remember me"])).await;
    store.delete_user_property("1+0", "bot_name").await;
    store.close().await.unwrap();

    let store = Store::open(config).await.unwrap();
    assert!(store.migration_report().is_unchanged());
    assert_eq!(
        store.get_user_property("1+0", "role").await,
        Some(PropertyValue::from("poet"))
    );
    assert!(store.get_user_property("1+0", "bot_name").await.is_none());
    assert_eq!(
        store.get_user_property("1+0", "dialog_groq").await,
        Some(PropertyValue::Structured(json!(["remember me"])))
    );
    store.close().await.unwrap();
}

#[tokio::test]
async fn saved_file_stays_within_its_cap() {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig {
        saved_file_max_bytes: 1000,
        ..config_in(&dir)
    };
    let store = Store::open(config).await.unwrap();

    store.set_user_property("u", "saved_file", json!("x".repeat(50_000))).await;
    store.properties().cache().clear();
    assert!(store.get_user_property("u", "saved_file").await.is_none());

    store.set_user_property("u", "saved_file", "x".repeat(50_000)).await;
    store.properties().cache().clear();
    let stored = store.get_user_property("u", "saved_file").await.unwrap();
    assert_eq!(stored.as_str().map(str::len), Some(1000));

    store.close().await.unwrap();
}

#[tokio::test]
async fn flagged_users_are_listed() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(config_in(&dir)).await.unwrap();

    store.set_user_property("1+0", "blocked", 1).await;
    store.set_user_property("2+0", "blocked", 0).await;
    store.set_user_property("3+0", "blocked", 1).await;

    let blocked = store.properties().user_ids_with_flag(UserProperty::Blocked).await.unwrap();
    assert_eq!(blocked, vec!["1+0".to_string(), "3+0".to_string()]);
    assert_eq!(store.properties().all_user_ids().await.unwrap().len(), 3);

    store.close().await.unwrap();
}

// ═══════════════════════════════════════════════════════════════════════
//  Usage ledger
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn duplicate_usage_events_collapse() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(config_in(&dir)).await.unwrap();

    let ts = unix_now();
    for _ in 0..3 {
        store.add_msg_at("5+0", "gemini", ts);
    }
    store.recorder().flush().await;

    assert_eq!(store.ledger().count_all().await.unwrap(), 1);
    assert_eq!(store.recorder().dropped(), 0);
    store.close().await.unwrap();
}

#[tokio::test]
async fn usage_is_aggregated() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(config_in(&dir)).await.unwrap();

    let now = unix_now();
    store.add_msg_at("1+0", "gemini", now - 10.0);
    store.add_msg_at("1+0", "gemini", now - 20.0);
    store.add_msg_at("1+0", "groq", now - 30.0);
    store.add_msg_at("2+0", "gemini", now - 40.0);
    // Outside the one-hour window.
    store.add_msg_at("3+0", "groq", now - 2.0 * 3600.0);
    store.recorder().flush().await;

    let ledger = store.ledger();
    assert_eq!(ledger.count_all().await.unwrap(), 5);
    assert_eq!(ledger.distinct_users().await.unwrap(), 3);
    assert_eq!(ledger.distinct_users_since(HOUR).await.unwrap(), 2);
    assert_eq!(
        ledger.count_since("1+0", &ModelFilter::Any, HOUR).await.unwrap(),
        3
    );
    assert_eq!(
        ledger
            .count_since("1+0", &"gemini".parse().unwrap(), HOUR)
            .await
            .unwrap(),
        2
    );

    let by_model = ledger.model_usage_since(HOUR).await.unwrap();
    assert_eq!(by_model.get("gemini"), Some(&3));
    assert_eq!(by_model.get("groq"), Some(&1));

    store.close().await.unwrap();
}

#[tokio::test]
async fn queued_usage_is_written_on_close() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(&dir);

    let store = Store::open(config.clone()).await.unwrap();
    let now = unix_now();
    for i in 0..20 {
        store.add_msg_at("8+0", "gemini", now - f64::from(i));
    }
    store.close().await.unwrap();

    let store = Store::open(config).await.unwrap();
    assert_eq!(store.ledger().count_all().await.unwrap(), 20);
    store.close().await.unwrap();
}

// ═══════════════════════════════════════════════════════════════════════
//  Side caches
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn translations_and_misc_cache_through_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(config_in(&dir)).await.unwrap();

    let translations = store.translations();
    translations
        .put(TranslationEntry::new("Settings", "de", "", "Einstellungen"))
        .await
        .unwrap();
    assert_eq!(
        translations.get("Settings", "de", "").await.unwrap().as_deref(),
        Some("Einstellungen")
    );

    let misc = store.misc_cache();
    misc.set("https://example.com/a", "page text").await.unwrap();
    assert_eq!(
        misc.get("https://example.com/a").await.unwrap().as_deref(),
        Some("page text")
    );
    assert!(misc.delete("https://example.com/a").await.unwrap());
    assert!(misc.get("https://example.com/a").await.unwrap().is_none());

    let suggests = store.image_suggestions();
    suggests.set("9f86d081", "a lighthouse at dusk").await.unwrap();
    assert_eq!(
        suggests.get("9f86d081").await.unwrap().as_deref(),
        Some("a lighthouse at dusk")
    );
    assert!(misc.get("9f86d081").await.unwrap().is_none());

    store.close().await.unwrap();
}

// ═══════════════════════════════════════════════════════════════════════
//  Schema and maintenance
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn legacy_users_table_gains_columns() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(&dir);

    let db = Database::open(&config.db_path).unwrap();
    db.execute(|conn| {
        conn.execute_batch(
            "CREATE TABLE users (id_num INTEGER PRIMARY KEY AUTOINCREMENT, id TEXT, lang TEXT);
             INSERT INTO users (id, lang) VALUES ('old+0', 'fr');",
        )?;
        Ok(())
    })
    .await
    .unwrap();
    db.close().await.unwrap();

    let store = Store::open(config).await.unwrap();
    assert!(!store.migration_report().added_columns.is_empty());
    assert_eq!(
        store.get_user_property("old+0", "lang").await,
        Some(PropertyValue::from("fr"))
    );
    store.set_user_property("old+0", "role", "critic").await;
    assert_eq!(
        store.get_user_property("old+0", "role").await,
        Some(PropertyValue::from("critic"))
    );
    store.close().await.unwrap();
}

#[tokio::test]
async fn migrations_on_plain_database_are_idempotent() {
    let db = Database::open_in_memory().unwrap();
    let first = db.run_migrations(SchemaOptions::default()).await.unwrap();
    assert!(!first.is_unchanged());
    let second = db.run_migrations(SchemaOptions::default()).await.unwrap();
    assert!(second.is_unchanged());
}

#[tokio::test]
async fn flush_and_vacuum_succeed() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(config_in(&dir)).await.unwrap();

    store.set_user_property("4+0", "lang", "en").await;
    store.add_msg("4+0", "gemini");
    assert!(store.flush().await.is_ok());
    assert_eq!(store.database().pending_writes(), 0);
    store.vacuum().await.unwrap();
    assert_eq!(
        store.get_user_property("4+0", "lang").await,
        Some(PropertyValue::from("en"))
    );

    store.close().await.unwrap();
}
