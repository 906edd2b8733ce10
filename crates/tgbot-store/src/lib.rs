//! # tgbot-store
//!
//! Storage engine for the Telegram bot.
//!
//! One SQLite file holds per-user settings and dialogue history, a usage
//! ledger, a translation cache and two small keyed text caches. A bounded LRU cache sits in front of
//! user reads, a background daemon flushes writes and takes online
//! backups, and compressed snapshots are taken on startup.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │  Store (open / close, never-failing contract)    │
//! ├─────────────────────────────────────────────────┤
//! │  PropertyStore ─ SmartCache (moka LRU)           │
//! │  UsageLedger   ─ UsageRecorder (mpsc + workers)  │
//! │  TranslationCache · MiscCache                    │
//! ├─────────────────────────────────────────────────┤
//! │  Database (rusqlite WAL, global lock)            │
//! │  Schema (declared, additive) · SyncDaemon        │
//! │  Snapshots (gzip) · OnlineBackup (backup API)    │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use tgbot_store::{Store, StoreConfig};
//!
//! let store = Store::open(StoreConfig::load("config/default.toml")?).await?;
//! store.set_user_property("42+0", "lang", "en").await;
//! store.add_msg("42+0", "gemini");
//! let lang = store.get_user_property("42+0", "lang").await;
//! store.close().await?;
//! ```

pub mod backup;
pub mod cache;
pub mod codec;
pub mod config;
pub mod daemon;
pub mod db;
pub mod error;
pub mod ledger;
pub mod migration;
pub mod misc_cache;
pub mod property;
pub mod store;
pub mod translation;
pub mod user_store;

// ── re-exports ───────────────────────────────────────────────────────

pub use backup::OnlineBackup;
pub use cache::{CacheKey, CacheStats, SmartCache};
pub use config::StoreConfig;
pub use daemon::SyncDaemon;
pub use db::{Database, unix_now};
pub use error::{StoreError, StoreResult};
pub use ledger::{DailyCount, DailyModelUsage, ModelFilter, UsageEvent, UsageLedger, UsageRecorder};
pub use migration::{MigrationReport, SchemaOptions};
pub use misc_cache::{CacheTable, MiscCache};
pub use property::{CodecPolicy, ColumnType, PropertyValue, UserProperty};
pub use store::Store;
pub use translation::{TranslationCache, TranslationEntry};
pub use user_store::{MaintenanceReport, PropertyStore};
