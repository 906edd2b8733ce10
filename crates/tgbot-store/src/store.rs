//! The [`Store`] handle.
//!
//! Wires every component to one database and owns the startup and
//! shutdown sequence. Its user-facing methods never return errors: a
//! failure is logged once here and the caller gets a safe default, so a
//! storage hiccup never takes down a chat request.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, instrument, warn};

use crate::backup::{self, OnlineBackup};
use crate::cache::SmartCache;
use crate::config::StoreConfig;
use crate::daemon::SyncDaemon;
use crate::db::Database;
use crate::error::StoreResult;
use crate::ledger::{UsageEvent, UsageLedger, UsageRecorder};
use crate::migration::{MigrationReport, SchemaOptions};
use crate::misc_cache::MiscCache;
use crate::property::{PropertyValue, UserProperty};
use crate::translation::TranslationCache;
use crate::user_store::PropertyStore;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// An open bot database with its cache, ledger and background tasks.
pub struct Store {
    config: StoreConfig,
    db: Database,
    properties: PropertyStore,
    ledger: UsageLedger,
    recorder: UsageRecorder,
    translations: TranslationCache,
    misc: MiscCache,
    image_suggestions: MiscCache,
    online_backup: Option<Arc<OnlineBackup>>,
    daemon: SyncDaemon,
    migration: MigrationReport,
}

impl Store {
    /// Open the database described by `config`.
    ///
    /// In order: create the parent directory; restore the file from the
    /// newest snapshot if it is missing, otherwise snapshot it when
    /// `backup_on_start` is set; open the connection; bring the schema up
    /// to date; prune the ledger and stale user data; optionally VACUUM;
    /// start the sync daemon and the usage recorder.
    ///
    /// Only failing to open the connection or to inspect the schema is an
    /// error. Everything else is logged and startup continues.
    #[instrument(skip(config), fields(db = %config.db_path.display()))]
    pub async fn open(config: StoreConfig) -> StoreResult<Self> {
        let files = config.clone();
        tokio::task::spawn_blocking(move || prepare_files(&files)).await??;

        let db = Database::open(&config.db_path)?;
        let migration = db
            .run_migrations(SchemaOptions {
                rebuild_mismatched_columns: config.rebuild_mismatched_columns,
            })
            .await?;

        let cache = SmartCache::new(config.cache_max_entries, config.cache_max_value_bytes);
        let properties = PropertyStore::new(db.clone(), cache, config.saved_file_max_bytes);
        let ledger = UsageLedger::new(db.clone());
        let translations = TranslationCache::new(db.clone());
        let misc = MiscCache::new(db.clone(), Duration::from_secs(config.misc_cache_ttl_secs));
        let image_suggestions =
            MiscCache::image_suggestions(db.clone(), Duration::from_secs(config.image_suggest_ttl_secs));

        if let Err(err) = ledger
            .prune_older_than(DAY * days(config.ledger_retention_days))
            .await
        {
            error!(%err, "failed to prune usage ledger");
        }
        if let Err(err) = properties
            .clear_stale_data(
                Duration::from_secs(config.stale_file_secs),
                Duration::from_secs(config.stale_dialog_secs),
            )
            .await
        {
            error!(%err, "failed to clear stale user data");
        }
        if config.vacuum_on_start {
            if let Err(err) = db.vacuum().await {
                error!(%err, "startup vacuum failed");
            }
        }

        let online_backup = config.online_backup_enabled.then(|| {
            Arc::new(OnlineBackup::new(
                config.online_backup_path(),
                Duration::from_secs(config.online_backup_interval_secs),
            ))
        });
        let daemon = SyncDaemon::start(
            db.clone(),
            Duration::from_secs(config.sync_interval_secs.max(1)),
            online_backup.clone(),
        );
        let recorder = UsageRecorder::start(
            ledger.clone(),
            config.ledger_queue_capacity,
            config.ledger_workers,
        );

        info!(
            tables_created = migration.created_tables.len(),
            columns_added = migration.added_columns.len(),
            "store opened"
        );

        Ok(Self {
            config,
            db,
            properties,
            ledger,
            recorder,
            translations,
            misc,
            image_suggestions,
            online_backup,
            daemon,
            migration,
        })
    }

    /// Stop the daemon, drain queued usage events, flush and release the
    /// connection.
    pub async fn close(self) -> StoreResult<()> {
        let Self {
            db,
            properties,
            ledger,
            recorder,
            translations,
            misc,
            image_suggestions,
            daemon,
            ..
        } = self;

        daemon.stop().await;
        if let Err(err) = recorder.shutdown().await {
            error!(%err, "usage recorder did not shut down cleanly");
        }
        // Every component holds a clone of the connection handle.
        drop((daemon, recorder, properties, ledger, translations, misc, image_suggestions));
        let result = db.close().await;
        info!("store closed");
        result
    }

    // ── user-facing contract ─────────────────────────────────────────

    /// A user property by column name. `None` when unknown, unset or
    /// unreadable.
    pub async fn get_user_property(&self, user_id: &str, name: &str) -> Option<PropertyValue> {
        let property = parse_property("get_user_property", name)?;
        or_default("get_user_property", self.properties.get(user_id, property).await)
    }

    /// Set a user property by column name. Failures are logged.
    pub async fn set_user_property(&self, user_id: &str, name: &str, value: impl Into<PropertyValue>) {
        let Some(property) = parse_property("set_user_property", name) else {
            return;
        };
        or_default(
            "set_user_property",
            self.properties.set(user_id, property, value.into()).await,
        );
    }

    /// Clear a user property by column name. Failures are logged.
    pub async fn delete_user_property(&self, user_id: &str, name: &str) {
        let Some(property) = parse_property("delete_user_property", name) else {
            return;
        };
        or_default(
            "delete_user_property",
            self.properties.delete(user_id, property).await,
        );
    }

    /// Record one completed request now. Never blocks.
    pub fn add_msg(&self, user_id: &str, model: &str) {
        self.recorder.record(UsageEvent::now(user_id, model));
    }

    /// Record one completed request at `timestamp` (unix seconds).
    pub fn add_msg_at(&self, user_id: &str, model: &str, timestamp: f64) {
        self.recorder.record(UsageEvent::at(user_id, model, timestamp));
    }

    // ── maintenance ──────────────────────────────────────────────────

    /// Rebuild the database file.
    pub async fn vacuum(&self) -> StoreResult<()> {
        self.db.vacuum().await
    }

    /// Take an online backup now, regardless of the throttle. Returns the
    /// backup path.
    pub async fn online_backup_now(&self) -> StoreResult<PathBuf> {
        let backup = match &self.online_backup {
            Some(backup) => Arc::clone(backup),
            None => Arc::new(OnlineBackup::new(self.config.online_backup_path(), Duration::ZERO)),
        };
        let dest = backup.dest().to_path_buf();
        self.db.execute(move |conn| backup.run(conn)).await?;
        Ok(dest)
    }

    /// Write pending changes into the main database file now.
    pub async fn flush(&self) -> StoreResult<bool> {
        self.recorder.flush().await;
        self.db.flush().await
    }

    // ── component access ─────────────────────────────────────────────

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn properties(&self) -> &PropertyStore {
        &self.properties
    }

    pub fn ledger(&self) -> &UsageLedger {
        &self.ledger
    }

    pub fn recorder(&self) -> &UsageRecorder {
        &self.recorder
    }

    pub fn translations(&self) -> &TranslationCache {
        &self.translations
    }

    pub fn misc_cache(&self) -> &MiscCache {
        &self.misc
    }

    /// Image prompt suggestions keyed by hash.
    pub fn image_suggestions(&self) -> &MiscCache {
        &self.image_suggestions
    }

    /// Schema changes applied by [`Store::open`].
    pub fn migration_report(&self) -> &MigrationReport {
        &self.migration
    }
}

/// Restore a missing database or snapshot an existing one. Runs before the
/// connection is opened.
fn prepare_files(config: &StoreConfig) -> StoreResult<()> {
    let db_path = &config.db_path;
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let snapshot = config.snapshot_path();
    if !db_path.exists() {
        match backup::restore_latest(&snapshot, db_path) {
            Some(used) => warn!(snapshot = %used.display(), "database file missing, restored from snapshot"),
            None => info!(path = %db_path.display(), "starting with a new database"),
        }
        return Ok(());
    }

    if config.backup_on_start {
        if let Err(err) = backup::snapshot(db_path, &snapshot) {
            error!(%err, "startup snapshot failed");
        }
    }
    Ok(())
}

fn parse_property(op: &'static str, name: &str) -> Option<UserProperty> {
    match UserProperty::from_str(name) {
        Ok(property) => Some(property),
        Err(err) => {
            error!(op, %err, "rejected property name");
            None
        }
    }
}

/// Log a failed operation and fall back to the type's default.
fn or_default<T: Default>(op: &'static str, result: StoreResult<T>) -> T {
    result.unwrap_or_else(|err| {
        error!(op, %err, "store operation failed");
        T::default()
    })
}

fn days(n: u64) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("db_path", &self.config.db_path)
            .field("pending_writes", &self.db.pending_writes())
            .finish_non_exhaustive()
    }
}

// ── tests ────────────────────────────────────────────────────────────
