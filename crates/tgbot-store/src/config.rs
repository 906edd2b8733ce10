//! Store configuration.
//!
//! Settings live in the `[store]` section of `config/default.toml`. Every
//! field has a default, so a missing file, a missing section or a missing
//! key all fall back silently. A handful of switches can be overridden from
//! the environment (see [`StoreConfig::apply_env_overrides`]).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};

const DAY_SECS: u64 = 24 * 60 * 60;

/// Runtime settings for [`Store`](crate::Store).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Location of the live database file.
    pub db_path: PathBuf,
    /// Take a compressed snapshot of the database file before opening it.
    pub backup_on_start: bool,
    /// Run `VACUUM` once the schema is in place.
    pub vacuum_on_start: bool,
    /// Drop and re-create columns whose on-disk type differs from the
    /// declared one. Destroys the values held in those columns.
    pub rebuild_mismatched_columns: bool,
    /// How often the sync daemon flushes pending writes.
    pub sync_interval_secs: u64,
    /// Whether the sync daemon takes online backups at all.
    pub online_backup_enabled: bool,
    /// Minimum spacing between two online backups.
    pub online_backup_interval_secs: u64,
    /// Number of entries held by the property cache.
    pub cache_max_entries: u64,
    /// Values larger than this are never cached.
    pub cache_max_value_bytes: usize,
    /// Upper bound for the `saved_file` property.
    pub saved_file_max_bytes: usize,
    /// Usage events older than this are deleted at startup.
    pub ledger_retention_days: u64,
    /// Capacity of the fire-and-forget usage queue.
    pub ledger_queue_capacity: usize,
    /// Number of workers draining the usage queue.
    pub ledger_workers: usize,
    /// Entries of the misc cache older than this are pruned on write.
    pub misc_cache_ttl_secs: u64,
    /// Same, for the image prompt suggestions.
    pub image_suggest_ttl_secs: u64,
    /// Saved files of users idle longer than this are cleared at startup.
    pub stale_file_secs: u64,
    /// Dialogues of users idle longer than this are cleared at startup.
    pub stale_dialog_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("db/main.db"),
            backup_on_start: true,
            vacuum_on_start: false,
            rebuild_mismatched_columns: false,
            sync_interval_secs: 30,
            online_backup_enabled: true,
            online_backup_interval_secs: DAY_SECS,
            cache_max_entries: 1000,
            cache_max_value_bytes: 10 * 1024,
            saved_file_max_bytes: 1_000_000,
            ledger_retention_days: 3650,
            ledger_queue_capacity: 1024,
            ledger_workers: 2,
            misc_cache_ttl_secs: 30 * DAY_SECS,
            image_suggest_ttl_secs: 30 * DAY_SECS,
            stale_file_secs: DAY_SECS,
            stale_dialog_secs: 7 * DAY_SECS,
        }
    }
}

impl StoreConfig {
    /// Defaults with the database placed at `db_path`.
    pub fn with_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Self::default()
        }
    }

    /// Load the `[store]` section from a TOML file.
    ///
    /// A missing file yields the defaults; a file that exists but does not
    /// parse is an error.
    pub fn load(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(err) => return Err(err.into()),
        };
        let config = Self::from_toml_str(&content)?;
        info!(path = %path.display(), db = %config.db_path.display(), "store config loaded");
        Ok(config)
    }

    /// Parse the `[store]` section out of a TOML document.
    pub fn from_toml_str(content: &str) -> StoreResult<Self> {
        let table: toml::Table = content
            .parse()
            .map_err(|e: toml::de::Error| StoreError::Config(e.to_string()))?;

        match table.get("store") {
            Some(section) => section
                .clone()
                .try_into()
                .map_err(|e: toml::de::Error| StoreError::Config(e.to_string())),
            None => Ok(Self::default()),
        }
    }

    /// Override selected fields from environment variables.
    ///
    /// `lookup` is usually `|k| std::env::var(k).ok()`; tests pass a map.
    /// Recognised variables: `TGBOT_DB_PATH`, `TGBOT_DB_BACKUP_ON_START`,
    /// `TGBOT_DB_VACUUM_ON_START`, `TGBOT_DB_REBUILD_COLUMNS`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("TGBOT_DB_PATH").filter(|p| !p.trim().is_empty()) {
            self.db_path = PathBuf::from(path.trim());
        }
        if let Some(v) = lookup("TGBOT_DB_BACKUP_ON_START").and_then(|v| parse_flag(&v)) {
            self.backup_on_start = v;
        }
        if let Some(v) = lookup("TGBOT_DB_VACUUM_ON_START").and_then(|v| parse_flag(&v)) {
            self.vacuum_on_start = v;
        }
        if let Some(v) = lookup("TGBOT_DB_REBUILD_COLUMNS").and_then(|v| parse_flag(&v)) {
            self.rebuild_mismatched_columns = v;
        }
    }

    /// Path of the newest compressed snapshot (`main.db.gz`).
    pub fn snapshot_path(&self) -> PathBuf {
        append_extension(&self.db_path, "gz")
    }

    /// Path of the online backup copy (`main.db.backup`).
    pub fn online_backup_path(&self) -> PathBuf {
        append_extension(&self.db_path, "backup")
    }
}

/// `main.db` + `gz` -> `main.db.gz`.
pub(crate) fn append_extension(path: &Path, ext: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".");
    os.push(ext);
    PathBuf::from(os)
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_match_the_bot_layout() {
        let config = StoreConfig::default();
        assert_eq!(config.db_path, PathBuf::from("db/main.db"));
        assert_eq!(config.snapshot_path(), PathBuf::from("db/main.db.gz"));
        assert_eq!(config.online_backup_path(), PathBuf::from("db/main.db.backup"));
        assert_eq!(config.sync_interval_secs, 30);
        assert!(!config.rebuild_mismatched_columns);
    }

    #[test]
    fn parses_store_section() {
        let config = StoreConfig::from_toml_str(
            r#"
            [bot]
            history_window = 20

            [store]
            db_path = "/var/lib/bot/main.db"
            vacuum_on_start = true
            cache_max_entries = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.db_path, PathBuf::from("/var/lib/bot/main.db"));
        assert!(config.vacuum_on_start);
        assert_eq!(config.cache_max_entries, 50);
        // Untouched keys keep their defaults.
        assert!(config.backup_on_start);
        assert_eq!(config.ledger_workers, 2);
    }

    #[test]
    fn missing_section_yields_defaults() {
        let config = StoreConfig::from_toml_str("[bot]\nshow_token_usage = true\n").unwrap();
        assert_eq!(config, StoreConfig::default());
    }

    #[test]
    fn shipped_config_matches_defaults() {
        let shipped = include_str!("../../../config/default.toml");
        assert_eq!(StoreConfig::from_toml_str(shipped).unwrap(), StoreConfig::default());
    }

    #[test]
    fn malformed_toml_is_an_error() {
        let err = StoreConfig::from_toml_str("[store\n").unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::load(dir.path().join("nope.toml")).unwrap();
        assert_eq!(config, StoreConfig::default());
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("TGBOT_DB_PATH", "/tmp/other.db"),
            ("TGBOT_DB_BACKUP_ON_START", "0"),
            ("TGBOT_DB_VACUUM_ON_START", "yes"),
            ("TGBOT_DB_REBUILD_COLUMNS", "garbage"),
        ]);
        let mut config = StoreConfig::default();
        config.apply_env_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.db_path, PathBuf::from("/tmp/other.db"));
        assert!(!config.backup_on_start);
        assert!(config.vacuum_on_start);
        // Unparseable values leave the field alone.
        assert!(!config.rebuild_mismatched_columns);
    }
}
