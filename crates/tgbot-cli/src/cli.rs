//! CLI argument definitions for `tgbot-db`.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Maintenance tool for the Telegram bot database.
#[derive(Parser)]
#[command(
    name = "tgbot-db",
    version,
    about = "Maintenance tool for the Telegram bot database",
    long_about = "Inspect and maintain the bot's SQLite database: schema setup, \
                  snapshots, online backups, usage statistics and user settings."
)]
pub struct Cli {
    /// Configuration file holding the `[store]` section.
    #[arg(long, short, global = true, default_value = "config/default.toml")]
    pub config: PathBuf,

    /// Database file, overriding the configuration.
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the database and bring its schema up to date.
    Init,

    /// Write a compressed snapshot of the database file.
    Snapshot,

    /// Replace the database file with a snapshot.
    Restore {
        /// Use the previous snapshot generation instead of the newest.
        #[arg(long)]
        from_previous: bool,
    },

    /// Copy the live database with the SQLite backup API.
    OnlineBackup,

    /// Rebuild the database file, reclaiming free pages.
    Vacuum,

    /// Print usage statistics.
    Stats {
        /// Length of the per-day series, ending yesterday.
        #[arg(long, short, default_value_t = 7)]
        days: u32,
    },

    /// Manage the translation cache.
    Translations {
        #[command(subcommand)]
        action: TranslationAction,
    },

    /// Read or change a user's settings.
    User {
        #[command(subcommand)]
        action: UserAction,
    },
}

/// Actions for the translation cache.
#[derive(Subcommand)]
pub enum TranslationAction {
    /// Delete translations longer than a limit.
    Prune {
        /// Maximum translation length, in characters.
        #[arg(long)]
        max_chars: usize,
    },
    /// Print the number of cached translations.
    Count,
}

/// Actions on one user property.
#[derive(Subcommand)]
pub enum UserAction {
    /// Print a property.
    Get {
        /// User id, e.g. `12345+0`.
        user_id: String,
        /// Column name, e.g. `lang`.
        property: String,
    },
    /// Set a property. The value is parsed according to the column type;
    /// dialogue columns take JSON.
    Set {
        user_id: String,
        property: String,
        value: String,
    },
    /// Clear a property.
    Delete { user_id: String, property: String },
}
