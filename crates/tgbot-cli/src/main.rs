//! CLI entry point for the bot database.
//!
//! This binary provides the `tgbot-db` command with subcommands for
//! initialising, backing up, restoring and inspecting the store.

mod cli;
mod helpers;

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tgbot_store::{Store, StoreConfig, UserProperty, backup};
use tracing::info;

use cli::{Cli, Commands, TranslationAction, UserAction};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    helpers::init_tracing("info");

    let config = helpers::load_config(&cli.config, cli.db.as_deref())?;

    match cli.command {
        Commands::Init => cmd_init(config).await,
        Commands::Snapshot => cmd_snapshot(&config),
        Commands::Restore { from_previous } => cmd_restore(&config, from_previous),
        Commands::OnlineBackup => cmd_online_backup(config).await,
        Commands::Vacuum => cmd_vacuum(config).await,
        Commands::Stats { days } => cmd_stats(config, days).await,
        Commands::Translations { action } => cmd_translations(config, action).await,
        Commands::User { action } => cmd_user(config, action).await,
    }
}

/// Open the store for a one-off maintenance command. Startup snapshots and
/// vacuum are left to `init` and the bot itself.
async fn open_quiet(mut config: StoreConfig) -> Result<Store> {
    config.backup_on_start = false;
    config.vacuum_on_start = false;
    let path = config.db_path.display().to_string();
    Store::open(config)
        .await
        .with_context(|| format!("failed to open database at {path}"))
}

// ---------------------------------------------------------------------------
// Subcommand: init
// ---------------------------------------------------------------------------

async fn cmd_init(config: StoreConfig) -> Result<()> {
    let path = config.db_path.display().to_string();
    let store = Store::open(config)
        .await
        .with_context(|| format!("failed to initialize database at {path}"))?;

    let report = store.migration_report();
    println!();
    println!("  Database initialized at {path}");
    if report.is_unchanged() {
        println!("  [=] Schema already up to date");
    }
    for table in &report.created_tables {
        println!("  [+] Created table {table}");
    }
    if !report.added_columns.is_empty() {
        println!("  [+] Added columns: {}", report.added_columns.join(", "));
    }
    for (column, on_disk) in &report.mismatched_columns {
        println!("  [!] Column {column} is {on_disk} on disk (set rebuild_mismatched_columns to fix)");
    }
    if !report.rebuilt_columns.is_empty() {
        println!("  [!] Rebuilt columns: {}", report.rebuilt_columns.join(", "));
    }
    println!();

    store.close().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommands: snapshot / restore / online-backup / vacuum
// ---------------------------------------------------------------------------

fn cmd_snapshot(config: &StoreConfig) -> Result<()> {
    if !config.db_path.exists() {
        bail!("no database at {}", config.db_path.display());
    }
    let dest = config.snapshot_path();
    let bytes = backup::snapshot(&config.db_path, &dest).context("snapshot failed")?;
    println!("  Snapshot written to {} ({bytes} bytes)", dest.display());
    Ok(())
}

fn cmd_restore(config: &StoreConfig, from_previous: bool) -> Result<()> {
    let newest = config.snapshot_path();
    let source = if from_previous {
        backup::previous_generation(&newest)
    } else {
        newest
    };
    if !source.exists() {
        bail!("no snapshot at {}", source.display());
    }
    if let Some(parent) = config.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let bytes = backup::restore(&source, &config.db_path).context("restore failed")?;
    info!(source = %source.display(), "database restored");
    println!(
        "  Restored {} from {} ({bytes} bytes)",
        config.db_path.display(),
        source.display()
    );
    Ok(())
}

async fn cmd_online_backup(config: StoreConfig) -> Result<()> {
    let store = open_quiet(config).await?;
    let dest = store.online_backup_now().await.context("online backup failed")?;
    println!("  Online backup written to {}", dest.display());
    store.close().await?;
    Ok(())
}

async fn cmd_vacuum(config: StoreConfig) -> Result<()> {
    let store = open_quiet(config).await?;
    store.vacuum().await.context("vacuum failed")?;
    println!("  Vacuum complete");
    store.close().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: stats
// ---------------------------------------------------------------------------

async fn cmd_stats(config: StoreConfig, days: u32) -> Result<()> {
    let store = open_quiet(config).await?;
    let ledger = store.ledger();

    println!();
    println!("  Usage Statistics");
    println!("  ================");
    println!();
    println!("  Users known:          {}", store.properties().all_user_ids().await?.len());
    println!("  Users with requests:  {}", ledger.distinct_users().await?);
    println!("  Requests total:       {}", ledger.count_all().await?);
    println!("  Active last 24h:      {}", ledger.distinct_users_since(DAY).await?);
    println!("  New last 24h:         {}", ledger.new_users_since(DAY).await?);
    println!("  Cached translations:  {}", store.translations().count().await?);

    let by_model = ledger.model_usage_since(DAY).await?;
    if !by_model.is_empty() {
        println!();
        println!("  Requests per model, last 24h:");
        for (model, count) in &by_model {
            println!("    {model:<24} {count}");
        }
    }

    if days > 0 {
        let active = ledger.active_users_per_day(days).await?;
        let new = ledger.new_users_per_day(days).await?;
        let models = ledger.model_usage_per_day(days).await?;

        println!();
        println!("  {:<12} {:>8} {:>8} {:>10}", "day", "active", "new", "requests");
        for ((a, n), m) in active.iter().zip(&new).zip(&models) {
            let requests: i64 = m.models.values().sum();
            println!("  {:<12} {:>8} {:>8} {:>10}", a.date.to_string(), a.count, n.count, requests);
        }
    }
    println!();

    store.close().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: translations
// ---------------------------------------------------------------------------

async fn cmd_translations(config: StoreConfig, action: TranslationAction) -> Result<()> {
    let store = open_quiet(config).await?;
    match action {
        TranslationAction::Prune { max_chars } => {
            let removed = store.translations().prune_longer_than(max_chars).await?;
            println!("  Removed {removed} translations longer than {max_chars} characters");
        }
        TranslationAction::Count => {
            println!("{}", store.translations().count().await?);
        }
    }
    store.close().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: user
// ---------------------------------------------------------------------------

async fn cmd_user(config: StoreConfig, action: UserAction) -> Result<()> {
    let store = open_quiet(config).await?;
    let properties = store.properties();

    match action {
        UserAction::Get { user_id, property } => {
            let property = UserProperty::from_str(&property)?;
            match properties.get(&user_id, property).await? {
                Some(value) => println!("{}", helpers::render_value(&value)),
                None => println!("(unset)"),
            }
        }
        UserAction::Set {
            user_id,
            property,
            value,
        } => {
            let property = UserProperty::from_str(&property)?;
            let value = helpers::parse_value(property, &value)?;
            properties.set(&user_id, property, value).await?;
            println!("  {user_id}.{property} updated");
        }
        UserAction::Delete { user_id, property } => {
            let property = UserProperty::from_str(&property)?;
            if properties.delete(&user_id, property).await? {
                println!("  {user_id}.{property} cleared");
            } else {
                println!("  {user_id}.{property} was not set");
            }
        }
    }

    store.close().await?;
    Ok(())
}
