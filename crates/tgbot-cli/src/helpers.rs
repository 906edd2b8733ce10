//! Shared helper functions used across CLI subcommands.
//!
//! Includes tracing initialization, configuration loading and the
//! conversions between command-line text and property values.

use std::path::Path;

use anyhow::{Context, Result, bail};
use tgbot_store::{CodecPolicy, ColumnType, PropertyValue, StoreConfig, UserProperty};
use tracing::debug;
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber with the given default log level.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Load the store configuration: `.env`, then the TOML file, then
/// environment overrides, then the `--db` flag.
pub fn load_config(path: &Path, db: Option<&Path>) -> Result<StoreConfig> {
    if let Ok(env_file) = dotenvy::dotenv() {
        debug!(path = %env_file.display(), "loaded .env");
    }

    let mut config = StoreConfig::load(path)
        .with_context(|| format!("failed to load config from {}", path.display()))?;
    config.apply_env_overrides(|key| std::env::var(key).ok());
    if let Some(db) = db {
        config.db_path = db.to_path_buf();
    }
    Ok(config)
}

// ---------------------------------------------------------------------------
// Property values
// ---------------------------------------------------------------------------

/// Parse command-line text into a value for `property`.
pub fn parse_value(property: UserProperty, raw: &str) -> Result<PropertyValue> {
    if raw.eq_ignore_ascii_case("null") {
        return Ok(PropertyValue::Null);
    }
    if matches!(property.codec_policy(), CodecPolicy::Encoded { .. }) {
        let json: serde_json::Value =
            serde_json::from_str(raw).with_context(|| format!("{property} expects JSON"))?;
        return Ok(json.into());
    }

    let value = match property.column_type() {
        ColumnType::Integer => match raw {
            "true" => PropertyValue::Integer(1),
            "false" => PropertyValue::Integer(0),
            _ => PropertyValue::Integer(
                raw.parse()
                    .with_context(|| format!("{property} expects an integer"))?,
            ),
        },
        ColumnType::Real => PropertyValue::Real(
            raw.parse()
                .with_context(|| format!("{property} expects a number"))?,
        ),
        ColumnType::Text => PropertyValue::Text(raw.to_string()),
        ColumnType::Blob => bail!("{property} cannot be set from the command line"),
    };
    Ok(value)
}

/// Human-readable rendering of a stored value.
pub fn render_value(value: &PropertyValue) -> String {
    match value {
        PropertyValue::Null => "(null)".to_string(),
        PropertyValue::Integer(i) => i.to_string(),
        PropertyValue::Real(f) => f.to_string(),
        PropertyValue::Text(s) => s.clone(),
        PropertyValue::Blob(b) => format!("<{} bytes>", b.len()),
        PropertyValue::Structured(json) => {
            serde_json::to_string_pretty(json).unwrap_or_else(|_| json.to_string())
        }
    }
}
