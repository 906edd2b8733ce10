//! User properties: the closed set of columns of the `users` table and the
//! values they hold.
//!
//! Property names arrive as strings from the rest of the bot. They are only
//! ever turned into SQL after being parsed into a [`UserProperty`], so an
//! arbitrary name can never reach a statement.

use std::fmt;
use std::str::FromStr;

use rusqlite::types::{Value, ValueRef};
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

// ═══════════════════════════════════════════════════════════════════════
//  Column types and codec policy
// ═══════════════════════════════════════════════════════════════════════

/// Declared SQLite type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Integer,
    Real,
    Blob,
}

impl ColumnType {
    /// The type name used in `CREATE TABLE` / `ALTER TABLE`.
    pub const fn sql(self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Integer => "INTEGER",
            Self::Real => "REAL",
            Self::Blob => "BLOB",
        }
    }

    /// Parse a declared type as reported by `PRAGMA table_info`.
    pub fn from_declared(decl: &str) -> Option<Self> {
        match decl.trim().to_ascii_uppercase().as_str() {
            "TEXT" => Some(Self::Text),
            "INTEGER" => Some(Self::Integer),
            "REAL" => Some(Self::Real),
            "BLOB" => Some(Self::Blob),
            _ => None,
        }
    }
}

/// How a property's logical value maps onto its column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecPolicy {
    /// Stored as the SQL value itself.
    Plain,
    /// Stored as a [`codec`](crate::codec) blob. When `capped`, text and
    /// byte values are truncated to the configured maximum first.
    Encoded { capped: bool },
}

// ═══════════════════════════════════════════════════════════════════════
//  UserProperty
// ═══════════════════════════════════════════════════════════════════════

macro_rules! user_properties {
    ($( $variant:ident => $name:literal : $ty:ident ),+ $(,)?) => {
        /// A settable column of the `users` table.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum UserProperty {
            $( $variant, )+
        }

        impl UserProperty {
            /// Every property, in declaration (column) order.
            pub const ALL: &'static [UserProperty] = &[ $( UserProperty::$variant, )+ ];

            /// Column name.
            pub const fn as_str(self) -> &'static str {
                match self {
                    $( UserProperty::$variant => $name, )+
                }
            }

            /// Declared column type.
            pub const fn column_type(self) -> ColumnType {
                match self {
                    $( UserProperty::$variant => ColumnType::$ty, )+
                }
            }
        }
    };
}

user_properties! {
    Lang => "lang": Text,
    FirstMeet => "first_meet": Real,
    LastTimeAccess => "last_time_access": Real,
    TelegramStars => "telegram_stars": Integer,
    LastDonateTime => "last_donate_time": Real,
    ImageGeneratedCounter => "image_generated_counter": Integer,

    SavedFile => "saved_file": Blob,
    SavedFileName => "saved_file_name": Text,

    Blocked => "blocked": Integer,
    BlockedBing => "blocked_bing": Integer,
    BlockedTotally => "blocked_totally": Integer,
    AutoLeaveChat => "auto_leave_chat": Integer,

    AutoTranslations => "auto_translations": Integer,
    TtsGender => "tts_gender": Text,
    SpeechToTextEngine => "speech_to_text_engine": Text,
    SuggestEnabled => "suggest_enabled": Integer,
    ChatEnabled => "chat_enabled": Integer,
    OriginalMode => "original_mode": Integer,
    OcrLang => "ocr_lang": Text,
    Superchat => "superchat": Integer,
    TranscribeOnly => "transcribe_only": Integer,
    CommandMode => "command_mode": Text,
    VoiceOnlyMode => "voice_only_mode": Integer,
    DisabledKbd => "disabled_kbd": Integer,
    ActionStyle => "action_style": Text,

    ChatMode => "chat_mode": Text,
    Role => "role": Text,
    Temperature => "temperature": Real,
    MaxHistorySize => "max_history_size": Integer,
    BotName => "bot_name": Text,
    PersistantMemory => "persistant_memory": Text,

    ApiKeyGemini => "api_key_gemini": Text,
    ApiKeyGroq => "api_key_groq": Text,
    ApiKeyDeepl => "api_key_deepl": Text,
    ApiKeyHuggingface => "api_key_huggingface": Text,

    DialogGemini => "dialog_gemini": Blob,
    DialogGroq => "dialog_groq": Blob,
    DialogOpenrouter => "dialog_openrouter": Blob,
    DialogShadow => "dialog_shadow": Blob,
    DialogGpt4oMini => "dialog_gpt4omini": Blob,
    DialogGlm => "dialog_glm": Blob,
}

impl UserProperty {
    /// Codec policy for this property.
    pub const fn codec_policy(self) -> CodecPolicy {
        match self {
            Self::SavedFile => CodecPolicy::Encoded { capped: true },
            Self::DialogGemini
            | Self::DialogGroq
            | Self::DialogOpenrouter
            | Self::DialogShadow
            | Self::DialogGpt4oMini
            | Self::DialogGlm => CodecPolicy::Encoded { capped: false },
            _ => CodecPolicy::Plain,
        }
    }

    /// Dialogue history columns.
    pub fn dialogs() -> impl Iterator<Item = UserProperty> {
        Self::ALL
            .iter()
            .copied()
            .filter(|p| p.as_str().starts_with("dialog_"))
    }

    /// Check that `value` fits this column and normalise it.
    ///
    /// Plain columns only accept values of their own type (integers are
    /// widened for REAL columns, booleans become 0/1), so that what is
    /// cached is exactly what SQLite hands back. Uncapped encoded columns
    /// accept anything; capped ones only text and bytes, the two kinds the
    /// cap can cut.
    pub fn coerce(self, value: PropertyValue) -> StoreResult<PropertyValue> {
        if value.is_null() {
            return Ok(value);
        }
        match (self.codec_policy(), value) {
            (CodecPolicy::Encoded { capped: false }, v) => return Ok(v),
            (CodecPolicy::Encoded { capped: true }, v @ (PropertyValue::Text(_) | PropertyValue::Blob(_))) => {
                return Ok(v);
            }
            (CodecPolicy::Encoded { capped: true }, v) => {
                return Err(StoreError::InvalidArgument(format!(
                    "{self} holds text or bytes, got {}",
                    v.kind()
                )));
            }
            (CodecPolicy::Plain, v) => self.coerce_plain(v),
        }
    }

    fn coerce_plain(self, value: PropertyValue) -> StoreResult<PropertyValue> {
        match (self.column_type(), value) {
            (ColumnType::Integer, v @ PropertyValue::Integer(_)) => Ok(v),
            (ColumnType::Real, v @ PropertyValue::Real(_)) => Ok(v),
            (ColumnType::Real, PropertyValue::Integer(i)) => Ok(PropertyValue::Real(i as f64)),
            (ColumnType::Text, v @ PropertyValue::Text(_)) => Ok(v),
            (ColumnType::Blob, v @ PropertyValue::Blob(_)) => Ok(v),
            (ty, v) => Err(StoreError::InvalidArgument(format!(
                "{} is a {} column, got {}",
                self,
                ty.sql(),
                v.kind()
            ))),
        }
    }
}

impl fmt::Display for UserProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserProperty {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| StoreError::UnknownProperty(s.to_string()))
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  PropertyValue
// ═══════════════════════════════════════════════════════════════════════

/// The logical value of a user property.
///
/// `Structured` carries arbitrary JSON-shaped data (dialogue histories) and
/// is only accepted by encoded columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    Structured(serde_json::Value),
}

impl PropertyValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Real(f) => Some(*f),
            Self::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Flags are stored as 0/1 integers.
    pub fn as_bool(&self) -> Option<bool> {
        self.as_i64().map(|i| i != 0)
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Blob(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_structured(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Structured(v) => Some(v),
            _ => None,
        }
    }

    /// Short name of the variant, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Integer(_) => "integer",
            Self::Real(_) => "real",
            Self::Text(_) => "text",
            Self::Blob(_) => "blob",
            Self::Structured(_) => "structured",
        }
    }

    /// Approximate in-memory footprint, used for the cache ceiling.
    pub fn approx_size(&self) -> usize {
        let payload = match self {
            Self::Null | Self::Integer(_) | Self::Real(_) => 0,
            Self::Text(s) => s.len(),
            Self::Blob(b) => b.len(),
            Self::Structured(v) => structured_size(v),
        };
        std::mem::size_of::<Self>() + payload
    }

    /// Truncate text or bytes to at most `max_bytes`, respecting UTF-8
    /// character boundaries.
    pub(crate) fn truncated(self, max_bytes: usize) -> Self {
        match self {
            Self::Text(mut s) if s.len() > max_bytes => {
                let mut cut = max_bytes;
                while !s.is_char_boundary(cut) {
                    cut -= 1;
                }
                s.truncate(cut);
                Self::Text(s)
            }
            Self::Blob(mut b) if b.len() > max_bytes => {
                b.truncate(max_bytes);
                Self::Blob(b)
            }
            other => other,
        }
    }

    /// Convert into an owned SQL value. `Structured` has no SQL form.
    pub(crate) fn to_sql_value(&self) -> StoreResult<Value> {
        Ok(match self {
            Self::Null => Value::Null,
            Self::Integer(i) => Value::Integer(*i),
            Self::Real(f) => Value::Real(*f),
            Self::Text(s) => Value::Text(s.clone()),
            Self::Blob(b) => Value::Blob(b.clone()),
            Self::Structured(_) => {
                return Err(StoreError::InvalidArgument(
                    "structured values need an encoded column".into(),
                ));
            }
        })
    }

    pub(crate) fn from_sql_ref(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => Self::Null,
            ValueRef::Integer(i) => Self::Integer(i),
            ValueRef::Real(f) => Self::Real(f),
            ValueRef::Text(t) => Self::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Self::Blob(b.to_vec()),
        }
    }
}

fn structured_size(value: &serde_json::Value) -> usize {
    use serde_json::Value as J;
    match value {
        J::Null | J::Bool(_) | J::Number(_) => 8,
        J::String(s) => s.len(),
        J::Array(items) => items.iter().map(structured_size).sum::<usize>() + 8,
        J::Object(map) => map.iter().map(|(k, v)| k.len() + structured_size(v)).sum::<usize>() + 8,
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<i32> for PropertyValue {
    fn from(v: i32) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        Self::Real(v)
    }
}

impl From<Vec<u8>> for PropertyValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Blob(v)
    }
}

impl From<serde_json::Value> for PropertyValue {
    fn from(v: serde_json::Value) -> Self {
        Self::Structured(v)
    }
}

impl<T: Into<PropertyValue>> From<Option<T>> for PropertyValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

// ── tests ────────────────────────────────────────────────────────────
