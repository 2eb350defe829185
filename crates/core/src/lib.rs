//! kblocks core types: event envelopes, object URIs, cursor arithmetic and settings.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub mod cursor;
pub mod settings;
pub mod uri;

pub use cursor::{latest_cursor, position_from_cursor, Cursor, Position};
pub use settings::Settings;
pub use uri::{ObjUri, UriError};

pub mod prelude {
    pub use super::{
        Envelope, ErrorEvent, Event, EventKind, LifecycleEvent, LifecyclePhase, LogEvent, LogLevel, ObjectEvent,
        ObjectReason,
    };
    pub use super::cursor::{latest_cursor, position_from_cursor, Cursor, Position};
    pub use super::uri::ObjUri;
}

/// Failure to turn a wire payload into an [`Event`].
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("payload is not valid utf-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("malformed event: {0}")]
    Json(#[from] serde_json::Error),
}

/// Metadata shared by every event variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Target resource, `kblocks://group/version/plural/system/namespace/name`.
    pub obj_uri: String,
    pub obj_type: String,
    pub timestamp: DateTime<Utc>,
    /// Correlates every event produced while handling one change.
    #[serde(default)]
    pub request_id: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObjectReason {
    Create,
    Update,
    Delete,
    Sync,
    Read,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObjectEvent {
    #[serde(flatten)]
    pub envelope: Envelope,
    /// Resource body as reported by the cluster, possibly partial.
    #[serde(default)]
    pub object: serde_json::Value,
    pub reason: ObjectReason,
}

/// Kubernetes-style event describing a lifecycle transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LifecyclePhase {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LifecycleEvent {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub event: LifecyclePhase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        }
    }

    fn from_index(n: u64) -> Option<Self> {
        match n {
            0 => Some(LogLevel::Debug),
            1 => Some(LogLevel::Info),
            2 => Some(LogLevel::Warning),
            3 => Some(LogLevel::Error),
            _ => None,
        }
    }

    fn from_name(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARNING" | "WARN" => Some(LogLevel::Warning),
            "ERROR" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

// Producers emit the numeric enum index; older ones emit the name.
impl Serialize for LogLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for LogLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct LevelVisitor;

        impl<'de> serde::de::Visitor<'de> for LevelVisitor {
            type Value = LogLevel;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a log level index 0..=3 or one of DEBUG/INFO/WARNING/ERROR")
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<LogLevel, E> {
                LogLevel::from_index(v).ok_or_else(|| E::custom(format!("unknown log level {}", v)))
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<LogLevel, E> {
                u64::try_from(v)
                    .ok()
                    .and_then(LogLevel::from_index)
                    .ok_or_else(|| E::custom(format!("unknown log level {}", v)))
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<LogLevel, E> {
                LogLevel::from_name(v).ok_or_else(|| E::custom(format!("unknown log level {:?}", v)))
            }
        }

        deserializer.deserialize_any(LevelVisitor)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub level: LogLevel,
    pub message: String,
    /// Unique within the object; lets other logs nest under this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_log_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorEvent {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<serde_json::Value>,
}

/// Wire event. Exactly one variant per payload, selected by the `type` tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Event {
    Object(ObjectEvent),
    Lifecycle(LifecycleEvent),
    Log(LogEvent),
    Error(ErrorEvent),
}

/// Variant tag without the payload, handy for logging and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Object,
    Lifecycle,
    Log,
    Error,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Object => "OBJECT",
            EventKind::Lifecycle => "LIFECYCLE",
            EventKind::Log => "LOG",
            EventKind::Error => "ERROR",
        }
    }
}

impl Event {
    pub fn from_json(payload: &[u8]) -> Result<Self, DecodeError> {
        let text = std::str::from_utf8(payload)?;
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> serde_json::Result<String> { serde_json::to_string(self) }

    pub fn envelope(&self) -> &Envelope {
        match self {
            Event::Object(e) => &e.envelope,
            Event::Lifecycle(e) => &e.envelope,
            Event::Log(e) => &e.envelope,
            Event::Error(e) => &e.envelope,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Event::Object(_) => EventKind::Object,
            Event::Lifecycle(_) => EventKind::Lifecycle,
            Event::Log(_) => EventKind::Log,
            Event::Error(_) => EventKind::Error,
        }
    }

    pub fn obj_uri(&self) -> &str { &self.envelope().obj_uri }

    pub fn timestamp(&self) -> DateTime<Utc> { self.envelope().timestamp }
}
