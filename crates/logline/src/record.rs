//! The normalised log record flowing through the pipeline, and its
//! severity levels.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Local};
use uuid::Uuid;

/// Timestamp layout used in the storage line format, millisecond precision.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Maximum number of metadata entries a record may carry.
pub const MAX_METADATA_ENTRIES: usize = 100;

/// Slots held back from client-supplied metadata so the keys the pipeline
/// itself attaches (parse, connection and processing stages) always fit
/// under [`MAX_METADATA_ENTRIES`].
pub const RESERVED_PIPELINE_ENTRIES: usize = 16;

/// Cap applied to metadata taken from the wire; the remainder of the
/// per-record budget is reserved for the pipeline.
pub const MAX_CLIENT_METADATA_ENTRIES: usize = MAX_METADATA_ENTRIES - RESERVED_PIPELINE_ENTRIES;

/// Log severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    /// Numeric priority, `TRACE=1` through `FATAL=6`.
    #[must_use]
    pub fn priority(self) -> u8 {
        match self {
            LogLevel::Trace => 1,
            LogLevel::Debug => 2,
            LogLevel::Info => 3,
            LogLevel::Warn => 4,
            LogLevel::Error => 5,
            LogLevel::Fatal => 6,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
        }
    }

    /// Parses a level name, case-insensitively.
    #[must_use]
    pub fn from_name(name: &str) -> Option<LogLevel> {
        match name.to_ascii_uppercase().as_str() {
            "TRACE" => Some(LogLevel::Trace),
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARN" => Some(LogLevel::Warn),
            "ERROR" => Some(LogLevel::Error),
            "FATAL" => Some(LogLevel::Fatal),
            _ => None,
        }
    }

    /// Parses a level name, falling back to `INFO` for anything unknown.
    #[must_use]
    pub fn from_name_lossy(name: &str) -> LogLevel {
        Self::from_name(name).unwrap_or(LogLevel::Info)
    }

    /// `DEBUG` and `TRACE` records are the first eviction candidates under
    /// back-pressure.
    #[must_use]
    pub fn is_low_priority(self) -> bool {
        matches!(self, LogLevel::Trace | LogLevel::Debug)
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single ingested log record.
///
/// `id` and `timestamp` are assigned at construction; `level`, `message`,
/// `application` and `hostname` are never mutated afterwards. `metadata` is
/// only ever extended, and only by whichever pipeline stage currently owns
/// the record, so the map needs no synchronisation of its own.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Local>,
    pub level: LogLevel,
    pub message: String,
    pub application: String,
    pub hostname: String,
    pub metadata: BTreeMap<String, String>,
}

impl LogRecord {
    #[must_use]
    pub fn new(
        level: LogLevel,
        message: impl Into<String>,
        application: impl Into<String>,
        hostname: impl Into<String>,
        metadata: BTreeMap<String, String>,
    ) -> Self {
        LogRecord {
            id: Uuid::new_v4(),
            timestamp: Local::now(),
            level,
            message: message.into(),
            application: application.into(),
            hostname: hostname.into(),
            metadata,
        }
    }

    /// A record with no metadata and an unknown hostname.
    #[must_use]
    pub fn simple(level: LogLevel, message: impl Into<String>, application: impl Into<String>) -> Self {
        Self::new(level, message, application, "unknown", BTreeMap::new())
    }

    /// Adds a metadata entry, respecting the per-record cap. Existing keys
    /// are always updated. Client-supplied metadata is capped well below
    /// this limit ([`MAX_CLIENT_METADATA_ENTRIES`]), so the keys the
    /// pipeline attaches after construction always land.
    pub fn insert_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        if self.metadata.len() >= MAX_METADATA_ENTRIES && !self.metadata.contains_key(&key) {
            return;
        }
        self.metadata.insert(key, value.into());
    }

    /// Renders the storage line format:
    ///
    /// `[YYYY-MM-DD HH:MM:SS.mmm] LEVEL [application] [hostname] - message {k1=v1, k2=v2}`
    ///
    /// The metadata suffix is omitted when the map is empty.
    #[must_use]
    pub fn to_storage_line(&self) -> String {
        let mut line = format!(
            "[{}] {} [{}] [{}] - {}",
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.level,
            self.application,
            self.hostname,
            self.message,
        );
        if !self.metadata.is_empty() {
            line.push_str(" {");
            let mut first = true;
            for (key, value) in &self.metadata {
                if !first {
                    line.push_str(", ");
                }
                line.push_str(key);
                line.push('=');
                line.push_str(value);
                first = false;
            }
            line.push('}');
        }
        line
    }
}
