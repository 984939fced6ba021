//! Server configuration.
//!
//! The configuration is built once at startup and handed by reference into
//! every component. Values come from a properties-style `key=value` file;
//! a missing file or a malformed value logs a warning and falls back to
//! the built-in defaults, so the server always starts.

use std::collections::HashMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::{info, warn};

/// Storage backend selector. Only the file backend is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageBackend {
    #[default]
    File,
}

/// Wire/file format selector. Only the text format is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// `server.port` - TCP listen port.
    pub port: u16,
    /// `buffer.size` - capacity of the ring buffer.
    pub buffer_size: usize,
    /// `thread.pool.size` - processor worker count.
    pub thread_pool_size: usize,
    /// `storage.type` - backend tag.
    pub storage_backend: StorageBackend,
    /// `storage.directory` - base directory for sink files.
    pub storage_directory: PathBuf,
    /// `log.format` - wire/file format.
    pub log_format: LogFormat,
    /// `server.maxClients` - acceptor admission cap.
    pub max_clients: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 8080,
            buffer_size: 1000,
            thread_pool_size: 10,
            storage_backend: StorageBackend::File,
            storage_directory: PathBuf::from("./logs"),
            log_format: LogFormat::Text,
            max_clients: 50,
        }
    }
}

impl Config {
    /// Loads configuration from a properties file, falling back to the
    /// defaults when the file cannot be read.
    #[must_use]
    pub fn load(path: &Path) -> Config {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                info!("configuration loaded from {}", path.display());
                Self::from_properties(&contents)
            }
            Err(err) => {
                warn!(
                    "could not read configuration {} ({err}), using built-in defaults",
                    path.display()
                );
                Config::default()
            }
        }
    }

    /// Parses `key=value` properties. Unknown keys are ignored; malformed
    /// values keep their defaults with a warning.
    #[must_use]
    pub fn from_properties(contents: &str) -> Config {
        let props = parse_properties(contents);
        let mut config = Config::default();

        parse_into(&props, "server.port", &mut config.port);
        parse_into(&props, "buffer.size", &mut config.buffer_size);
        parse_into(&props, "thread.pool.size", &mut config.thread_pool_size);
        parse_into(&props, "server.maxClients", &mut config.max_clients);

        if let Some(raw) = props.get("storage.directory") {
            config.storage_directory = PathBuf::from(raw);
        }
        if let Some(raw) = props.get("storage.type") {
            match raw.as_str() {
                "file" => config.storage_backend = StorageBackend::File,
                other => warn!("unknown storage.type '{other}', keeping file backend"),
            }
        }
        if let Some(raw) = props.get("log.format") {
            match raw.as_str() {
                "text" => config.log_format = LogFormat::Text,
                other => warn!("unknown log.format '{other}', keeping text"),
            }
        }

        config
    }
}

fn parse_into<T: FromStr + Display>(props: &HashMap<String, String>, key: &str, target: &mut T) {
    if let Some(raw) = props.get(key) {
        match raw.parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => warn!("invalid value '{raw}' for {key}, keeping {target}"),
        }
    }
}

fn parse_properties(contents: &str) -> HashMap<String, String> {
    let mut props = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            props.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    props
}
