//! Per-application, daily-rotated file sink.
//!
//! Each `(application, day)` pair maps to one append handle, created lazily
//! on the first write of the day and kept open until shutdown. Rotation is
//! implicit: the first write after midnight computes a new file key and
//! opens a fresh handle. Batch writes are grouped per file so each handle
//! is written to once per batch and flushed once.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{Local, NaiveDateTime};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::errors::StorageError;
use crate::record::{LogLevel, LogRecord, TIMESTAMP_FORMAT};

const DATE_FORMAT: &str = "%Y-%m-%d";

pub struct FileStorage {
    base_dir: PathBuf,
    /// file name -> open append handle; read-locked on the write path,
    /// write-locked only to open a new handle
    writers: RwLock<HashMap<String, Arc<Mutex<File>>>>,
    logs_stored: AtomicU64,
    bytes_written: AtomicU64,
}

/// Point-in-time view of the storage counters.
#[derive(Debug, Clone, Copy)]
pub struct StorageStats {
    pub open_files: usize,
    pub logs_stored: u64,
    pub bytes_written: u64,
}

impl std::fmt::Display for StorageStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Storage Stats - Files: {}, Logs: {}, Bytes: {}",
            self.open_files, self.logs_stored, self.bytes_written
        )
    }
}

impl FileStorage {
    /// Opens the sink rooted at `base_dir`, creating the directory if needed.
    pub async fn new(base_dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let base_dir = base_dir.into();
        tokio::fs::create_dir_all(&base_dir)
            .await
            .map_err(|source| StorageError::CreateDir {
                path: base_dir.clone(),
                source,
            })?;
        Ok(FileStorage {
            base_dir,
            writers: RwLock::new(HashMap::new()),
            logs_stored: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        })
    }

    /// Writes a single record. Equivalent to a one-record batch.
    pub async fn store(&self, record: &LogRecord) -> Result<(), StorageError> {
        self.store_batch(std::slice::from_ref(record)).await
    }

    /// Writes a batch, grouped per file key so every handle sees one write
    /// and one flush. File keys are computed per record, so a batch written
    /// across midnight lands in both days' files.
    pub async fn store_batch(&self, records: &[LogRecord]) -> Result<(), StorageError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut groups: HashMap<String, String> = HashMap::new();
        let mut counts: HashMap<String, u64> = HashMap::new();
        for record in records {
            let key = file_name(&record.application);
            let chunk = groups.entry(key.clone()).or_default();
            chunk.push_str(&record.to_storage_line());
            chunk.push('\n');
            *counts.entry(key).or_default() += 1;
        }

        for (name, chunk) in groups {
            let writer = self.writer_for(&name).await?;
            let mut file = writer.lock().await;
            file.write_all(chunk.as_bytes())
                .await
                .map_err(|source| StorageError::Write {
                    path: self.base_dir.join(&name),
                    source,
                })?;
            file.flush().await.map_err(|source| StorageError::Write {
                path: self.base_dir.join(&name),
                source,
            })?;
            drop(file);

            self.logs_stored
                .fetch_add(counts.get(&name).copied().unwrap_or(0), Ordering::Relaxed);
            self.bytes_written
                .fetch_add(chunk.len() as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Re-reads today's file for `application`, best effort, up to `limit`
    /// records. Diagnostic path only.
    pub async fn get_by_application(
        &self,
        application: &str,
        limit: usize,
    ) -> Result<Vec<LogRecord>, StorageError> {
        let path = self.base_dir.join(file_name(application));
        if !path.exists() {
            return Ok(Vec::new());
        }
        let contents = read_file(&path).await?;
        Ok(contents
            .lines()
            .filter_map(parse_stored_line)
            .take(limit)
            .collect())
    }

    /// Scans every `.log` file under the base directory for records at
    /// `level`, up to `limit`. Diagnostic path only.
    pub async fn get_by_level(
        &self,
        level: LogLevel,
        limit: usize,
    ) -> Result<Vec<LogRecord>, StorageError> {
        let mut found = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.base_dir)
            .await
            .map_err(|source| StorageError::Read {
                path: self.base_dir.clone(),
                source,
            })?;

        while let Some(entry) = dir.next_entry().await.map_err(|source| StorageError::Read {
            path: self.base_dir.clone(),
            source,
        })? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("log") {
                continue;
            }
            let contents = match read_file(&path).await {
                Ok(contents) => contents,
                Err(err) => {
                    warn!("skipping unreadable log file: {err}");
                    continue;
                }
            };
            for line in contents.lines() {
                if found.len() >= limit {
                    return Ok(found);
                }
                if let Some(record) = parse_stored_line(line) {
                    if record.level == level {
                        found.push(record);
                    }
                }
            }
        }
        Ok(found)
    }

    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub async fn stats(&self) -> StorageStats {
        StorageStats {
            open_files: self.writers.read().await.len(),
            logs_stored: self.logs_stored.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }

    /// Flushes and drops every open handle.
    pub async fn close(&self) {
        let mut writers = self.writers.write().await;
        for (name, writer) in writers.drain() {
            let mut file = writer.lock().await;
            if let Err(err) = file.sync_all().await {
                warn!("failed to sync {name} on close: {err}");
            }
        }
        info!(
            "storage closed - logs: {}, bytes: {}",
            self.logs_stored.load(Ordering::Relaxed),
            self.bytes_written.load(Ordering::Relaxed)
        );
    }

    async fn writer_for(&self, name: &str) -> Result<Arc<Mutex<File>>, StorageError> {
        if let Some(writer) = self.writers.read().await.get(name) {
            return Ok(Arc::clone(writer));
        }

        let mut writers = self.writers.write().await;
        // another writer may have created the handle while we upgraded
        if let Some(writer) = writers.get(name) {
            return Ok(Arc::clone(writer));
        }

        let path = self.base_dir.join(name);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|source| StorageError::Open {
                path: path.clone(),
                source,
            })?;
        debug!("opened log file {}", path.display());
        let writer = Arc::new(Mutex::new(file));
        writers.insert(name.to_string(), Arc::clone(&writer));
        Ok(writer)
    }
}

fn file_name(application: &str) -> String {
    format!("{}_{}.log", application, Local::now().format(DATE_FORMAT))
}

async fn read_file(path: &Path) -> Result<String, StorageError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| StorageError::Read {
            path: path.to_path_buf(),
            source,
        })
}

/// Best-effort re-parse of a stored line back into a record. Lines that do
/// not match the storage format yield `None`.
fn parse_stored_line(line: &str) -> Option<LogRecord> {
    let rest = line.strip_prefix('[')?;
    let (timestamp, rest) = rest.split_once("] ")?;
    let (level_name, rest) = rest.split_once(' ')?;
    let level = LogLevel::from_name(level_name)?;
    let rest = rest.strip_prefix('[')?;
    let (application, rest) = rest.split_once("] ")?;
    let rest = rest.strip_prefix('[')?;
    let (hostname, rest) = rest.split_once("] - ")?;

    let (message, metadata) = match rest.rfind(" {") {
        Some(pos) if rest.ends_with('}') => {
            let mut metadata = BTreeMap::new();
            for pair in rest[pos + 2..rest.len() - 1].split(", ") {
                if let Some((key, value)) = pair.split_once('=') {
                    metadata.insert(key.to_string(), value.to_string());
                }
            }
            (rest[..pos].to_string(), metadata)
        }
        _ => (rest.to_string(), BTreeMap::new()),
    };

    let mut record = LogRecord::new(level, message, application, hostname, metadata);
    if let Ok(parsed) = NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT) {
        if let Some(local) = parsed.and_local_timezone(Local).single() {
            record.timestamp = local;
        }
    }
    Some(record)
}
