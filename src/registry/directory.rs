//! Directory-backed registry for peers running as separate processes
//!
//! Each key lives in its own `<key>.json` file holding the value and the id
//! of the peer that wrote it. A `notify` watcher turns file changes into
//! [`RegistryChange`]s; changes written by this peer, and rewrites that do
//! not change the value, are suppressed. Removal writes a tombstone so the
//! remover stays identifiable.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{RegistryBackend, RegistryChange, RegistryChanges, RegistryError};

const RECORD_EXTENSION: &str = "json";

/// On-disk form of one key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Record {
    writer: String,
    value: Option<String>,
}

pub struct DirectoryRegistry {
    dir: PathBuf,
    writer: String,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl DirectoryRegistry {
    /// Open (creating if needed) a registry directory as peer `writer`
    pub fn open(dir: impl Into<PathBuf>, writer: impl Into<String>) -> Result<Self, RegistryError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            writer: writer.into(),
            watcher: Mutex::new(None),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", key, RECORD_EXTENSION))
    }

    fn write_record(&self, key: &str, value: Option<&str>) -> Result<(), RegistryError> {
        let record = Record {
            writer: self.writer.clone(),
            value: value.map(str::to_string),
        };
        let bytes = serde_json::to_vec(&record)?;

        // Write-then-rename so readers never observe a torn record
        let tmp = self.dir.join(format!(".{}.{}.tmp", key, self.writer));
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, self.path_for(key))?;
        Ok(())
    }

    fn scan(&self) -> HashMap<String, Option<String>> {
        let mut values = HashMap::new();
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return values;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(key) = key_for_path(&path) else {
                continue;
            };
            if let Ok(Some(record)) = read_record(&path) {
                values.insert(key, record.value);
            }
        }
        values
    }
}

impl RegistryBackend for DirectoryRegistry {
    fn get(&self, key: &str) -> Result<Option<String>, RegistryError> {
        Ok(read_record(&self.path_for(key))?.and_then(|record| record.value))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), RegistryError> {
        self.write_record(key, Some(value))
    }

    fn remove(&self, key: &str) -> Result<(), RegistryError> {
        if self.get(key)?.is_none() {
            return Ok(());
        }
        self.write_record(key, None)
    }

    fn subscribe(&self) -> Result<RegistryChanges, RegistryError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut tracker = ChangeTracker::new(self.writer.clone(), self.scan());

        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| {
                let event = match result {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("Registry watcher error: {}", e);
                        return;
                    }
                };
                if matches!(event.kind, EventKind::Access(_)) {
                    return;
                }
                for path in event.paths {
                    let Some(key) = key_for_path(&path) else {
                        continue;
                    };
                    let record = match read_record(&path) {
                        Ok(Some(record)) => record,
                        Ok(None) => continue,
                        Err(e) => {
                            debug!("Skipping unreadable registry record {:?}: {}", path, e);
                            continue;
                        }
                    };
                    if let Some(change) = tracker.observe(&key, record) {
                        let _ = tx.send(change);
                    }
                }
            },
            notify::Config::default(),
        )?;
        watcher.watch(&self.dir, RecursiveMode::NonRecursive)?;

        // Replacing an older watcher drops its sender and closes that stream
        let mut slot = self
            .watcher
            .lock()
            .map_err(|_| RegistryError::Unavailable("watcher lock poisoned".to_string()))?;
        *slot = Some(watcher);

        Ok(rx)
    }
}

/// Remembers the last value seen per key so only real changes by other
/// peers are reported
struct ChangeTracker {
    own_writer: String,
    values: HashMap<String, Option<String>>,
}

impl ChangeTracker {
    fn new(own_writer: String, values: HashMap<String, Option<String>>) -> Self {
        Self { own_writer, values }
    }

    fn observe(&mut self, key: &str, record: Record) -> Option<RegistryChange> {
        let old_value = self.values.insert(key.to_string(), record.value.clone()).flatten();
        if record.writer == self.own_writer || old_value == record.value {
            return None;
        }
        Some(RegistryChange {
            key: key.to_string(),
            old_value,
            new_value: record.value,
        })
    }
}

fn key_for_path(path: &Path) -> Option<String> {
    if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXTENSION) {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.starts_with('.') {
        return None;
    }
    Some(stem.to_string())
}

fn read_record(path: &Path) -> Result<Option<Record>, RegistryError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
