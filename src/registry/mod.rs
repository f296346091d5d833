//! Shared registry - the only medium peers coordinate through
//!
//! A registry is a string key/value store visible to every peer of one
//! origin. A write by one peer produces a change notification in every
//! *other* live peer. There is no cross-key atomicity, no locking and no
//! read-your-writes guarantee across peers, so the [`Registry`] wrapper
//! treats every failure and every malformed value as "unset".

mod directory;
mod memory;
mod payload;

pub use directory::DirectoryRegistry;
pub use memory::{MemoryRegistry, MemoryRegistryHub};
pub use payload::{StopNotice, UploadRequest, UploadResponse};

use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::ids::PeerId;

/// The fixed set of keys peers share
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistryKey {
    SessionId,
    SessionStartTime,
    DrawingMode,
    OriginPage,
    PrimaryPeer,
    LastActivePeer,
    StopNotification,
    UploadRequest,
    UploadResponse,
}

impl RegistryKey {
    pub const ALL: [RegistryKey; 9] = [
        RegistryKey::SessionId,
        RegistryKey::SessionStartTime,
        RegistryKey::DrawingMode,
        RegistryKey::OriginPage,
        RegistryKey::PrimaryPeer,
        RegistryKey::LastActivePeer,
        RegistryKey::StopNotification,
        RegistryKey::UploadRequest,
        RegistryKey::UploadResponse,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RegistryKey::SessionId => "recordId",
            RegistryKey::SessionStartTime => "recordingStartTime",
            RegistryKey::DrawingMode => "wasInDrawingMode",
            RegistryKey::OriginPage => "recording-original-page",
            RegistryKey::PrimaryPeer => "primary-recording-page-id",
            RegistryKey::LastActivePeer => "last-active-page",
            RegistryKey::StopNotification => "recording-stop-notification",
            RegistryKey::UploadRequest => "request-events-upload",
            RegistryKey::UploadResponse => "events-data-response",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|key| key.as_str() == raw)
    }
}

/// A change observed by a peer that did not make it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryChange {
    pub key: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

impl RegistryChange {
    pub fn new(key: RegistryKey, old_value: Option<&str>, new_value: Option<&str>) -> Self {
        Self {
            key: key.as_str().to_string(),
            old_value: old_value.map(str::to_string),
            new_value: new_value.map(str::to_string),
        }
    }
}

/// Stream of changes made by other peers
pub type RegistryChanges = mpsc::UnboundedReceiver<RegistryChange>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry storage unavailable: {0}")]
    Unavailable(String),
    #[error("registry I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("registry record malformed: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("registry watcher error: {0}")]
    Watch(#[from] notify::Error),
}

/// Storage medium behind a [`Registry`]
pub trait RegistryBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, RegistryError>;

    fn set(&self, key: &str, value: &str) -> Result<(), RegistryError>;

    fn remove(&self, key: &str) -> Result<(), RegistryError>;

    /// Start receiving changes written by other peers
    fn subscribe(&self) -> Result<RegistryChanges, RegistryError>;
}

/// Fault-absorbing, typed view of the shared registry
///
/// Reads that fail or yield junk return `None`; writes that fail are logged
/// and dropped. A peer whose storage is broken therefore keeps working as a
/// lone recorder.
#[derive(Clone)]
pub struct Registry {
    backend: Arc<dyn RegistryBackend>,
}

impl Registry {
    pub fn new(backend: Arc<dyn RegistryBackend>) -> Self {
        Self { backend }
    }

    pub fn get(&self, key: RegistryKey) -> Option<String> {
        match self.backend.get(key.as_str()) {
            Ok(Some(value)) if !is_unset(&value) => Some(value),
            Ok(_) => None,
            Err(e) => {
                warn!("Failed to read {} from registry: {}", key.as_str(), e);
                None
            }
        }
    }

    pub fn set(&self, key: RegistryKey, value: &str) {
        if let Err(e) = self.backend.set(key.as_str(), value) {
            warn!("Failed to write {} to registry: {}", key.as_str(), e);
        }
    }

    pub fn remove(&self, key: RegistryKey) {
        if let Err(e) = self.backend.remove(key.as_str()) {
            warn!("Failed to remove {} from registry: {}", key.as_str(), e);
        }
    }

    /// Subscribe to other peers' writes. `None` when storage is unavailable.
    pub fn subscribe(&self) -> Option<RegistryChanges> {
        match self.backend.subscribe() {
            Ok(rx) => Some(rx),
            Err(e) => {
                warn!("Registry notifications unavailable, running standalone: {}", e);
                None
            }
        }
    }

    pub fn session_id(&self) -> Option<String> {
        self.get(RegistryKey::SessionId)
    }

    pub fn session_started_at(&self) -> Option<DateTime<Utc>> {
        let raw = self.get(RegistryKey::SessionStartTime)?;
        let millis = raw.trim().parse::<i64>().ok()?;
        Utc.timestamp_millis_opt(millis).single()
    }

    pub fn origin_page(&self) -> Option<String> {
        self.get(RegistryKey::OriginPage)
    }

    pub fn primary_peer(&self) -> Option<PeerId> {
        self.get(RegistryKey::PrimaryPeer).map(PeerId::from)
    }

    pub fn last_active_peer(&self) -> Option<PeerId> {
        self.get(RegistryKey::LastActivePeer).map(PeerId::from)
    }

    pub fn drawing_mode(&self) -> bool {
        self.get(RegistryKey::DrawingMode).as_deref() == Some("true")
    }

    pub fn set_drawing_mode(&self, enabled: bool) {
        self.set(RegistryKey::DrawingMode, if enabled { "true" } else { "false" });
    }

    /// Read a JSON payload; absent or malformed payloads read as `T::default()`
    pub fn read_json<T: DeserializeOwned + Default>(&self, key: RegistryKey) -> T {
        self.get(key)
            .map(|raw| parse_payload(&raw))
            .unwrap_or_default()
    }

    pub fn write_json<T: Serialize>(&self, key: RegistryKey, payload: &T) {
        match serde_json::to_string(payload) {
            Ok(raw) => self.set(key, &raw),
            Err(e) => warn!("Failed to encode {} payload: {}", key.as_str(), e),
        }
    }

    /// Remove every key belonging to a recording session
    pub fn clear_session(&self) {
        debug!("Clearing persisted session keys");
        for key in RegistryKey::ALL {
            self.remove(key);
        }
    }
}

/// Decode a notification payload, tolerating junk
pub fn parse_payload<T: DeserializeOwned + Default>(raw: &str) -> T {
    serde_json::from_str(raw).unwrap_or_default()
}

pub(crate) fn is_unset(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty() || trimmed == "null" || trimmed == "undefined"
}
