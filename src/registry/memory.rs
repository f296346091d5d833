//! In-process registry with browser-storage notification semantics
//!
//! Every [`MemoryRegistry`] handle connected to one hub behaves like a
//! separate peer: a write is visible to all handles immediately, and a change
//! notification is delivered to every handle except the writer, only when the
//! value actually changed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

use super::{RegistryBackend, RegistryChange, RegistryChanges, RegistryError};

#[derive(Default)]
struct HubState {
    values: HashMap<String, String>,
    subscribers: Vec<(u64, mpsc::UnboundedSender<RegistryChange>)>,
    next_handle: u64,
    unavailable: bool,
}

/// Shared storage that [`MemoryRegistry`] handles connect to
#[derive(Clone, Default)]
pub struct MemoryRegistryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryRegistryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a new peer handle
    pub fn connect(&self) -> MemoryRegistry {
        let handle = {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            state.next_handle += 1;
            state.next_handle
        };
        MemoryRegistry {
            handle,
            state: Arc::clone(&self.state),
        }
    }

    /// Simulate storage that throws on every access (quota, privacy mode)
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.unavailable = unavailable;
        }
    }

    /// Copy of the current contents
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.state
            .lock()
            .map(|state| state.values.clone())
            .unwrap_or_default()
    }
}

/// One peer's view of a [`MemoryRegistryHub`]
pub struct MemoryRegistry {
    handle: u64,
    state: Arc<Mutex<HubState>>,
}

impl MemoryRegistry {
    fn lock(&self) -> Result<MutexGuard<'_, HubState>, RegistryError> {
        let state = self
            .state
            .lock()
            .map_err(|_| RegistryError::Unavailable("registry lock poisoned".to_string()))?;
        if state.unavailable {
            return Err(RegistryError::Unavailable("storage disabled".to_string()));
        }
        Ok(state)
    }

    fn publish(&self, state: &mut HubState, change: RegistryChange) {
        let writer = self.handle;
        state.subscribers.retain(|(handle, tx)| {
            if *handle == writer {
                return !tx.is_closed();
            }
            tx.send(change.clone()).is_ok()
        });
    }
}

impl RegistryBackend for MemoryRegistry {
    fn get(&self, key: &str) -> Result<Option<String>, RegistryError> {
        Ok(self.lock()?.values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), RegistryError> {
        let mut state = self.lock()?;
        let old_value = state.values.insert(key.to_string(), value.to_string());
        if old_value.as_deref() != Some(value) {
            let change = RegistryChange {
                key: key.to_string(),
                old_value,
                new_value: Some(value.to_string()),
            };
            self.publish(&mut state, change);
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), RegistryError> {
        let mut state = self.lock()?;
        if let Some(old_value) = state.values.remove(key) {
            let change = RegistryChange {
                key: key.to_string(),
                old_value: Some(old_value),
                new_value: None,
            };
            self.publish(&mut state, change);
        }
        Ok(())
    }

    fn subscribe(&self) -> Result<RegistryChanges, RegistryError> {
        let mut state = self.lock()?;
        let (tx, rx) = mpsc::unbounded_channel();
        state.subscribers.push((self.handle, tx));
        Ok(rx)
    }
}
