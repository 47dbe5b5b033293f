//! Reference counting of "who needs a live value for this slot".
//!
//! Counts live inside the [`StateStore`] and are only changed through the
//! `IncrementListener` / `DecrementListener` transitions. Starting to listen never
//! fetches; the next block tick picks the slot up.

use crate::state_store::{StateError, StateStore, Transition};
use crate::types::SlotKey;
use log::{debug, error};
use std::sync::Arc;

#[derive(Clone)]
pub struct ListenerRegistry {
    store: Arc<StateStore>,
}

impl ListenerRegistry {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    /// Increment the listener count, creating an empty slot if needed.
    pub fn start_listening(&self, key: SlotKey) -> Result<(), StateError> {
        self.store.apply(Transition::IncrementListener {
            scope: key.scope,
            owner: key.owner,
            resource: key.resource,
        })?;
        debug!("ListenerRegistry: +1 on {}", key);
        Ok(())
    }

    /// Decrement the listener count. Stopping a slot with no listeners is a logged no-op.
    pub fn stop_listening(&self, key: SlotKey) -> Result<(), StateError> {
        let report = self.store.apply(Transition::DecrementListener {
            scope: key.scope,
            owner: key.owner,
            resource: key.resource,
        })?;
        if report.changed {
            debug!("ListenerRegistry: -1 on {}", key);
        }
        Ok(())
    }

    pub fn listener_count(&self, key: &SlotKey) -> u32 {
        self.store.get(key).map(|t| t.listener_count).unwrap_or(0)
    }

    /// Start listening on every key; the returned handle stops them all when dropped.
    pub fn listen(&self, keys: Vec<SlotKey>) -> Result<ListeningHandle, StateError> {
        let mut acquired = Vec::with_capacity(keys.len());
        for key in keys {
            if let Err(e) = self.start_listening(key) {
                // Roll back what was already acquired
                drop(ListeningHandle { registry: self.clone(), keys: acquired });
                return Err(e);
            }
            acquired.push(key);
        }
        Ok(ListeningHandle { registry: self.clone(), keys: acquired })
    }
}

/// Scoped listener acquisition. Releases on drop, including early returns and unwinding.
#[must_use = "dropping the handle stops listening immediately"]
pub struct ListeningHandle {
    registry: ListenerRegistry,
    keys: Vec<SlotKey>,
}

impl ListeningHandle {
    pub fn keys(&self) -> &[SlotKey] {
        &self.keys
    }

    /// Stop listening now instead of at scope exit.
    pub fn release(self) {}
}

impl Drop for ListeningHandle {
    fn drop(&mut self) {
        for key in self.keys.drain(..) {
            if let Err(e) = self.registry.stop_listening(key) {
                error!("ListenerRegistry: failed to release {}: {}", key, e);
            }
        }
    }
}

impl std::fmt::Debug for ListeningHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListeningHandle").field("keys", &self.keys).finish()
    }
}
