//! # Persistence
//!
//! Versioned JSON documents in a key/value [`Storage`]:
//!
//! - the user document (preferences, imported tokens and pairs)
//! - the balances document (every slot that was ever fetched, with its block)
//!
//! Writes are debounced. Storage failures are logged and swallowed: the cache keeps
//! working from memory. A document with an unexpected version is discarded.

use crate::debounce::Debouncer;
use crate::metrics;
use crate::state_store::{StateSnapshot, StateStore};
use crate::types::{Entity, EntityId, SlotKey, TrackedValue};
use crate::user_store::{UserData, UserPair, UserPreferences, UserStore};
use chrono::{DateTime, Utc};
use ethers::types::U256;
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Bump when the layout of either document changes.
pub const DOCUMENT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid storage key `{0}`")]
    InvalidKey(String),
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

pub trait Storage: Send + Sync {
    /// `None` when the key is missing or unreadable.
    fn read_json(&self, key: &str) -> Option<serde_json::Value>;
    fn write_json(&self, key: &str, value: &serde_json::Value) -> Result<(), PersistenceError>;
}

/// One `<key>.json` file per key. Writes go to a temp file and are renamed into place.
#[derive(Debug, Clone)]
pub struct FileStorage {
    directory: PathBuf,
}

impl FileStorage {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self { directory: directory.into() }
    }

    fn path(&self, key: &str) -> Result<PathBuf, PersistenceError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
            && !key.starts_with('.');
        if !valid {
            return Err(PersistenceError::InvalidKey(key.to_string()));
        }
        Ok(self.directory.join(format!("{}.json", key)))
    }
}

impl Storage for FileStorage {
    fn read_json(&self, key: &str) -> Option<serde_json::Value> {
        let path = self.path(key).ok()?;
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("FileStorage: failed to read {}: {}", path.display(), e);
                return None;
            }
        };
        match serde_json::from_slice(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("FileStorage: {} is not valid JSON: {}", path.display(), e);
                None
            }
        }
    }

    fn write_json(&self, key: &str, value: &serde_json::Value) -> Result<(), PersistenceError> {
        let path = self.path(key)?;
        std::fs::create_dir_all(&self.directory)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// In-memory storage, for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, serde_json::Value>>,
    fail_writes: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail (simulates a full or read-only disk).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn insert(&self, key: &str, value: serde_json::Value) {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.to_string(), value);
    }
}

impl Storage for MemoryStorage {
    fn read_json(&self, key: &str) -> Option<serde_json::Value> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned()
    }

    fn write_json(&self, key: &str, value: &serde_json::Value) -> Result<(), PersistenceError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("writes disabled".to_string()));
        }
        self.insert(key, value.clone());
        Ok(())
    }
}

/// Persisted user document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentSnapshot {
    pub version: u32,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub last_saved_at: DateTime<Utc>,
    #[serde(default)]
    pub user_preferences: UserPreferences,
    #[serde(default)]
    pub user_added_entities: Vec<Entity>,
    /// Each pair as its two entity ids, in canonical order.
    #[serde(default)]
    pub user_added_pairs: Vec<[EntityId; 2]>,
}

impl PersistentSnapshot {
    pub fn from_user_data(data: UserData) -> Self {
        Self {
            version: DOCUMENT_VERSION,
            last_saved_at: Utc::now(),
            user_preferences: data.preferences,
            user_added_entities: data.entities,
            user_added_pairs: data
                .pairs
                .into_iter()
                .map(|pair| [EntityId::new(pair.scope, pair.token0), EntityId::new(pair.scope, pair.token1)])
                .collect(),
        }
    }

    pub fn into_user_data(self) -> UserData {
        UserData {
            preferences: self.user_preferences,
            entities: self.user_added_entities,
            pairs: self
                .user_added_pairs
                .into_iter()
                .filter_map(|[a, b]| {
                    if a.scope != b.scope {
                        warn!("Persistence: skipping pair {:?}/{:?} across scopes", a, b);
                        return None;
                    }
                    Some(UserPair { scope: a.scope, token0: a.address, token1: b.address })
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSlot {
    #[serde(flatten)]
    pub key: SlotKey,
    pub value: Option<U256>,
    pub as_of_block: u64,
}

/// Persisted balances document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalancesDocument {
    pub version: u32,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub last_saved_at: DateTime<Utc>,
    #[serde(default)]
    pub slots: Vec<PersistedSlot>,
}

impl BalancesDocument {
    /// Only slots fetched at least once; listener counts are process-local and not saved.
    pub fn from_snapshot(snapshot: &StateSnapshot) -> Self {
        let mut slots: Vec<PersistedSlot> = snapshot
            .slots()
            .filter_map(|(key, tracked)| {
                tracked.as_of_block.map(|as_of_block| PersistedSlot {
                    key,
                    value: tracked.value,
                    as_of_block,
                })
            })
            .collect();
        slots.sort_by_key(|slot| slot.key);
        Self {
            version: DOCUMENT_VERSION,
            last_saved_at: Utc::now(),
            slots,
        }
    }

    /// Rehydrated snapshot: values keep their block, every listener count starts at zero.
    pub fn into_snapshot(self) -> StateSnapshot {
        StateSnapshot::from_slots(self.slots.into_iter().map(|slot| {
            (
                slot.key,
                TrackedValue {
                    value: slot.value,
                    as_of_block: Some(slot.as_of_block),
                    listener_count: 0,
                },
            )
        }))
    }
}

/// Read a versioned document, discarding it on version mismatch or parse failure.
pub fn load_document<T: DeserializeOwned>(storage: &dyn Storage, key: &str) -> Option<T> {
    let raw = storage.read_json(key)?;
    let version = raw.get("version").and_then(|v| v.as_u64());
    if version != Some(u64::from(DOCUMENT_VERSION)) {
        info!(
            "Persistence: discarding `{}` (version {:?}, expected {})",
            key, version, DOCUMENT_VERSION
        );
        metrics::increment_persistence_discarded(key, "version_mismatch");
        return None;
    }
    match serde_json::from_value(raw) {
        Ok(document) => Some(document),
        Err(e) => {
            warn!("Persistence: discarding malformed `{}`: {}", key, e);
            metrics::increment_persistence_discarded(key, "malformed");
            None
        }
    }
}

pub fn load_user_data(storage: &dyn Storage, key: &str) -> Option<UserData> {
    load_document::<PersistentSnapshot>(storage, key).map(PersistentSnapshot::into_user_data)
}

pub fn load_balances(storage: &dyn Storage, key: &str) -> Option<StateSnapshot> {
    load_document::<BalancesDocument>(storage, key).map(BalancesDocument::into_snapshot)
}

/// Write a document; failures are logged and reported as `false`.
fn save_document<T: Serialize>(storage: &dyn Storage, key: &str, document: &T) -> bool {
    let result = serde_json::to_value(document)
        .map_err(PersistenceError::from)
        .and_then(|value| storage.write_json(key, &value));
    match result {
        Ok(()) => {
            debug!("Persistence: saved `{}`", key);
            metrics::increment_persistence_write(key, "ok");
            true
        }
        Err(e) => {
            warn!("Persistence: failed to save `{}`: {} (continuing in memory)", key, e);
            metrics::increment_persistence_write(key, "error");
            false
        }
    }
}

#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub debounce: Duration,
    pub balances_key: String,
    pub user_key: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(1000),
            balances_key: "balances".to_string(),
            user_key: "user".to_string(),
        }
    }
}

/// Writes the user and balances documents after changes settle.
pub struct PersistenceBridge {
    storage: Arc<dyn Storage>,
    store: Arc<StateStore>,
    user_store: Arc<UserStore>,
    config: PersistenceConfig,
}

impl PersistenceBridge {
    pub fn new(
        storage: Arc<dyn Storage>,
        store: Arc<StateStore>,
        user_store: Arc<UserStore>,
        config: PersistenceConfig,
    ) -> Self {
        Self { storage, store, user_store, config }
    }

    pub fn save_user(&self) -> bool {
        let document = PersistentSnapshot::from_user_data(self.user_store.export());
        save_document(self.storage.as_ref(), &self.config.user_key, &document)
    }

    pub fn save_balances(&self) -> bool {
        let document = BalancesDocument::from_snapshot(&self.store.snapshot());
        save_document(self.storage.as_ref(), &self.config.balances_key, &document)
    }

    /// Watch both stores and write each document once its changes have been quiet
    /// for the debounce delay.
    pub fn start(self: Arc<Self>) -> PersistenceHandle {
        let user_bridge = self.clone();
        let user_debouncer = Debouncer::spawn(self.config.debounce, move || {
            let bridge = user_bridge.clone();
            async move {
                bridge.save_user();
            }
        });
        let balances_bridge = self.clone();
        let balances_debouncer = Debouncer::spawn(self.config.debounce, move || {
            let bridge = balances_bridge.clone();
            async move {
                bridge.save_balances();
            }
        });

        let debouncers = Arc::new((user_debouncer, balances_debouncer));
        let watched = debouncers.clone();
        let mut user_changes = self.user_store.subscribe();
        let mut state_changes = self.store.subscribe();
        let watcher = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = user_changes.changed() => {
                        if changed.is_err() { break; }
                        watched.0.trigger();
                    }
                    changed = state_changes.changed() => {
                        if changed.is_err() { break; }
                        watched.1.trigger();
                    }
                }
            }
        });

        info!(
            "PersistenceBridge started (debounce {:?}, keys `{}`, `{}`)",
            self.config.debounce, self.config.user_key, self.config.balances_key
        );
        PersistenceHandle { bridge: self, watcher, debouncers }
    }
}

pub struct PersistenceHandle {
    bridge: Arc<PersistenceBridge>,
    watcher: JoinHandle<()>,
    debouncers: Arc<(Debouncer, Debouncer)>,
}

impl PersistenceHandle {
    /// Write any pending changes now.
    pub async fn flush(&self) {
        self.debouncers.0.flush().await;
        self.debouncers.1.flush().await;
    }

    /// Stop watching and write both documents one final time.
    pub async fn shutdown(self) {
        self.watcher.abort();
        let _ = self.watcher.await;
        // Changes published after the watcher's last wakeup never reached a debouncer
        self.bridge.save_user();
        self.bridge.save_balances();
        info!("PersistenceBridge stopped");
    }
}
