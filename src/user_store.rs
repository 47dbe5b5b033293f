//! # User Store
//!
//! Known entities per scope (default token list plus user imports), base tokens,
//! pinned and user-added pairs, and user preferences.
//!
//! Every mutation bumps a `generation` counter that is published on a watch channel.
//! The ambient universe is recomputed when the generation moves, and the persistence
//! bridge schedules a debounced write.

use crate::resource_id_cache::canonical_pair;
use crate::types::{Entity, EntityDescriptor, EntityId, InvalidEntityError, Scope};
use ethers::types::Address;
use indexmap::{IndexMap, IndexSet};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::watch;

fn default_deadline_seconds() -> u64 {
    60 * 20
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPreferences {
    /// `None` means automatic slippage.
    #[serde(default)]
    pub slippage_tolerance_bps: Option<u32>,
    #[serde(default = "default_deadline_seconds")]
    pub deadline_seconds: u64,
    #[serde(default)]
    pub expert_mode: bool,
    #[serde(default)]
    pub single_hop_only: bool,
    #[serde(default)]
    pub dark_mode: bool,
    #[serde(default)]
    pub hide_closed_positions: bool,
    /// Favorited pair addresses.
    #[serde(default)]
    pub favorites: Vec<Address>,
}

impl Default for UserPreferences {
    fn default() -> Self {
        Self {
            slippage_tolerance_bps: None,
            deadline_seconds: default_deadline_seconds(),
            expert_mode: false,
            single_hop_only: false,
            dark_mode: false,
            hide_closed_positions: false,
            favorites: Vec::new(),
        }
    }
}

/// A pair the user explicitly imported. Always stored in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserPair {
    pub scope: Scope,
    pub token0: Address,
    pub token1: Address,
}

/// Everything about the user that survives restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserData {
    #[serde(default)]
    pub preferences: UserPreferences,
    #[serde(default)]
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub pairs: Vec<UserPair>,
}

/// Static per-scope token configuration.
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    pub defaults: HashMap<Scope, Vec<Entity>>,
    pub bases: HashMap<Scope, Vec<Address>>,
    pub pinned_pairs: HashMap<Scope, Vec<(Address, Address)>>,
    /// Wrapped native token used to price the native coin.
    pub wrapped_native: HashMap<Scope, Address>,
    /// USD stablecoins paired against the wrapped native token.
    pub stablecoins: HashMap<Scope, Vec<Address>>,
}

#[derive(Debug, Default)]
struct UserState {
    preferences: UserPreferences,
    entities: BTreeMap<Scope, IndexMap<Address, Entity>>,
    pairs: BTreeMap<Scope, IndexSet<(Address, Address)>>,
}

pub struct UserStore {
    registry: EntityRegistry,
    state: RwLock<UserState>,
    generation: AtomicU64,
    changes: watch::Sender<u64>,
}

impl UserStore {
    pub fn new(registry: EntityRegistry) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            registry,
            state: RwLock::new(UserState::default()),
            generation: AtomicU64::new(0),
            changes,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, UserState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, UserState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn bump(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.changes.send_replace(generation);
        generation
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Receives the generation after each change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    pub fn bases(&self, scope: Scope) -> &[Address] {
        self.registry.bases.get(&scope).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn wrapped_native(&self, scope: Scope) -> Option<Address> {
        self.registry.wrapped_native.get(&scope).copied()
    }

    pub fn stablecoins(&self, scope: Scope) -> &[Address] {
        self.registry.stablecoins.get(&scope).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Validate and add a user token. Re-importing the same address replaces the entry.
    pub fn import_entity(&self, descriptor: EntityDescriptor) -> Result<Entity, InvalidEntityError> {
        let entity = Entity::try_from(descriptor)?;
        let replaced = {
            let mut state = self.write();
            let scoped = state.entities.entry(entity.scope).or_default();
            match scoped.insert(entity.address, entity.clone()) {
                Some(previous) if previous == entity => return Ok(entity),
                previous => previous.is_some(),
            }
        };
        let generation = self.bump();
        info!(
            "UserStore: {} token {:?} ({}) on scope {} (generation {})",
            if replaced { "replaced" } else { "imported" },
            entity.address,
            entity.symbol.as_deref().unwrap_or("?"),
            entity.scope,
            generation
        );
        Ok(entity)
    }

    /// Remove a user token and every user pair involving it. Returns whether anything was removed.
    pub fn remove_entity(&self, id: EntityId) -> bool {
        let removed = {
            let mut state = self.write();
            let token_removed = state
                .entities
                .get_mut(&id.scope)
                .map(|scoped| scoped.shift_remove(&id.address).is_some())
                .unwrap_or(false);
            let pairs_removed = state
                .pairs
                .get_mut(&id.scope)
                .map(|pairs| {
                    let before = pairs.len();
                    pairs.retain(|(a, b)| *a != id.address && *b != id.address);
                    before - pairs.len()
                })
                .unwrap_or(0);
            if token_removed || pairs_removed > 0 {
                debug!(
                    "UserStore: removed {:?} on scope {} ({} dependent pair(s))",
                    id.address, id.scope, pairs_removed
                );
                true
            } else {
                false
            }
        };
        if removed {
            self.bump();
        }
        removed
    }

    /// Remember a pair. Stored in canonical order; re-adding is a no-op.
    pub fn import_pair(&self, scope: Scope, a: Address, b: Address) -> Result<UserPair, InvalidEntityError> {
        let (token0, token1) = canonical_pair(a, b)?;
        let inserted = self.write().pairs.entry(scope).or_default().insert((token0, token1));
        if inserted {
            self.bump();
        }
        Ok(UserPair { scope, token0, token1 })
    }

    pub fn remove_pair(&self, scope: Scope, a: Address, b: Address) -> bool {
        let Ok(key) = canonical_pair(a, b) else {
            return false;
        };
        let removed = self
            .write()
            .pairs
            .get_mut(&scope)
            .map(|pairs| pairs.shift_remove(&key))
            .unwrap_or(false);
        if removed {
            self.bump();
        }
        removed
    }

    pub fn user_entities(&self, scope: Scope) -> Vec<Entity> {
        self.read()
            .entities
            .get(&scope)
            .map(|scoped| scoped.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Default list plus user imports; a user import overrides the default with the same address.
    pub fn all_entities(&self, scope: Scope) -> Vec<Entity> {
        let mut merged: IndexMap<Address, Entity> = self
            .registry
            .defaults
            .get(&scope)
            .into_iter()
            .flatten()
            .map(|entity| (entity.address, entity.clone()))
            .collect();
        if let Some(user) = self.read().entities.get(&scope) {
            for (address, entity) in user {
                merged.insert(*address, entity.clone());
            }
        }
        merged.into_values().collect()
    }

    pub fn entity(&self, id: EntityId) -> Option<Entity> {
        if let Some(user) = self.read().entities.get(&id.scope).and_then(|s| s.get(&id.address)) {
            return Some(user.clone());
        }
        self.registry
            .defaults
            .get(&id.scope)?
            .iter()
            .find(|entity| entity.address == id.address)
            .cloned()
    }

    pub fn user_pairs(&self, scope: Scope) -> Vec<(Address, Address)> {
        self.read()
            .pairs
            .get(&scope)
            .map(|pairs| pairs.iter().copied().collect())
            .unwrap_or_default()
    }

    /// User pairs, then every known token against every base, then pinned pairs.
    /// Canonically ordered and de-duplicated.
    pub fn tracked_pairs(&self, scope: Scope) -> Vec<(Address, Address)> {
        let mut tracked: IndexSet<(Address, Address)> = self.user_pairs(scope).into_iter().collect();

        let bases = self.bases(scope);
        for entity in self.all_entities(scope) {
            for base in bases {
                if let Ok(pair) = canonical_pair(*base, entity.address) {
                    tracked.insert(pair);
                }
            }
        }

        for (a, b) in self.registry.pinned_pairs.get(&scope).into_iter().flatten() {
            if let Ok(pair) = canonical_pair(*a, *b) {
                tracked.insert(pair);
            }
        }

        // Pricing pairs
        if let Some(wrapped) = self.wrapped_native(scope) {
            for stablecoin in self.stablecoins(scope) {
                if let Ok(pair) = canonical_pair(wrapped, *stablecoin) {
                    tracked.insert(pair);
                }
            }
        }
        tracked.into_iter().collect()
    }

    pub fn preferences(&self) -> UserPreferences {
        self.read().preferences.clone()
    }

    /// Apply a change to the preferences. No generation bump if nothing changed.
    pub fn update_preferences<F>(&self, update: F) -> UserPreferences
    where
        F: FnOnce(&mut UserPreferences),
    {
        let (changed, current) = {
            let mut state = self.write();
            let before = state.preferences.clone();
            update(&mut state.preferences);
            (before != state.preferences, state.preferences.clone())
        };
        if changed {
            self.bump();
        }
        current
    }

    pub fn set_slippage_tolerance(&self, bps: Option<u32>) -> UserPreferences {
        self.update_preferences(|p| p.slippage_tolerance_bps = bps)
    }

    pub fn set_deadline(&self, seconds: u64) -> UserPreferences {
        self.update_preferences(|p| p.deadline_seconds = seconds)
    }

    pub fn toggle_expert_mode(&self) -> UserPreferences {
        self.update_preferences(|p| p.expert_mode = !p.expert_mode)
    }

    pub fn toggle_dark_mode(&self) -> UserPreferences {
        self.update_preferences(|p| p.dark_mode = !p.dark_mode)
    }

    pub fn set_single_hop_only(&self, enabled: bool) -> UserPreferences {
        self.update_preferences(|p| p.single_hop_only = enabled)
    }

    pub fn set_hide_closed_positions(&self, hide: bool) -> UserPreferences {
        self.update_preferences(|p| p.hide_closed_positions = hide)
    }

    /// Add or remove a favorite pair. Returns whether it is now a favorite.
    pub fn toggle_favorite(&self, pair: Address) -> bool {
        let prefs = self.update_preferences(|p| {
            if let Some(index) = p.favorites.iter().position(|f| *f == pair) {
                p.favorites.remove(index);
            } else {
                p.favorites.push(pair);
            }
        });
        prefs.favorites.contains(&pair)
    }

    pub fn is_favorite(&self, pair: Address) -> bool {
        self.read().preferences.favorites.contains(&pair)
    }

    pub fn export(&self) -> UserData {
        let state = self.read();
        UserData {
            preferences: state.preferences.clone(),
            entities: state.entities.values().flat_map(|s| s.values().cloned()).collect(),
            pairs: state
                .pairs
                .iter()
                .flat_map(|(scope, pairs)| {
                    pairs.iter().map(move |(token0, token1)| UserPair {
                        scope: *scope,
                        token0: *token0,
                        token1: *token1,
                    })
                })
                .collect(),
        }
    }

    /// Replace the user state with persisted data. Malformed entries are skipped.
    pub fn restore(&self, data: UserData) {
        let mut state = UserState {
            preferences: data.preferences,
            ..UserState::default()
        };
        let mut skipped = 0usize;
        for entity in data.entities {
            if entity.address.is_zero() || entity.decimals > crate::types::entity::MAX_DECIMALS {
                skipped += 1;
                continue;
            }
            state.entities.entry(entity.scope).or_default().insert(entity.address, entity);
        }
        for pair in data.pairs {
            match canonical_pair(pair.token0, pair.token1) {
                Ok(key) => {
                    state.pairs.entry(pair.scope).or_default().insert(key);
                }
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            log::warn!("UserStore: skipped {} malformed persisted entr(ies)", skipped);
        }
        *self.write() = state;
        self.bump();
    }
}
