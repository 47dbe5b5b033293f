//! # Chain State Cache
//!
//! Entry point for UI consumers. Owns the state store, listener registry, pair id
//! cache, user store and ambient tracker, and wires synchronizers and persistence to
//! them. Constructed explicitly and shared by `Arc`; there is no global instance.
//!
//! ```rust,ignore
//! let cache = Arc::new(ChainStateCache::new(deriver, registry, policy));
//! let sub = cache.subscribe(SlotKey::new(1, account, ResourceId::Native))?;
//! let view = sub.changed().await?;
//! ```

use crate::ambient::{AmbientTracker, PairSlots};
use crate::fetcher::ValueFetcher;
use crate::listener_registry::{ListenerRegistry, ListeningHandle};
use crate::persistence::{self, PersistenceBridge, PersistenceConfig, Storage};
use crate::resource_id_cache::{canonical_pair, PairDeriver, ResourceIdCache};
use crate::staleness::StalenessPolicy;
use crate::state_store::{StateError, StateSnapshot, StateStore};
use crate::synchronizer::BatchSynchronizer;
use crate::types::conversions::{u256_to_decimal, ConversionError};
use crate::types::{
    Entity, EntityDescriptor, EntityId, InvalidEntityError, Owner, ResourceId, Scope, SlotKey,
};
use crate::user_store::{EntityRegistry, UserPair, UserStore};
use ethers::types::{Address, U256};
use log::info;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Decimals of every supported chain's native coin.
pub const NATIVE_DECIMALS: u8 = 18;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error(transparent)]
    InvalidEntity(#[from] InvalidEntityError),
    #[error(transparent)]
    State(#[from] StateError),
}

/// What the UI renders for one slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotView {
    pub value: Option<U256>,
    pub as_of_block: Option<u64>,
}

/// Reserves of a pair, in the order the tokens were asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairReserves {
    pub pair: Address,
    pub reserve_a: U256,
    pub reserve_b: U256,
    pub as_of_block: u64,
}

/// Listener on both sides of a pair. The sides are refreshed together until dropped.
#[must_use = "dropping the handle stops listening immediately"]
pub struct PairListeningHandle {
    scope: Scope,
    pair: PairSlots,
    ambient: Arc<AmbientTracker>,
    _sides: ListeningHandle,
}

impl PairListeningHandle {
    pub fn pair(&self) -> PairSlots {
        self.pair
    }
}

impl Drop for PairListeningHandle {
    fn drop(&mut self) {
        self.ambient.release_pair(self.scope, self.pair);
    }
}

/// Live view of one slot. Listening stops when dropped.
pub struct SlotSubscription {
    key: SlotKey,
    store: Arc<StateStore>,
    versions: watch::Receiver<u64>,
    last: SlotView,
    _handle: ListeningHandle,
}

impl SlotSubscription {
    pub fn key(&self) -> SlotKey {
        self.key
    }

    pub fn current(&self) -> SlotView {
        view(&self.store, &self.key)
    }

    /// Wait until the slot's value or block differs from what was last returned.
    pub async fn changed(&mut self) -> Result<SlotView, watch::error::RecvError> {
        loop {
            let current = self.current();
            if current != self.last {
                self.last = current;
                return Ok(current);
            }
            self.versions.changed().await?;
        }
    }
}

fn view(store: &StateStore, key: &SlotKey) -> SlotView {
    store
        .get(key)
        .map(|tracked| SlotView { value: tracked.value, as_of_block: tracked.as_of_block })
        .unwrap_or_default()
}

/// Raw units to a display amount.
pub fn format_units(value: U256, decimals: u8) -> Result<Decimal, ConversionError> {
    u256_to_decimal(value, decimals)
}

pub struct ChainStateCache {
    store: Arc<StateStore>,
    listeners: ListenerRegistry,
    resource_ids: ResourceIdCache,
    user_store: Arc<UserStore>,
    ambient: Arc<AmbientTracker>,
    policy: StalenessPolicy,
}

impl ChainStateCache {
    pub fn new(deriver: Arc<dyn PairDeriver>, registry: EntityRegistry, policy: StalenessPolicy) -> Self {
        Self::with_snapshot(deriver, registry, policy, StateSnapshot::default())
    }

    pub fn with_snapshot(
        deriver: Arc<dyn PairDeriver>,
        registry: EntityRegistry,
        policy: StalenessPolicy,
        snapshot: StateSnapshot,
    ) -> Self {
        let store = Arc::new(StateStore::with_snapshot(snapshot));
        let resource_ids = ResourceIdCache::new(deriver);
        let user_store = Arc::new(UserStore::new(registry));
        let ambient = Arc::new(AmbientTracker::new(user_store.clone(), resource_ids.clone()));
        Self {
            listeners: ListenerRegistry::new(store.clone()),
            store,
            resource_ids,
            user_store,
            ambient,
            policy,
        }
    }

    /// Build from persisted documents. Missing or outdated documents start empty.
    pub fn rehydrate(
        deriver: Arc<dyn PairDeriver>,
        registry: EntityRegistry,
        policy: StalenessPolicy,
        storage: &dyn Storage,
        config: &PersistenceConfig,
    ) -> Self {
        let snapshot = persistence::load_balances(storage, &config.balances_key).unwrap_or_default();
        let restored_slots = snapshot.len();
        let cache = Self::with_snapshot(deriver, registry, policy, snapshot);
        let user_data = persistence::load_user_data(storage, &config.user_key);
        let restored_user = user_data.is_some();
        if let Some(data) = user_data {
            cache.user_store.restore(data);
        }
        info!(
            "ChainStateCache rehydrated: {} slot(s), user document {}",
            restored_slots,
            if restored_user { "restored" } else { "absent" }
        );
        cache
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn user_store(&self) -> &Arc<UserStore> {
        &self.user_store
    }

    pub fn policy(&self) -> StalenessPolicy {
        self.policy
    }

    pub fn read(&self, key: SlotKey) -> SlotView {
        view(&self.store, &key)
    }

    /// Start listening on `key` and get a live view of it.
    pub fn subscribe(&self, key: SlotKey) -> Result<SlotSubscription, StateError> {
        let handle = self.listeners.listen(vec![key])?;
        Ok(SlotSubscription {
            key,
            store: self.store.clone(),
            versions: self.store.subscribe(),
            last: SlotView::default(),
            _handle: handle,
        })
    }

    pub fn start_listening(&self, key: SlotKey) -> Result<(), StateError> {
        self.listeners.start_listening(key)
    }

    pub fn stop_listening(&self, key: SlotKey) -> Result<(), StateError> {
        self.listeners.stop_listening(key)
    }

    pub fn listen(&self, keys: Vec<SlotKey>) -> Result<ListeningHandle, StateError> {
        self.listeners.listen(keys)
    }

    /// Every known value held by `owner`.
    pub fn get_all(&self, scope: Scope, owner: Owner) -> HashMap<ResourceId, Option<U256>> {
        self.store
            .snapshot()
            .owner(scope, owner)
            .map(|slots| slots.iter().map(|(resource, tracked)| (*resource, tracked.value)).collect())
            .unwrap_or_default()
    }

    pub fn import_entity(&self, descriptor: EntityDescriptor) -> Result<Entity, InvalidEntityError> {
        self.user_store.import_entity(descriptor)
    }

    pub fn remove_entity(&self, id: EntityId) -> bool {
        self.user_store.remove_entity(id)
    }

    pub fn pair_address(&self, scope: Scope, a: Address, b: Address) -> Result<Address, InvalidEntityError> {
        self.resource_ids.get_or_derive(scope, a, b)
    }

    /// Remember a pair. The pair address must be derivable on `scope`.
    pub fn import_pair(&self, scope: Scope, a: Address, b: Address) -> Result<(UserPair, Address), InvalidEntityError> {
        let pair = self.resource_ids.get_or_derive(scope, a, b)?;
        Ok((self.user_store.import_pair(scope, a, b)?, pair))
    }

    pub fn remove_pair(&self, scope: Scope, a: Address, b: Address) -> bool {
        self.user_store.remove_pair(scope, a, b)
    }

    pub fn tracked_pairs(&self, scope: Scope) -> Vec<(Address, Address)> {
        self.user_store.tracked_pairs(scope)
    }

    /// Keep every balance of `account` fresh without explicit listeners.
    pub fn track_account(&self, scope: Scope, account: Owner) {
        self.ambient.track_account(scope, account);
    }

    pub fn untrack_account(&self, scope: Scope, account: Owner) {
        self.ambient.untrack_account(scope, account);
    }

    fn pair_keys(&self, scope: Scope, a: Address, b: Address) -> Result<(Address, [SlotKey; 2]), InvalidEntityError> {
        let pair = self.resource_ids.get_or_derive(scope, a, b)?;
        Ok((
            pair,
            [
                SlotKey::new(scope, pair, ResourceId::Token(a)),
                SlotKey::new(scope, pair, ResourceId::Token(b)),
            ],
        ))
    }

    /// Listen on both sides of a pair with one handle.
    pub fn listen_pair(&self, scope: Scope, a: Address, b: Address) -> Result<PairListeningHandle, CacheError> {
        let (token0, token1) = canonical_pair(a, b)?;
        let (pair, keys) = self.pair_keys(scope, token0, token1)?;
        let sides = self.listeners.listen(keys.to_vec())?;
        let pair = PairSlots { pair, token0, token1 };
        self.ambient.retain_pair(scope, pair);
        Ok(PairListeningHandle { scope, pair, ambient: self.ambient.clone(), _sides: sides })
    }

    /// Reserves of the `(a, b)` pair, only when both sides were merged at the same block.
    pub fn reserves(&self, scope: Scope, a: Address, b: Address) -> Result<Option<PairReserves>, InvalidEntityError> {
        let (pair, [key_a, key_b]) = self.pair_keys(scope, a, b)?;
        let snapshot = self.store.snapshot();
        let (Some(side_a), Some(side_b)) = (snapshot.get_slot(&key_a), snapshot.get_slot(&key_b)) else {
            return Ok(None);
        };
        Ok(match (side_a.value, side_b.value, side_a.as_of_block, side_b.as_of_block) {
            (Some(reserve_a), Some(reserve_b), Some(block_a), Some(block_b)) if block_a == block_b => {
                Some(PairReserves { pair, reserve_a, reserve_b, as_of_block: block_a })
            }
            _ => None,
        })
    }

    /// Native coin price in USD from the wrapped-native/stablecoin pairs, weighted by
    /// each pair's native liquidity. `None` unless every pair has consistent reserves.
    pub fn native_price_usd(&self, scope: Scope) -> Option<Decimal> {
        let wrapped = self.user_store.wrapped_native(scope)?;
        let stablecoins = self.user_store.stablecoins(scope);
        if stablecoins.is_empty() {
            return None;
        }
        let native_decimals = self
            .user_store
            .entity(EntityId::new(scope, wrapped))
            .map(|entity| entity.decimals)
            .unwrap_or(NATIVE_DECIMALS);

        let mut native_total = Decimal::ZERO;
        let mut stable_total = Decimal::ZERO;
        for stablecoin in stablecoins {
            let reserves = self.reserves(scope, wrapped, *stablecoin).ok()??;
            let stable_decimals = self.user_store.entity(EntityId::new(scope, *stablecoin))?.decimals;
            native_total = native_total.checked_add(format_units(reserves.reserve_a, native_decimals).ok()?)?;
            stable_total = stable_total.checked_add(format_units(reserves.reserve_b, stable_decimals).ok()?)?;
        }
        if native_total.is_zero() {
            return None;
        }
        stable_total.checked_div(native_total).map(|price| price.normalize())
    }

    /// Cached balance as a display amount, using the token's decimals.
    pub fn formatted_balance(&self, key: SlotKey) -> Option<Decimal> {
        let value = self.read(key).value?;
        let decimals = match key.resource {
            ResourceId::Native => NATIVE_DECIMALS,
            ResourceId::Token(token) => self.user_store.entity(EntityId::new(key.scope, token))?.decimals,
        };
        format_units(value, decimals).ok()
    }

    pub fn synchronizer(&self, scope: Scope, fetcher: Arc<dyn ValueFetcher>) -> BatchSynchronizer {
        BatchSynchronizer::new(scope, self.store.clone(), fetcher, self.ambient.clone(), self.policy)
    }

    pub fn persistence_bridge(&self, storage: Arc<dyn Storage>, config: PersistenceConfig) -> PersistenceBridge {
        PersistenceBridge::new(storage, self.store.clone(), self.user_store.clone(), config)
    }
}
