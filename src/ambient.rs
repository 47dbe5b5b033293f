//! Ambient universe: slots kept fresh without explicit listeners.
//!
//! For each tracked account, the native balance and the balance of every known token.
//! For every tracked pair, the pair contract's balance of each side (its reserves).
//! Rebuilt only when the user store generation or the tracked account set changes.
//!
//! Pairs listened to outside the universe are counted here too, so the synchronizer
//! refreshes their two sides together like any tracked pair.

use crate::resource_id_cache::ResourceIdCache;
use crate::types::{Owner, ResourceId, Scope, SlotKey};
use crate::user_store::UserStore;
use ethers::types::Address;
use indexmap::IndexMap;
use log::debug;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Both reserve slots of one pair contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PairSlots {
    pub pair: Address,
    pub token0: Address,
    pub token1: Address,
}

impl PairSlots {
    pub fn keys(&self, scope: Scope) -> [SlotKey; 2] {
        [
            SlotKey::new(scope, self.pair, ResourceId::Token(self.token0)),
            SlotKey::new(scope, self.pair, ResourceId::Token(self.token1)),
        ]
    }
}

#[derive(Debug, Clone, Default)]
pub struct AmbientUniverse {
    pub balances: Vec<SlotKey>,
    pub pairs: Vec<PairSlots>,
}

impl AmbientUniverse {
    pub fn len(&self) -> usize {
        self.balances.len() + self.pairs.len() * 2
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

type CacheKey = (u64, u64);

pub struct AmbientTracker {
    user_store: Arc<UserStore>,
    resource_ids: ResourceIdCache,
    accounts: RwLock<BTreeSet<(Scope, Owner)>>,
    accounts_generation: AtomicU64,
    cached: Mutex<HashMap<Scope, (CacheKey, Arc<AmbientUniverse>)>>,
    listened_pairs: Mutex<IndexMap<(Scope, PairSlots), usize>>,
}

impl AmbientTracker {
    pub fn new(user_store: Arc<UserStore>, resource_ids: ResourceIdCache) -> Self {
        Self {
            user_store,
            resource_ids,
            accounts: RwLock::new(BTreeSet::new()),
            accounts_generation: AtomicU64::new(0),
            cached: Mutex::new(HashMap::new()),
            listened_pairs: Mutex::new(IndexMap::new()),
        }
    }

    /// Count one more listener on `pair`.
    pub fn retain_pair(&self, scope: Scope, pair: PairSlots) {
        *self
            .listened_pairs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry((scope, pair))
            .or_insert(0) += 1;
    }

    /// Drop one listener on `pair`; the pair is forgotten at zero.
    pub fn release_pair(&self, scope: Scope, pair: PairSlots) {
        let mut listened = self.listened_pairs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let remaining = match listened.get_mut(&(scope, pair)) {
            Some(count) => {
                *count -= 1;
                *count
            }
            None => {
                debug!("AmbientTracker: release of unlistened pair {:?} on scope {}", pair.pair, scope);
                return;
            }
        };
        if remaining == 0 {
            listened.shift_remove(&(scope, pair));
        }
    }

    /// Pairs with at least one listener on `scope`.
    pub fn listened_pairs(&self, scope: Scope) -> Vec<PairSlots> {
        self.listened_pairs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .filter(|(s, _)| *s == scope)
            .map(|(_, pair)| *pair)
            .collect()
    }

    /// Keep all balances of `account` fresh on `scope`.
    pub fn track_account(&self, scope: Scope, account: Owner) {
        let inserted = self
            .accounts
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert((scope, account));
        if inserted {
            self.accounts_generation.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn untrack_account(&self, scope: Scope, account: Owner) {
        let removed = self
            .accounts
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&(scope, account));
        if removed {
            self.accounts_generation.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn accounts(&self, scope: Scope) -> Vec<Owner> {
        self.accounts
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|(s, _)| *s == scope)
            .map(|(_, account)| *account)
            .collect()
    }

    /// Current universe for `scope`, rebuilt if its inputs changed.
    pub fn universe(&self, scope: Scope) -> Arc<AmbientUniverse> {
        let key = (
            self.user_store.generation(),
            self.accounts_generation.load(Ordering::SeqCst),
        );
        let mut cached = self.cached.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some((cached_key, universe)) = cached.get(&scope) {
            if *cached_key == key {
                return universe.clone();
            }
        }
        let universe = Arc::new(self.build(scope));
        debug!(
            "AmbientTracker: rebuilt scope {} universe ({} balance slot(s), {} pair(s))",
            scope,
            universe.balances.len(),
            universe.pairs.len()
        );
        cached.insert(scope, (key, universe.clone()));
        universe
    }

    fn build(&self, scope: Scope) -> AmbientUniverse {
        let entities = self.user_store.all_entities(scope);
        let mut balances = Vec::new();
        for account in self.accounts(scope) {
            balances.push(SlotKey::new(scope, account, ResourceId::Native));
            balances.extend(
                entities
                    .iter()
                    .map(|entity| SlotKey::new(scope, account, ResourceId::Token(entity.address))),
            );
        }

        let mut pairs = Vec::new();
        for (token0, token1) in self.user_store.tracked_pairs(scope) {
            match self.resource_ids.get_or_derive(scope, token0, token1) {
                Ok(pair) => pairs.push(PairSlots { pair, token0, token1 }),
                Err(e) => debug!(
                    "AmbientTracker: skipping pair ({:?}, {:?}) on scope {}: {}",
                    token0, token1, scope, e
                ),
            }
        }
        AmbientUniverse { balances, pairs }
    }
}
