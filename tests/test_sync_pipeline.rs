//! Integration tests for block-driven sync and persistence
//!
//! Tests cover:
//! - Tracked accounts and pairs fetched on a new block
//! - Failed fetches keeping previous values
//! - Listened pairs refreshed as whole pairs
//! - Late results from an older block being dropped
//! - Rehydrating a cache from saved documents
//!
//! Note: no RPC node is used; values come from an in-memory fetcher

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use mig_chain_state_cache::{
    chain_state_cache::ChainStateCache,
    fetcher::ValueFetcher,
    persistence::{MemoryStorage, PersistenceConfig},
    resource_id_cache::{Create2PairDeriver, PairFactory},
    staleness::StalenessPolicy,
    types::{Entity, EntityDescriptor},
    user_store::EntityRegistry,
    ResourceId, SlotKey,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, Semaphore};

const ACCOUNT: u64 = 0xaa;
const TOKEN: u64 = 0x10;
const BASE: u64 = 0x20;

fn addr(n: u64) -> Address {
    Address::from_low_u64_be(n)
}

fn deriver() -> Arc<Create2PairDeriver> {
    Arc::new(
        Create2PairDeriver::new()
            .with_factory(1, PairFactory { factory: addr(0xfac), init_code_hash: H256::repeat_byte(3) }),
    )
}

fn registry() -> EntityRegistry {
    let mut registry = EntityRegistry::default();
    registry.defaults.insert(
        1,
        vec![
            Entity { scope: 1, address: addr(TOKEN), decimals: 6, symbol: Some("TKN".into()), name: None },
            Entity { scope: 1, address: addr(BASE), decimals: 18, symbol: Some("BASE".into()), name: None },
        ],
    );
    registry.bases.insert(1, vec![addr(BASE)]);
    registry
}

fn cache() -> ChainStateCache {
    ChainStateCache::new(deriver(), registry(), StalenessPolicy::default())
}

/// Native balances are 1, token balances are the token address' low byte,
/// each answer scaled by the block number.
struct TableFetcher {
    calls: AtomicUsize,
    failing: AtomicBool,
}

impl TableFetcher {
    fn new() -> Self {
        Self { calls: AtomicUsize::new(0), failing: AtomicBool::new(false) }
    }
}

#[async_trait]
impl ValueFetcher for TableFetcher {
    async fn fetch_value(&self, key: SlotKey, block_number: u64) -> Option<U256> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return None;
        }
        let base = match key.resource {
            ResourceId::Native => 1,
            ResourceId::Token(token) => token.to_low_u64_be(),
        };
        Some(U256::from(base * block_number))
    }
}

fn table_value(key: SlotKey, block_number: u64) -> U256 {
    let base = match key.resource {
        ResourceId::Native => 1,
        ResourceId::Token(token) => token.to_low_u64_be(),
    };
    U256::from(base * block_number)
}

/// Same table, but fetches of one resource fail while it is set.
#[derive(Default)]
struct SelectiveFetcher {
    failing: Mutex<Option<ResourceId>>,
}

#[async_trait]
impl ValueFetcher for SelectiveFetcher {
    async fn fetch_value(&self, key: SlotKey, block_number: u64) -> Option<U256> {
        if *self.failing.lock().unwrap() == Some(key.resource) {
            return None;
        }
        Some(table_value(key, block_number))
    }
}

/// Same table, but fetches for `gated_block` wait until the gate opens.
struct GatedFetcher {
    gated_block: u64,
    gate: Semaphore,
    started: Notify,
}

#[async_trait]
impl ValueFetcher for GatedFetcher {
    async fn fetch_value(&self, key: SlotKey, block_number: u64) -> Option<U256> {
        if block_number == self.gated_block {
            self.started.notify_one();
            let _permit = self.gate.acquire().await.ok()?;
        }
        Some(table_value(key, block_number))
    }
}

#[tokio::test]
async fn test_block_syncs_tracked_accounts_and_pairs() {
    let cache = cache();
    cache.track_account(1, addr(ACCOUNT));
    let fetcher = Arc::new(TableFetcher::new());
    let synchronizer = cache.synchronizer(1, fetcher.clone());

    let report = synchronizer.sync_block(50).await.unwrap();
    // Native + two tokens for the account, both sides of the TOKEN/BASE pair
    assert_eq!(report.fetched, 5);
    assert_eq!(report.applied, 5);
    assert_eq!(report.failed, 0);

    let balances = cache.get_all(1, addr(ACCOUNT));
    assert_eq!(balances[&ResourceId::Native], Some(U256::from(50)));
    assert_eq!(balances[&ResourceId::Token(addr(TOKEN))], Some(U256::from(TOKEN * 50)));

    let reserves = cache.reserves(1, addr(TOKEN), addr(BASE)).unwrap().unwrap();
    assert_eq!(reserves.as_of_block, 50);
    assert_eq!(reserves.reserve_a, U256::from(TOKEN * 50));
    assert_eq!(reserves.reserve_b, U256::from(BASE * 50));

    // Nothing is stale one block later
    let calls = fetcher.calls.load(Ordering::SeqCst);
    let report = synchronizer.sync_block(51).await.unwrap();
    assert_eq!(report.fetched, 0);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), calls);
}

#[tokio::test]
async fn test_listened_pair_sides_move_together() {
    // No bases, so the pair is only known through its listener
    let registry = EntityRegistry { defaults: registry().defaults, ..EntityRegistry::default() };
    let cache = ChainStateCache::new(deriver(), registry, StalenessPolicy::default());
    assert!(cache.tracked_pairs(1).is_empty());
    let handle = cache.listen_pair(1, addr(BASE), addr(TOKEN)).unwrap();
    let fetcher = Arc::new(SelectiveFetcher::default());
    let synchronizer = cache.synchronizer(1, fetcher.clone());

    let report = synchronizer.sync_block(100).await.unwrap();
    assert_eq!((report.fetched, report.applied), (2, 2));
    assert_eq!(cache.reserves(1, addr(TOKEN), addr(BASE)).unwrap().unwrap().as_of_block, 100);

    // Balance windows would refresh each side here; the pair window has not passed
    let report = synchronizer.sync_block(108).await.unwrap();
    assert_eq!(report.fetched, 0);

    *fetcher.failing.lock().unwrap() = Some(ResourceId::Token(addr(BASE)));
    let report = synchronizer.sync_block(120).await.unwrap();
    assert_eq!(report.retained_previous, 2);
    assert_eq!(report.applied, 0);
    let reserves = cache.reserves(1, addr(TOKEN), addr(BASE)).unwrap().unwrap();
    assert_eq!(reserves.as_of_block, 100);
    assert_eq!(reserves.reserve_a, U256::from(TOKEN * 100));

    *fetcher.failing.lock().unwrap() = None;
    synchronizer.sync_block(121).await.unwrap();
    let reserves = cache.reserves(1, addr(TOKEN), addr(BASE)).unwrap().unwrap();
    assert_eq!(reserves.as_of_block, 121);
    assert_eq!(reserves.reserve_b, U256::from(BASE * 121));

    drop(handle);
    let report = synchronizer.sync_block(200).await.unwrap();
    assert_eq!(report.candidates, 0);
    assert_eq!(report.fetched, 0);
}

#[tokio::test]
async fn test_late_batch_from_older_block_is_dropped() {
    let cache = cache();
    cache.track_account(1, addr(ACCOUNT));
    let fetcher = Arc::new(GatedFetcher { gated_block: 100, gate: Semaphore::new(0), started: Notify::new() });
    let slow = Arc::new(cache.synchronizer(1, fetcher.clone()));
    let fast = cache.synchronizer(1, fetcher.clone());

    let pending = tokio::spawn({
        let slow = slow.clone();
        async move { slow.sync_block(100).await }
    });
    fetcher.started.notified().await;

    let report = fast.sync_block(101).await.unwrap();
    assert_eq!(report.applied, 5);
    let version = cache.store().version();

    fetcher.gate.add_permits(1);
    let report = pending.await.unwrap().unwrap();
    assert_eq!(report.fetched, 5);
    assert!(report.regressed > 0);
    assert_eq!(report.applied, 0);
    assert_eq!(cache.store().version(), version);

    let native = cache.read(SlotKey::new(1, addr(ACCOUNT), ResourceId::Native));
    assert_eq!((native.value, native.as_of_block), (Some(U256::from(101)), Some(101)));
    let reserves = cache.reserves(1, addr(TOKEN), addr(BASE)).unwrap().unwrap();
    assert_eq!(reserves.as_of_block, 101);
}

#[tokio::test]
async fn test_failed_fetch_keeps_previous_values() {
    let cache = cache();
    let key = SlotKey::new(1, addr(0xbb), ResourceId::Native);
    let _subscription = cache.subscribe(key).unwrap();
    let fetcher = Arc::new(TableFetcher::new());
    let synchronizer = cache.synchronizer(1, fetcher.clone());

    fetcher.failing.store(true, Ordering::SeqCst);
    let report = synchronizer.sync_block(10).await.unwrap();
    assert_eq!(report.unresolved, report.fetched);
    assert_eq!(cache.read(key).value, None);

    fetcher.failing.store(false, Ordering::SeqCst);
    synchronizer.sync_block(11).await.unwrap();
    assert_eq!(cache.read(key).value, Some(U256::from(11)));

    fetcher.failing.store(true, Ordering::SeqCst);
    let report = synchronizer.sync_block(40).await.unwrap();
    assert!(report.retained_previous >= 1);
    let view = cache.read(key);
    assert_eq!((view.value, view.as_of_block), (Some(U256::from(11)), Some(11)));
}

#[tokio::test]
async fn test_rehydrate_restores_balances_and_user_data() {
    let storage = Arc::new(MemoryStorage::new());
    let config = PersistenceConfig::default();
    let key = SlotKey::new(1, addr(0xbb), ResourceId::Native);

    {
        let cache = cache();
        let _subscription = cache.subscribe(key).unwrap();
        let fetcher = Arc::new(TableFetcher::new());
        cache.synchronizer(1, fetcher).sync_block(7).await.unwrap();
        cache
            .import_entity(EntityDescriptor {
                scope: 1,
                address: format!("{:?}", addr(0x30)),
                decimals: 8,
                symbol: Some("NEW".to_string()),
                name: None,
            })
            .unwrap();
        cache.import_pair(1, addr(0x30), addr(BASE)).unwrap();
        cache.user_store().toggle_dark_mode();

        let bridge = cache.persistence_bridge(storage.clone(), config.clone());
        assert!(bridge.save_balances());
        assert!(bridge.save_user());
    }

    let restored = ChainStateCache::rehydrate(
        deriver(),
        registry(),
        StalenessPolicy::default(),
        storage.as_ref(),
        &config,
    );
    let slot = restored.store().get(&key).unwrap();
    assert_eq!((slot.value, slot.as_of_block), (Some(U256::from(7)), Some(7)));
    assert_eq!(slot.listener_count, 0);

    assert_eq!(restored.user_store().user_entities(1).len(), 1);
    assert_eq!(restored.user_store().user_pairs(1).len(), 1);
    assert!(restored.user_store().preferences().dark_mode);
    assert!(restored
        .tracked_pairs(1)
        .contains(&(addr(BASE), addr(0x30))));
}

#[tokio::test]
async fn test_rehydrate_from_empty_storage() {
    let storage = MemoryStorage::new();
    let restored = ChainStateCache::rehydrate(
        deriver(),
        registry(),
        StalenessPolicy::default(),
        &storage,
        &PersistenceConfig::default(),
    );
    assert!(restored.store().snapshot().is_empty());
    assert!(restored.user_store().user_entities(1).is_empty());
}
