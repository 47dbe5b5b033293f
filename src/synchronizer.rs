//! # Batch Synchronizer
//!
//! Per-scope refresh loop driven by new blocks:
//!
//! ```text
//! Idle -> Scanning -> Fetching -> Merging -> Idle
//! ```
//!
//! - **Scanning**: listened slots plus the ambient universe, filtered by the staleness policy.
//!   Slots already being fetched by an earlier block's batch are skipped and claimed
//!   before any request goes out.
//! - **Fetching**: balance slots and pair reserves are fetched concurrently. Failures are `None`.
//! - **Merging**: one `BatchUpdateOwner` per owner and one `BatchUpdatePairs` for all pairs.
//!
//! Batches for consecutive blocks may overlap. The store drops merges tagged with a
//! block older than what a slot already holds, so the slower batch can never roll a
//! slot back.

use crate::ambient::{AmbientTracker, PairSlots};
use crate::fetcher::ValueFetcher;
use crate::metrics;
use crate::staleness::StalenessPolicy;
use crate::state_store::{StateError, StateSnapshot, StateStore, Transition, TransitionReport};
use crate::types::{Owner, ResourceId, Scope, SlotKey, TrackedValue};
use crate::block_stream::NewBlock;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ethers::types::U256;
use indexmap::{IndexMap, IndexSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Scanning,
    Fetching,
    Merging,
}

/// Outcome of one block's batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub block_number: u64,
    pub candidates: usize,
    pub stale: usize,
    pub deduplicated: usize,
    pub fetched: usize,
    pub failed: usize,
    pub applied: usize,
    pub regressed: usize,
    pub retained_previous: usize,
    pub unresolved: usize,
}

impl SyncReport {
    fn absorb(&mut self, transition: &TransitionReport) {
        self.applied += transition.applied;
        self.regressed += transition.regressed;
        self.retained_previous += transition.retained_previous;
        self.unresolved += transition.unresolved;
    }
}

/// Slots claimed by one batch. Released on drop, whatever happens to the batch.
struct InFlightClaim {
    in_flight: Arc<DashMap<SlotKey, u64>>,
    keys: Vec<SlotKey>,
}

impl Drop for InFlightClaim {
    fn drop(&mut self) {
        for key in &self.keys {
            self.in_flight.remove(key);
        }
    }
}

pub struct BatchSynchronizer {
    scope: Scope,
    store: Arc<StateStore>,
    fetcher: Arc<dyn ValueFetcher>,
    ambient: Arc<AmbientTracker>,
    policy: StalenessPolicy,
    in_flight: Arc<DashMap<SlotKey, u64>>,
    phase: Mutex<SyncPhase>,
}

impl BatchSynchronizer {
    pub fn new(
        scope: Scope,
        store: Arc<StateStore>,
        fetcher: Arc<dyn ValueFetcher>,
        ambient: Arc<AmbientTracker>,
        policy: StalenessPolicy,
    ) -> Self {
        Self {
            scope,
            store,
            fetcher,
            ambient,
            policy,
            in_flight: Arc::new(DashMap::new()),
            phase: Mutex::new(SyncPhase::Idle),
        }
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// Phase of the most recently advanced batch.
    pub fn phase(&self) -> SyncPhase {
        *self.phase.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_phase(&self, phase: SyncPhase) {
        *self.phase.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = phase;
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Claim every key or none of them. Returns `false` if any key is already in flight.
    fn try_claim(&self, keys: &[SlotKey], block_number: u64, claimed: &mut Vec<SlotKey>) -> bool {
        let mut taken = Vec::with_capacity(keys.len());
        for key in keys {
            let claimed_now = match self.in_flight.entry(*key) {
                Entry::Occupied(_) => false,
                Entry::Vacant(entry) => {
                    entry.insert(block_number);
                    true
                }
            };
            // Entry dropped above; remove() would deadlock on its shard otherwise
            if !claimed_now {
                for key in taken {
                    self.in_flight.remove(&key);
                }
                return false;
            }
            taken.push(*key);
        }
        claimed.extend(taken);
        true
    }

    /// Stale balance slots and stale pairs as of `block_number`.
    fn scan(&self, snapshot: &StateSnapshot, block_number: u64, report: &mut SyncReport) -> (Vec<SlotKey>, Vec<PairSlots>) {
        let universe = self.ambient.universe(self.scope);
        let active = snapshot.active_slots(self.scope);
        metrics::set_listener_active_slots(active.len());

        // Listened pairs take the pair path too, so both sides always move together
        let pairs: IndexSet<PairSlots> = universe
            .pairs
            .iter()
            .copied()
            .chain(self.ambient.listened_pairs(self.scope))
            .collect();
        let pair_keys: IndexSet<SlotKey> = pairs.iter().flat_map(|pair| pair.keys(self.scope)).collect();
        let balance_candidates: IndexSet<SlotKey> = active
            .into_iter()
            .chain(universe.balances.iter().copied())
            .filter(|key| !pair_keys.contains(key))
            .collect();
        report.candidates = balance_candidates.len() + pair_keys.len();

        let empty = TrackedValue::default();
        let slot = |key: &SlotKey| snapshot.get_slot(key).unwrap_or(&empty);

        let stale_balances = balance_candidates
            .into_iter()
            .filter(|key| self.policy.is_stale(slot(key), block_number))
            .collect::<Vec<_>>();
        let stale_pairs = pairs
            .into_iter()
            .filter(|pair| {
                let [side0, side1] = pair.keys(self.scope);
                self.policy.is_pair_stale(slot(&side0), slot(&side1), block_number)
            })
            .collect::<Vec<_>>();
        report.stale = stale_balances.len() + stale_pairs.len() * 2;
        (stale_balances, stale_pairs)
    }

    /// Run one Scanning/Fetching/Merging cycle for `block_number`.
    pub async fn sync_block(&self, block_number: u64) -> Result<SyncReport, StateError> {
        let started = Instant::now();
        let mut report = SyncReport { block_number, ..SyncReport::default() };

        self.set_phase(SyncPhase::Scanning);
        let snapshot = self.store.snapshot();
        let (stale_balances, stale_pairs) = self.scan(&snapshot, block_number, &mut report);

        let mut claim = InFlightClaim { in_flight: self.in_flight.clone(), keys: Vec::new() };
        let balances: Vec<SlotKey> = stale_balances
            .into_iter()
            .filter(|key| self.try_claim(std::slice::from_ref(key), block_number, &mut claim.keys))
            .collect();
        let pairs: Vec<PairSlots> = stale_pairs
            .into_iter()
            .filter(|pair| self.try_claim(&pair.keys(self.scope), block_number, &mut claim.keys))
            .collect();
        report.deduplicated = report.stale - balances.len() - pairs.len() * 2;
        if report.deduplicated > 0 {
            metrics::increment_sync_deduplicated(report.deduplicated as u64);
        }

        if balances.is_empty() && pairs.is_empty() {
            self.set_phase(SyncPhase::Idle);
            debug!(scope = self.scope, block = block_number, candidates = report.candidates, "nothing stale");
            return Ok(report);
        }

        self.set_phase(SyncPhase::Fetching);
        let pair_keys: Vec<SlotKey> = pairs.iter().flat_map(|pair| pair.keys(self.scope)).collect();
        let (balance_values, pair_values) = tokio::join!(
            self.fetch(&balances, block_number),
            self.fetch(&pair_keys, block_number)
        );
        report.fetched = balances.len() + pair_keys.len();
        report.failed = balance_values
            .iter()
            .chain(pair_values.iter())
            .filter(|v| v.is_none())
            .count();
        metrics::increment_sync_fetches("ok", (report.fetched - report.failed) as u64);
        metrics::increment_sync_fetches("failed", report.failed as u64);

        self.set_phase(SyncPhase::Merging);
        let result = self.merge(&balances, balance_values, &pair_keys, pair_values, block_number, &mut report);
        drop(claim);
        self.set_phase(SyncPhase::Idle);
        result?;

        metrics::record_sync_batch(report.fetched, started.elapsed());
        metrics::increment_merge_outcome("applied", report.applied as u64);
        metrics::increment_merge_outcome("regressed", report.regressed as u64);
        metrics::increment_merge_outcome("retained_previous", report.retained_previous as u64);
        metrics::increment_merge_outcome("unresolved", report.unresolved as u64);
        metrics::set_sync_last_block(self.scope, block_number);

        if report.regressed > 0 {
            debug!(
                scope = self.scope,
                block = block_number,
                regressed = report.regressed,
                "dropped merges older than cached values"
            );
        }
        info!(
            scope = self.scope,
            block = block_number,
            fetched = report.fetched,
            failed = report.failed,
            applied = report.applied,
            deduplicated = report.deduplicated,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "block synced"
        );
        Ok(report)
    }

    async fn fetch(&self, keys: &[SlotKey], block_number: u64) -> Vec<Option<U256>> {
        if keys.is_empty() {
            return Vec::new();
        }
        let values = self.fetcher.fetch_values(keys, block_number).await;
        if values.len() != keys.len() {
            // A fetcher returning the wrong shape is treated as a failed batch
            warn!(
                scope = self.scope,
                expected = keys.len(),
                got = values.len(),
                "fetcher returned mismatched result count"
            );
            return vec![None; keys.len()];
        }
        values
    }

    fn merge(
        &self,
        balances: &[SlotKey],
        balance_values: Vec<Option<U256>>,
        pair_keys: &[SlotKey],
        pair_values: Vec<Option<U256>>,
        block_number: u64,
        report: &mut SyncReport,
    ) -> Result<(), StateError> {
        let mut by_owner: IndexMap<Owner, (Vec<ResourceId>, Vec<Option<U256>>)> = IndexMap::new();
        for (key, value) in balances.iter().zip(balance_values) {
            let (resources, values) = by_owner.entry(key.owner).or_default();
            resources.push(key.resource);
            values.push(value);
        }
        for (owner, (resources, values)) in by_owner {
            let transition = Transition::BatchUpdateOwner {
                scope: self.scope,
                owner,
                resources,
                values,
                block_number,
            };
            report.absorb(&self.store.apply(transition)?);
        }

        if !pair_keys.is_empty() {
            let transition = Transition::BatchUpdatePairs {
                scope: self.scope,
                owners: pair_keys.iter().map(|key| key.owner).collect(),
                resources: pair_keys.iter().map(|key| key.resource).collect(),
                values: pair_values,
                block_number,
            };
            report.absorb(&self.store.apply(transition)?);
        }
        Ok(())
    }

    /// Sync every block of this scope received on `blocks`. Batches may overlap.
    pub fn spawn(self: Arc<Self>, mut blocks: broadcast::Receiver<NewBlock>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(scope = self.scope, "batch synchronizer started");
            loop {
                match blocks.recv().await {
                    Ok(block) if block.scope == self.scope => {
                        let synchronizer = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = synchronizer.sync_block(block.block_number).await {
                                error!(
                                    scope = synchronizer.scope,
                                    block = block.block_number,
                                    error = %e,
                                    "block sync failed"
                                );
                            }
                        });
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(scope = self.scope, skipped, "block receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!(scope = self.scope, "block stream closed, synchronizer stopping");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener_registry::ListenerRegistry;
    use crate::resource_id_cache::{Create2PairDeriver, ResourceIdCache};
    use crate::user_store::{EntityRegistry, UserStore};
    use async_trait::async_trait;
    use ethers::types::Address;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves values from a table; counts requests.
    #[derive(Default)]
    struct TableFetcher {
        values: Mutex<HashMap<SlotKey, Option<U256>>>,
        requests: AtomicUsize,
    }

    impl TableFetcher {
        fn set(&self, key: SlotKey, value: Option<U256>) {
            self.values.lock().unwrap().insert(key, value);
        }
    }

    #[async_trait]
    impl ValueFetcher for TableFetcher {
        async fn fetch_value(&self, key: SlotKey, _block_number: u64) -> Option<U256> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            self.values.lock().unwrap().get(&key).copied().flatten()
        }
    }

    fn setup() -> (Arc<StateStore>, Arc<TableFetcher>, BatchSynchronizer) {
        let store = Arc::new(StateStore::new());
        let fetcher = Arc::new(TableFetcher::default());
        let user_store = Arc::new(UserStore::new(EntityRegistry::default()));
        let ambient = Arc::new(AmbientTracker::new(
            user_store,
            ResourceIdCache::new(Arc::new(Create2PairDeriver::new())),
        ));
        let synchronizer = BatchSynchronizer::new(
            1,
            store.clone(),
            fetcher.clone(),
            ambient,
            StalenessPolicy::default(),
        );
        (store, fetcher, synchronizer)
    }

    fn key() -> SlotKey {
        SlotKey::new(1, Address::from_low_u64_be(0xaa), ResourceId::Native)
    }

    #[tokio::test]
    async fn test_only_listened_slots_are_fetched() {
        let (store, fetcher, synchronizer) = setup();
        fetcher.set(key(), Some(U256::from(5)));

        let report = synchronizer.sync_block(100).await.unwrap();
        assert_eq!(report.fetched, 0);
        assert_eq!(fetcher.requests.load(Ordering::SeqCst), 0);

        let registry = ListenerRegistry::new(store.clone());
        let _handle = registry.listen(vec![key()]).unwrap();
        let report = synchronizer.sync_block(101).await.unwrap();
        assert_eq!(report.applied, 1);
        let slot = store.get(&key()).unwrap();
        assert_eq!(slot.value, Some(U256::from(5)));
        assert_eq!(slot.as_of_block, Some(101));
        assert_eq!(synchronizer.phase(), SyncPhase::Idle);
        assert_eq!(synchronizer.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_fresh_slots_are_not_refetched() {
        let (store, fetcher, synchronizer) = setup();
        fetcher.set(key(), Some(U256::from(5)));
        let registry = ListenerRegistry::new(store.clone());
        let _handle = registry.listen(vec![key()]).unwrap();

        synchronizer.sync_block(100).await.unwrap();
        synchronizer.sync_block(107).await.unwrap();
        assert_eq!(fetcher.requests.load(Ordering::SeqCst), 1);
        synchronizer.sync_block(108).await.unwrap();
        assert_eq!(fetcher.requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_in_flight_slots_are_skipped() {
        let (_, _, synchronizer) = setup();
        let mut claimed = Vec::new();
        assert!(synchronizer.try_claim(&[key()], 100, &mut claimed));
        assert!(!synchronizer.try_claim(&[key()], 101, &mut claimed));

        let other = SlotKey::new(1, Address::from_low_u64_be(0xbb), ResourceId::Native);
        // All-or-nothing: `other` must not stay claimed when `key` is taken
        assert!(!synchronizer.try_claim(&[other, key()], 101, &mut claimed));
        assert_eq!(claimed, vec![key()]);
        assert_eq!(synchronizer.in_flight_count(), 1);
    }
}
