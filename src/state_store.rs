//! # State Store
//!
//! Immutable, versioned tree `scope -> owner -> resource -> TrackedValue`, the single
//! source of truth read by the UI. The tree is only changed by applying one of the
//! [`Transition`] variants; each application produces a new snapshot that is swapped
//! in by reference, so readers always see a fully applied transition and never block
//! on writers.
//!
//! Branches are shared between snapshots (`Arc` per scope and per owner) and cloned
//! on write, so a transition only copies the owners it touches.

use crate::metrics;
use crate::types::{MergeOutcome, Owner, ResourceId, Scope, SlotKey, TrackedValue};
use arc_swap::ArcSwap;
use ethers::types::U256;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

pub type OwnerSlots = HashMap<ResourceId, TrackedValue>;
pub type ScopeSlots = HashMap<Owner, Arc<OwnerSlots>>;

/// Wire names of every transition, used to reject unknown ones at decode time.
const TRANSITION_TYPES: [&str; 5] = [
    "update",
    "batch_update_owner",
    "batch_update_pairs",
    "increment_listener",
    "decrement_listener",
];

/// The closed set of state changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transition {
    Update {
        scope: Scope,
        owner: Owner,
        resource: ResourceId,
        value: Option<U256>,
        block_number: u64,
    },
    BatchUpdateOwner {
        scope: Scope,
        owner: Owner,
        resources: Vec<ResourceId>,
        values: Vec<Option<U256>>,
        block_number: u64,
    },
    /// Reserves for many pairs at once. Slots of the same owner are merged all-or-nothing.
    BatchUpdatePairs {
        scope: Scope,
        owners: Vec<Owner>,
        resources: Vec<ResourceId>,
        values: Vec<Option<U256>>,
        block_number: u64,
    },
    IncrementListener {
        scope: Scope,
        owner: Owner,
        resource: ResourceId,
    },
    DecrementListener {
        scope: Scope,
        owner: Owner,
        resource: ResourceId,
    },
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::Update { .. } => "update",
            Transition::BatchUpdateOwner { .. } => "batch_update_owner",
            Transition::BatchUpdatePairs { .. } => "batch_update_pairs",
            Transition::IncrementListener { .. } => "increment_listener",
            Transition::DecrementListener { .. } => "decrement_listener",
        }
    }

    /// Decode an untyped transition, e.g. one replayed from a log or sent over IPC.
    pub fn decode(raw: serde_json::Value) -> Result<Self, StateError> {
        let kind = raw
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| StateError::InvalidTransition("missing `type` field".to_string()))?;
        if !TRANSITION_TYPES.contains(&kind) {
            return Err(StateError::UnknownTransition(kind.to_string()));
        }
        serde_json::from_value(raw).map_err(|e| StateError::InvalidTransition(e.to_string()))
    }

    fn validate(&self) -> Result<(), StateError> {
        match self {
            Transition::BatchUpdateOwner { resources, values, .. } => {
                if resources.len() != values.len() {
                    return Err(StateError::MalformedBatch {
                        transition: self.name(),
                        lengths: vec![resources.len(), values.len()],
                    });
                }
            }
            Transition::BatchUpdatePairs { owners, resources, values, .. } => {
                if owners.len() != resources.len() || resources.len() != values.len() {
                    return Err(StateError::MalformedBatch {
                        transition: self.name(),
                        lengths: vec![owners.len(), resources.len(), values.len()],
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Contract violations. These are programming errors and are never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("Malformed {transition}: array lengths {lengths:?} differ")]
    MalformedBatch { transition: &'static str, lengths: Vec<usize> },
    #[error("Unknown transition type `{0}`")]
    UnknownTransition(String),
    #[error("Invalid transition payload: {0}")]
    InvalidTransition(String),
}

/// What a single transition did, slot by slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionReport {
    pub applied: usize,
    pub regressed: usize,
    pub retained_previous: usize,
    pub unresolved: usize,
    /// Listener decrement on a slot that had none.
    pub underflow: bool,
    /// Whether a new snapshot was published.
    pub changed: bool,
}

impl TransitionReport {
    fn record(&mut self, outcome: MergeOutcome) {
        match outcome {
            MergeOutcome::Applied => self.applied += 1,
            MergeOutcome::Regressed => self.regressed += 1,
            MergeOutcome::RetainedPrevious => self.retained_previous += 1,
            MergeOutcome::Unresolved => self.unresolved += 1,
        }
    }
}

/// One immutable version of the cache.
#[derive(Debug, Clone, Default)]
pub struct StateSnapshot {
    version: u64,
    scopes: HashMap<Scope, Arc<ScopeSlots>>,
}

impl StateSnapshot {
    /// Build a snapshot from raw slots (rehydration).
    pub fn from_slots<I>(slots: I) -> Self
    where
        I: IntoIterator<Item = (SlotKey, TrackedValue)>,
    {
        let mut snapshot = StateSnapshot::default();
        for (key, tracked) in slots {
            *snapshot.slot_mut(&key) = tracked;
        }
        snapshot
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, scope: Scope, owner: Owner, resource: ResourceId) -> Option<&TrackedValue> {
        self.scopes.get(&scope)?.get(&owner)?.get(&resource)
    }

    pub fn get_slot(&self, key: &SlotKey) -> Option<&TrackedValue> {
        self.get(key.scope, key.owner, key.resource)
    }

    pub fn owner(&self, scope: Scope, owner: Owner) -> Option<&OwnerSlots> {
        self.scopes.get(&scope)?.get(&owner).map(|slots| slots.as_ref())
    }

    /// All slots of a scope.
    pub fn scope_slots(&self, scope: Scope) -> impl Iterator<Item = (SlotKey, &TrackedValue)> + '_ {
        self.scopes.get(&scope).into_iter().flat_map(move |owners| {
            owners.iter().flat_map(move |(owner, slots)| {
                slots
                    .iter()
                    .map(move |(resource, tracked)| (SlotKey::new(scope, *owner, *resource), tracked))
            })
        })
    }

    /// All slots of every scope.
    pub fn slots(&self) -> impl Iterator<Item = (SlotKey, &TrackedValue)> + '_ {
        self.scopes.keys().flat_map(move |scope| self.scope_slots(*scope))
    }

    /// Slots of a scope with at least one listener.
    pub fn active_slots(&self, scope: Scope) -> Vec<SlotKey> {
        self.scope_slots(scope)
            .filter(|(_, tracked)| tracked.is_active())
            .map(|(key, _)| key)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.scopes
            .values()
            .flat_map(|owners| owners.values())
            .map(|slots| slots.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot_mut(&mut self, key: &SlotKey) -> &mut TrackedValue {
        let owners = Arc::make_mut(self.scopes.entry(key.scope).or_default());
        let slots = Arc::make_mut(owners.entry(key.owner).or_default());
        slots.entry(key.resource).or_default()
    }

    /// Pure reducer: returns the next snapshot and a report, or an error leaving `self` untouched.
    pub fn apply(&self, transition: &Transition) -> Result<(StateSnapshot, TransitionReport), StateError> {
        transition.validate()?;

        let mut next = self.clone();
        let mut report = TransitionReport::default();

        match transition {
            Transition::Update { scope, owner, resource, value, block_number } => {
                let key = SlotKey::new(*scope, *owner, *resource);
                report.record(next.merge_slot(&key, *value, *block_number));
            }
            Transition::BatchUpdateOwner { scope, owner, resources, values, block_number } => {
                for (resource, value) in resources.iter().zip(values) {
                    let key = SlotKey::new(*scope, *owner, *resource);
                    report.record(next.merge_slot(&key, *value, *block_number));
                }
            }
            Transition::BatchUpdatePairs { scope, owners, resources, values, block_number } => {
                let mut grouped: HashMap<Owner, Vec<(ResourceId, Option<U256>)>> = HashMap::new();
                for ((owner, resource), value) in owners.iter().zip(resources).zip(values) {
                    grouped.entry(*owner).or_default().push((*resource, *value));
                }
                for (owner, sides) in grouped {
                    // A pair never ends up with its sides at different heights
                    let regresses = sides.iter().any(|(resource, _)| {
                        matches!(
                            self.get(*scope, owner, *resource).and_then(|t| t.as_of_block),
                            Some(current) if *block_number < current
                        )
                    });
                    if regresses {
                        report.regressed += sides.len();
                        continue;
                    }
                    // A failed side with a known value holds the whole pair at its previous block
                    let holds_previous = sides.iter().any(|(resource, value)| {
                        value.is_none()
                            && self.get(*scope, owner, *resource).is_some_and(|t| t.value.is_some())
                    });
                    if holds_previous {
                        for (resource, _) in &sides {
                            if self.get(*scope, owner, *resource).is_some_and(|t| t.value.is_some()) {
                                report.retained_previous += 1;
                            } else {
                                report.unresolved += 1;
                            }
                        }
                        continue;
                    }
                    for (resource, value) in sides {
                        let key = SlotKey::new(*scope, owner, resource);
                        report.record(next.merge_slot(&key, value, *block_number));
                    }
                }
            }
            Transition::IncrementListener { scope, owner, resource } => {
                let slot = next.slot_mut(&SlotKey::new(*scope, *owner, *resource));
                slot.listener_count = slot.listener_count.saturating_add(1);
                report.applied = 1;
            }
            Transition::DecrementListener { scope, owner, resource } => {
                let key = SlotKey::new(*scope, *owner, *resource);
                match self.get_slot(&key) {
                    Some(tracked) if tracked.listener_count > 0 => {
                        next.slot_mut(&key).listener_count -= 1;
                        report.applied = 1;
                    }
                    _ => report.underflow = true,
                }
            }
        }

        report.changed = report.applied > 0 || next.created_slots_since(self);
        if report.changed {
            next.version = self.version + 1;
        }
        Ok((next, report))
    }

    fn merge_slot(&mut self, key: &SlotKey, value: Option<U256>, block_number: u64) -> MergeOutcome {
        // Avoid cloning branches for merges that cannot change anything
        if let Some(existing) = self.get_slot(key) {
            let mut probe = existing.clone();
            let outcome = probe.merge(value, block_number);
            if !outcome.changed() {
                return outcome;
            }
        }
        self.slot_mut(key).merge(value, block_number)
    }

    fn created_slots_since(&self, previous: &StateSnapshot) -> bool {
        self.len() != previous.len()
    }
}

/// Holder of the current snapshot. Transitions are applied strictly one at a time.
pub struct StateStore {
    current: ArcSwap<StateSnapshot>,
    apply_lock: Mutex<()>,
    version_tx: watch::Sender<u64>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        Self::with_snapshot(StateSnapshot::default())
    }

    pub fn with_snapshot(snapshot: StateSnapshot) -> Self {
        let (version_tx, _) = watch::channel(snapshot.version);
        Self {
            current: ArcSwap::from_pointee(snapshot),
            apply_lock: Mutex::new(()),
            version_tx,
        }
    }

    /// Current snapshot. Cheap; never blocks on writers.
    pub fn snapshot(&self) -> Arc<StateSnapshot> {
        self.current.load_full()
    }

    pub fn get(&self, key: &SlotKey) -> Option<TrackedValue> {
        self.current.load().get_slot(key).cloned()
    }

    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    /// Receives the snapshot version after every published change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version_tx.subscribe()
    }

    pub fn apply(&self, transition: Transition) -> Result<TransitionReport, StateError> {
        let _guard = self.apply_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let current = self.current.load_full();
        let (next, report) = match current.apply(&transition) {
            Ok(result) => result,
            Err(e) => {
                let reason = match e {
                    StateError::MalformedBatch { .. } => "malformed_batch",
                    StateError::UnknownTransition(_) => "unknown_transition",
                    StateError::InvalidTransition(_) => "invalid_transition",
                };
                metrics::increment_rejected_transition(reason);
                return Err(e);
            }
        };

        if report.underflow {
            if let Transition::DecrementListener { scope, owner, resource } = &transition {
                warn!(
                    "StateStore: decrement_listener on {}/{:?}/{} with no listeners (unpaired stop_listening?)",
                    scope, owner, resource
                );
            }
            metrics::increment_listener_underflow();
        }
        if report.regressed > 0 {
            debug!(
                "StateStore: {} dropped {} slot merge(s) older than cached data",
                transition.name(),
                report.regressed
            );
        }

        if report.changed {
            let version = next.version;
            self.current.store(Arc::new(next));
            self.version_tx.send_replace(version);
            metrics::set_state_store_version(version);
        }
        Ok(report)
    }

    /// Decode and apply an untyped transition.
    pub fn apply_raw(&self, raw: serde_json::Value) -> Result<TransitionReport, StateError> {
        let transition = Transition::decode(raw).map_err(|e| {
            if let StateError::UnknownTransition(_) = e {
                metrics::increment_rejected_transition("unknown_transition");
            }
            e
        })?;
        self.apply(transition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::Address;

    fn owner() -> Address {
        Address::from_low_u64_be(0xaa)
    }

    fn token(n: u64) -> ResourceId {
        ResourceId::Token(Address::from_low_u64_be(n))
    }

    #[test]
    fn test_update_preserves_listener_count() {
        let store = StateStore::new();
        store
            .apply(Transition::IncrementListener { scope: 1, owner: owner(), resource: token(1) })
            .unwrap();
        store
            .apply(Transition::Update {
                scope: 1,
                owner: owner(),
                resource: token(1),
                value: Some(U256::from(5)),
                block_number: 100,
            })
            .unwrap();

        let slot = store.get(&SlotKey::new(1, owner(), token(1))).unwrap();
        assert_eq!(slot.listener_count, 1);
        assert_eq!(slot.value, Some(U256::from(5)));
        assert_eq!(slot.as_of_block, Some(100));
    }

    #[test]
    fn test_malformed_batch_leaves_store_unchanged() {
        let store = StateStore::new();
        let before = store.snapshot();

        let err = store
            .apply(Transition::BatchUpdateOwner {
                scope: 1,
                owner: owner(),
                resources: vec![token(1), token(2)],
                values: vec![Some(U256::one())],
                block_number: 10,
            })
            .unwrap_err();
        assert!(matches!(err, StateError::MalformedBatch { .. }));
        assert!(Arc::ptr_eq(&before, &store.snapshot()));
        assert_eq!(store.version(), 0);

        let err = store
            .apply(Transition::BatchUpdatePairs {
                scope: 1,
                owners: vec![owner()],
                resources: vec![token(1), token(2)],
                values: vec![None, None],
                block_number: 10,
            })
            .unwrap_err();
        assert!(matches!(err, StateError::MalformedBatch { .. }));
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn test_decrement_never_goes_negative() {
        let store = StateStore::new();
        let key = SlotKey::new(1, owner(), ResourceId::Native);
        let start = Transition::IncrementListener { scope: 1, owner: owner(), resource: ResourceId::Native };
        let stop = Transition::DecrementListener { scope: 1, owner: owner(), resource: ResourceId::Native };

        store.apply(start.clone()).unwrap();
        store.apply(start).unwrap();
        for _ in 0..3 {
            store.apply(stop.clone()).unwrap();
        }
        assert_eq!(store.get(&key).unwrap().listener_count, 0);

        let report = store.apply(stop).unwrap();
        assert!(report.underflow);
        assert!(!report.changed);
    }

    #[test]
    fn test_pair_merge_is_all_or_nothing() {
        let store = StateStore::new();
        let pair = owner();
        store
            .apply(Transition::Update {
                scope: 1,
                owner: pair,
                resource: token(1),
                value: Some(U256::from(10)),
                block_number: 105,
            })
            .unwrap();

        // Side 1 is already newer than 104, so side 2 must not move either
        let report = store
            .apply(Transition::BatchUpdatePairs {
                scope: 1,
                owners: vec![pair, pair],
                resources: vec![token(1), token(2)],
                values: vec![Some(U256::from(1)), Some(U256::from(2))],
                block_number: 104,
            })
            .unwrap();
        assert_eq!(report.regressed, 2);
        assert!(!report.changed);
        assert!(store.get(&SlotKey::new(1, pair, token(2))).is_none());
    }

    #[test]
    fn test_one_sided_pair_failure_keeps_both_sides() {
        let store = StateStore::new();
        let pair = owner();
        let pairs = |values: Vec<Option<U256>>, block_number| Transition::BatchUpdatePairs {
            scope: 1,
            owners: vec![pair, pair],
            resources: vec![token(1), token(2)],
            values,
            block_number,
        };
        store.apply(pairs(vec![Some(U256::from(10)), Some(U256::from(20))], 100)).unwrap();
        let version = store.version();

        let report = store.apply(pairs(vec![None, Some(U256::from(25))], 120)).unwrap();
        assert_eq!(report.retained_previous, 2);
        assert_eq!(report.applied, 0);
        assert!(!report.changed);
        assert_eq!(store.version(), version);

        let side0 = store.get(&SlotKey::new(1, pair, token(1))).unwrap();
        let side1 = store.get(&SlotKey::new(1, pair, token(2))).unwrap();
        assert_eq!((side0.value, side0.as_of_block), (Some(U256::from(10)), Some(100)));
        assert_eq!((side1.value, side1.as_of_block), (Some(U256::from(20)), Some(100)));

        store.apply(pairs(vec![Some(U256::from(11)), Some(U256::from(21))], 121)).unwrap();
        assert_eq!(store.get(&SlotKey::new(1, pair, token(1))).unwrap().as_of_block, Some(121));
        assert_eq!(store.get(&SlotKey::new(1, pair, token(2))).unwrap().as_of_block, Some(121));
    }

    #[test]
    fn test_unchanged_merge_does_not_bump_version() {
        let store = StateStore::new();
        let update = |value: Option<U256>, block_number| Transition::Update {
            scope: 1,
            owner: owner(),
            resource: token(1),
            value,
            block_number,
        };
        store.apply(update(Some(U256::from(3)), 7)).unwrap();
        assert_eq!(store.version(), 1);

        let report = store.apply(update(None, 8)).unwrap();
        assert_eq!(report.retained_previous, 1);
        assert!(!report.changed);
        assert_eq!(store.version(), 1);
    }

    #[test]
    fn test_snapshots_share_untouched_owners() {
        let store = StateStore::new();
        let other = Address::from_low_u64_be(0xbb);
        for (who, block) in [(owner(), 1u64), (other, 1)] {
            store
                .apply(Transition::Update {
                    scope: 1,
                    owner: who,
                    resource: ResourceId::Native,
                    value: Some(U256::one()),
                    block_number: block,
                })
                .unwrap();
        }
        let before = store.snapshot();
        store
            .apply(Transition::Update {
                scope: 1,
                owner: owner(),
                resource: ResourceId::Native,
                value: Some(U256::from(2)),
                block_number: 2,
            })
            .unwrap();
        let after = store.snapshot();

        assert_eq!(before.get(1, owner(), ResourceId::Native).unwrap().value, Some(U256::one()));
        assert_eq!(after.get(1, owner(), ResourceId::Native).unwrap().value, Some(U256::from(2)));
        assert!(std::ptr::eq(before.owner(1, other).unwrap(), after.owner(1, other).unwrap()));
    }

    #[test]
    fn test_decode_rejects_unknown_transition() {
        let raw = serde_json::json!({ "type": "reset_everything", "scope": 1 });
        assert_eq!(
            Transition::decode(raw),
            Err(StateError::UnknownTransition("reset_everything".to_string()))
        );

        let raw = serde_json::json!({ "type": "update", "scope": 1 });
        assert!(matches!(Transition::decode(raw), Err(StateError::InvalidTransition(_))));

        let store = StateStore::new();
        let raw = serde_json::json!({
            "type": "increment_listener",
            "scope": 1,
            "owner": format!("{:?}", owner()),
            "resource": "native"
        });
        store.apply_raw(raw).unwrap();
        assert_eq!(
            store.get(&SlotKey::new(1, owner(), ResourceId::Native)).unwrap().listener_count,
            1
        );
    }

    #[tokio::test]
    async fn test_version_notifications() {
        let store = StateStore::new();
        let mut rx = store.subscribe();
        store
            .apply(Transition::IncrementListener { scope: 1, owner: owner(), resource: token(9) })
            .unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 1);
    }
}
