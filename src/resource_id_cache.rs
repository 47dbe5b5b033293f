//! # Resource Id Cache
//!
//! Memoizes the deterministic mapping `(scope, tokenA, tokenB) -> pair address`.
//! The pair is canonicalized (lower address first) before lookup, so argument order
//! never matters and the derivation runs at most once per unordered pair for the
//! lifetime of the process. Entries are derived from immutable inputs and are never
//! evicted.

use crate::metrics;
use crate::types::{InvalidEntityError, Scope};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ethers::types::{Address, H256};
use ethers::utils::{get_create2_address_from_hash, keccak256};
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;

/// Pure pair-address derivation. Receives the pair already in canonical order.
pub trait PairDeriver: Send + Sync {
    fn derive(&self, scope: Scope, low: Address, high: Address) -> Result<Address, InvalidEntityError>;
}

/// Factory and init code hash used for CREATE2 pair derivation on one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairFactory {
    pub factory: Address,
    pub init_code_hash: H256,
}

/// Uniswap V2 style CREATE2 derivation: `salt = keccak256(token0 ++ token1)`.
#[derive(Debug, Clone, Default)]
pub struct Create2PairDeriver {
    factories: HashMap<Scope, PairFactory>,
}

impl Create2PairDeriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_factory(mut self, scope: Scope, factory: PairFactory) -> Self {
        self.factories.insert(scope, factory);
        self
    }
}

impl PairDeriver for Create2PairDeriver {
    fn derive(&self, scope: Scope, low: Address, high: Address) -> Result<Address, InvalidEntityError> {
        let factory = self
            .factories
            .get(&scope)
            .ok_or(InvalidEntityError::UnknownScope(scope))?;

        let mut packed = Vec::with_capacity(40);
        packed.extend_from_slice(low.as_bytes());
        packed.extend_from_slice(high.as_bytes());
        let salt = keccak256(packed);

        Ok(get_create2_address_from_hash(
            factory.factory,
            salt,
            factory.init_code_hash.as_bytes(),
        ))
    }
}

/// Order two entity addresses canonically, rejecting malformed pairs.
pub fn canonical_pair(a: Address, b: Address) -> Result<(Address, Address), InvalidEntityError> {
    if a.is_zero() || b.is_zero() {
        return Err(InvalidEntityError::ZeroAddress);
    }
    if a == b {
        return Err(InvalidEntityError::IdenticalEntities(a));
    }
    Ok(if a < b { (a, b) } else { (b, a) })
}

/// Process-lifetime memo of pair derivations.
#[derive(Clone)]
pub struct ResourceIdCache {
    deriver: Arc<dyn PairDeriver>,
    entries: Arc<DashMap<(Scope, Address, Address), Address>>,
}

impl ResourceIdCache {
    pub fn new(deriver: Arc<dyn PairDeriver>) -> Self {
        Self {
            deriver,
            entries: Arc::new(DashMap::new()),
        }
    }

    /// Returns the memoized pair id, deriving it on first use.
    ///
    /// Failed derivations are not cached.
    pub fn get_or_derive(&self, scope: Scope, a: Address, b: Address) -> Result<Address, InvalidEntityError> {
        let (low, high) = canonical_pair(a, b)?;

        // Derive under the shard lock so concurrent callers never derive twice
        let id = match self.entries.entry((scope, low, high)) {
            Entry::Occupied(entry) => {
                metrics::increment_cache_hit("resource_id");
                return Ok(*entry.get());
            }
            Entry::Vacant(entry) => {
                metrics::increment_cache_miss("resource_id");
                let id = self.deriver.derive(scope, low, high)?;
                entry.insert(id);
                id
            }
        };
        // Shard lock released; len() would deadlock while holding it
        debug!("ResourceIdCache: derived {:?} for ({:?}, {:?}) on scope {}", id, low, high, scope);
        metrics::set_cache_size("resource_id", self.entries.len() as f64);
        Ok(id)
    }

    /// Lookup without deriving.
    pub fn get(&self, scope: Scope, a: Address, b: Address) -> Option<Address> {
        let (low, high) = canonical_pair(a, b).ok()?;
        self.entries.get(&(scope, low, high)).map(|e| *e.value())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDeriver {
        calls: AtomicUsize,
    }

    impl PairDeriver for CountingDeriver {
        fn derive(&self, _scope: Scope, low: Address, high: Address) -> Result<Address, InvalidEntityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Address::from_slice(&keccak256([low.as_bytes(), high.as_bytes()].concat())[12..]))
        }
    }

    fn addr(s: &str) -> Address {
        Address::from_str(s).unwrap()
    }

    #[test]
    fn test_uniswap_v2_pair_address() {
        let deriver = Create2PairDeriver::new().with_factory(
            1,
            PairFactory {
                factory: addr("0x5C69bEe701ef814a2B6a3EDD4B1652CB9cc5aA6f"),
                init_code_hash: H256::from_str(
                    "0x96e8ac4277198ff8b6f785478aa9a39f403cb768dd02cbee326c3e7da348845f",
                )
                .unwrap(),
            },
        );
        let cache = ResourceIdCache::new(Arc::new(deriver));
        let dai = addr("0x6B175474E89094C44Da98b954EedeAC495271d0F");
        let weth = addr("0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2");

        let pair = cache.get_or_derive(1, weth, dai).unwrap();
        assert_eq!(pair, addr("0xA478c2975Ab1Ea89e8196811F51A7B7Ade33eB11"));
        assert_eq!(cache.get_or_derive(1, dai, weth).unwrap(), pair);
    }

    #[test]
    fn test_derives_once_per_unordered_pair() {
        let deriver = Arc::new(CountingDeriver { calls: AtomicUsize::new(0) });
        let cache = ResourceIdCache::new(deriver.clone());
        let a = Address::from_low_u64_be(7);
        let b = Address::from_low_u64_be(3);

        let first = cache.get_or_derive(1, a, b).unwrap();
        let second = cache.get_or_derive(1, b, a).unwrap();
        assert_eq!(first, second);
        assert_eq!(deriver.calls.load(Ordering::SeqCst), 1);

        // Different scope is a different entry
        cache.get_or_derive(5, a, b).unwrap();
        assert_eq!(deriver.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_failed_derivation_is_not_cached() {
        let cache = ResourceIdCache::new(Arc::new(Create2PairDeriver::new()));
        let a = Address::from_low_u64_be(1);
        let b = Address::from_low_u64_be(2);

        assert_eq!(cache.get_or_derive(1, a, b), Err(InvalidEntityError::UnknownScope(1)));
        assert_eq!(cache.get_or_derive(1, a, a), Err(InvalidEntityError::IdenticalEntities(a)));
        assert_eq!(
            cache.get_or_derive(1, a, Address::zero()),
            Err(InvalidEntityError::ZeroAddress)
        );
        assert!(cache.is_empty());
    }
}
