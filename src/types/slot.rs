use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Network namespace (chain id). Every cached value is partitioned by scope first.
pub type Scope = u64;

/// Address holding a value: a user account or a pair contract.
pub type Owner = Address;

/// What is being measured for an owner: the native coin balance or an ERC-20 balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceId {
    Native,
    Token(Address),
}

impl ResourceId {
    pub fn token_address(&self) -> Option<Address> {
        match self {
            ResourceId::Native => None,
            ResourceId::Token(addr) => Some(*addr),
        }
    }
}

impl From<Address> for ResourceId {
    fn from(addr: Address) -> Self {
        ResourceId::Token(addr)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceId::Native => write!(f, "native"),
            ResourceId::Token(addr) => write!(f, "{:?}", addr),
        }
    }
}

/// Fully qualified identity of a cached value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotKey {
    pub scope: Scope,
    pub owner: Owner,
    pub resource: ResourceId,
}

impl SlotKey {
    pub fn new(scope: Scope, owner: Owner, resource: ResourceId) -> Self {
        Self { scope, owner, resource }
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:?}/{}", self.scope, self.owner, self.resource)
    }
}

/// Cached value plus the block it was last confirmed at.
///
/// - `value == None`: never fetched, or every fetch so far failed
/// - `as_of_block == None`: never successfully fetched
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedValue {
    pub value: Option<U256>,
    pub as_of_block: Option<u64>,
    pub listener_count: u32,
}

/// Result of merging one fetched value into a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Value and block were written.
    Applied,
    /// Merge was tagged with a block older than the slot's; dropped.
    Regressed,
    /// Fetch failed while a known value exists; the known value is kept.
    RetainedPrevious,
    /// Fetch failed and nothing was known yet; slot stays empty.
    Unresolved,
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, MergeOutcome::Applied)
    }
}

impl TrackedValue {
    pub fn is_known_zero(&self) -> bool {
        matches!(self.value, Some(v) if v.is_zero())
    }

    pub fn is_active(&self) -> bool {
        self.listener_count > 0
    }

    /// Merge a fetch result tagged with `block_number`.
    ///
    /// `as_of_block` never moves backwards, and a failed fetch never blanks a known value.
    pub fn merge(&mut self, value: Option<U256>, block_number: u64) -> MergeOutcome {
        if matches!(self.as_of_block, Some(current) if block_number < current) {
            return MergeOutcome::Regressed;
        }
        match value {
            Some(v) => {
                self.value = Some(v);
                self.as_of_block = Some(block_number);
                MergeOutcome::Applied
            }
            None if self.value.is_some() => MergeOutcome::RetainedPrevious,
            None => MergeOutcome::Unresolved,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_fetch_keeps_known_value() {
        let mut slot = TrackedValue::default();
        assert_eq!(slot.merge(Some(U256::from(5)), 100), MergeOutcome::Applied);
        assert_eq!(slot.merge(None, 101), MergeOutcome::RetainedPrevious);
        assert_eq!(slot.value, Some(U256::from(5)));
        assert_eq!(slot.as_of_block, Some(100));

        assert_eq!(slot.merge(Some(U256::from(7)), 102), MergeOutcome::Applied);
        assert_eq!(slot.value, Some(U256::from(7)));
        assert_eq!(slot.as_of_block, Some(102));
    }

    #[test]
    fn test_older_block_is_dropped() {
        let mut slot = TrackedValue::default();
        slot.merge(Some(U256::from(9)), 50);
        assert_eq!(slot.merge(Some(U256::from(1)), 49), MergeOutcome::Regressed);
        assert_eq!(slot.value, Some(U256::from(9)));
        assert_eq!(slot.as_of_block, Some(50));

        // Same block is not a regression
        assert_eq!(slot.merge(Some(U256::from(2)), 50), MergeOutcome::Applied);
    }

    #[test]
    fn test_failure_on_empty_slot() {
        let mut slot = TrackedValue::default();
        assert_eq!(slot.merge(None, 10), MergeOutcome::Unresolved);
        assert_eq!(slot.value, None);
        assert_eq!(slot.as_of_block, None);
    }

    #[test]
    fn test_known_zero() {
        let mut slot = TrackedValue::default();
        assert!(!slot.is_known_zero());
        slot.merge(Some(U256::zero()), 1);
        assert!(slot.is_known_zero());
    }
}
