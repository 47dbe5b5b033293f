//! Block-based staleness decisions. Pure, no I/O.

use crate::types::TrackedValue;
use std::time::Duration;

/// Refetch thresholds, in blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessPolicy {
    /// Known non-zero values.
    pub short_blocks: u64,
    /// Known-zero values; rarely change, so re-checked less often.
    pub long_blocks: u64,
    /// Each side of a pair's reserves.
    pub pair_blocks: u64,
}

impl Default for StalenessPolicy {
    fn default() -> Self {
        Self::from_durations(
            Duration::from_secs(15),
            Duration::from_secs(120),
            Duration::from_secs(900),
            Duration::from_secs(300),
        )
    }
}

fn to_blocks(window: Duration, block_time: Duration) -> u64 {
    let block_ms = block_time.as_millis().max(1);
    // At least one block, otherwise every tick refetches everything
    ((window.as_millis() / block_ms) as u64).max(1)
}

impl StalenessPolicy {
    /// Convert wall-clock windows into block counts for a chain with `block_time` blocks.
    pub fn from_durations(block_time: Duration, short: Duration, long: Duration, pair: Duration) -> Self {
        Self {
            short_blocks: to_blocks(short, block_time),
            long_blocks: to_blocks(long, block_time),
            pair_blocks: to_blocks(pair, block_time),
        }
    }

    fn elapsed(as_of_block: u64, current_block: u64) -> u64 {
        current_block.saturating_sub(as_of_block)
    }

    pub fn is_stale(&self, tracked: &TrackedValue, current_block: u64) -> bool {
        let Some(as_of_block) = tracked.as_of_block else {
            return true;
        };
        let threshold = if tracked.is_known_zero() {
            self.long_blocks
        } else {
            self.short_blocks
        };
        Self::elapsed(as_of_block, current_block) >= threshold
    }

    /// Both sides are refreshed together if either is stale or they disagree on the block.
    pub fn is_pair_stale(&self, side0: &TrackedValue, side1: &TrackedValue, current_block: u64) -> bool {
        match (side0.as_of_block, side1.as_of_block) {
            (Some(b0), Some(b1)) => {
                b0 != b1
                    || Self::elapsed(b0, current_block) >= self.pair_blocks
                    || Self::elapsed(b1, current_block) >= self.pair_blocks
            }
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::U256;

    fn tracked(value: u64, block: u64) -> TrackedValue {
        TrackedValue {
            value: Some(U256::from(value)),
            as_of_block: Some(block),
            listener_count: 1,
        }
    }

    #[test]
    fn test_default_thresholds_in_blocks() {
        let policy = StalenessPolicy::default();
        assert_eq!(policy.short_blocks, 8);
        assert_eq!(policy.long_blocks, 60);
        assert_eq!(policy.pair_blocks, 20);
    }

    #[test]
    fn test_never_fetched_is_stale() {
        let policy = StalenessPolicy::default();
        assert!(policy.is_stale(&TrackedValue::default(), 0));
    }

    #[test]
    fn test_nonzero_uses_short_threshold() {
        let policy = StalenessPolicy::default();
        let value = tracked(5, 100);
        assert!(!policy.is_stale(&value, 100));
        assert!(!policy.is_stale(&value, 107));
        assert!(policy.is_stale(&value, 108));
    }

    #[test]
    fn test_zero_uses_long_threshold() {
        let policy = StalenessPolicy::default();
        let zero = tracked(0, 100);
        assert!(!policy.is_stale(&zero, 108));
        assert!(!policy.is_stale(&zero, 159));
        assert!(policy.is_stale(&zero, 160));
    }

    #[test]
    fn test_block_behind_cached_value_is_fresh() {
        let policy = StalenessPolicy::default();
        assert!(!policy.is_stale(&tracked(5, 100), 90));
    }

    #[test]
    fn test_pair_staleness() {
        let policy = StalenessPolicy::default();
        assert!(!policy.is_pair_stale(&tracked(1, 100), &tracked(2, 100), 119));
        assert!(policy.is_pair_stale(&tracked(1, 100), &tracked(2, 100), 120));
        // Sides at different heights are always refreshed together
        assert!(policy.is_pair_stale(&tracked(1, 100), &tracked(2, 101), 101));
        assert!(policy.is_pair_stale(&tracked(1, 100), &TrackedValue::default(), 100));
    }

    #[test]
    fn test_custom_block_time() {
        let policy = StalenessPolicy::from_durations(
            Duration::from_secs(2),
            Duration::from_secs(120),
            Duration::from_secs(900),
            Duration::from_secs(1),
        );
        assert_eq!(policy.short_blocks, 60);
        assert_eq!(policy.long_blocks, 450);
        assert_eq!(policy.pair_blocks, 1);
    }
}
