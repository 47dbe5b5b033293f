//! # MIG Chain State Cache
//!
//! A block-driven synchronization cache for on-chain values shown by a trading UI:
//! native and token balances of accounts, and token reserves held by pair contracts.
//!
//! ## Overview
//!
//! Values live in an immutable snapshot keyed by `(scope, owner, resource)`. Every
//! change goes through a closed set of transitions applied one at a time, so readers
//! always see a consistent view and each slot only ever moves forward in block height.
//!
//! - **State**: the snapshot store, listener reference counts and merge rules
//! - **Sync**: on each new block, stale slots are fetched in bulk and merged back
//! - **Entities**: user-imported tokens and pairs on top of a default token list
//! - **Persistence**: debounced writes of user data and last known balances
//!
//! ## Architecture
//!
//! ### State Layer
//! [`state_store::StateStore`] holds the current snapshot behind an atomic pointer.
//! [`listener_registry::ListenerRegistry`] counts interest per slot.
//!
//! ### Sync Layer
//! [`block_stream::BlockStream`] fans new block numbers out to one
//! [`synchronizer::BatchSynchronizer`] per scope, which asks a
//! [`fetcher::ValueFetcher`] for stale slots and merges the results.
//!
//! ### Entity Layer
//! [`user_store::UserStore`] keeps imported tokens, pairs and preferences.
//! [`resource_id_cache::ResourceIdCache`] memoizes pair address derivation.
//!
//! ### Persistence Layer
//! [`persistence::PersistenceBridge`] saves documents after changes settle and the
//! cache rehydrates from them on start.

// Core Types
/// Slot keys, tracked values and entities
pub mod types;

// State Layer
/// Snapshot store with closed transitions
pub mod state_store;
/// Listener reference counting
pub mod listener_registry;
/// Block-based freshness rules
pub mod staleness;

// Entity Layer
/// Memoized pair address derivation
pub mod resource_id_cache;
/// User tokens, pairs and preferences
pub mod user_store;
/// Slots kept fresh without explicit listeners
pub mod ambient;

// Sync Layer
/// New block fan-out
pub mod block_stream;
/// Value fetching from a node
pub mod fetcher;
/// Multicall batch RPC utilities
pub mod multicall;
/// Block-driven batch synchronization
pub mod synchronizer;

// Persistence Layer
/// Quiet-period action scheduling
pub mod debounce;
/// Storage backends and persisted documents
pub mod persistence;

// Facade
/// Entry point tying the layers together
pub mod chain_state_cache;

// Infrastructure
/// Metrics and observability
pub mod metrics;

// Contracts (Public ABIs Only)
/// Smart contract ABIs (read-only)
pub mod contracts;

// Settings & Configuration
/// Configuration management
pub mod settings;

// Re-exports for convenience
pub use chain_state_cache::ChainStateCache;
pub use settings::Settings;
pub use state_store::{StateStore, Transition};
pub use synchronizer::BatchSynchronizer;
pub use types::{ResourceId, SlotKey, TrackedValue};
