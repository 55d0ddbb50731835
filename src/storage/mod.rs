//! Storage
//!
//! The sharded TTL store and its background sweeper.
//!
//! - [`engine`]: `Store`, with per-shard `RwLock` maps, hash routing, expiry
//! - [`sweeper`]: periodic sweep plus the lazy-remove queue drain

pub mod engine;
pub mod sweeper;

pub use engine::{Store, StoreError, DEFAULT_SHARD_COUNT};
pub use sweeper::{SweepConfig, Sweeper, DEFAULT_SWEEP_INTERVAL, MIN_SWEEP_INTERVAL};

/// Selects the backing store implementation.
///
/// Only the in-memory kind exists today; the persistent variant is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Memory,
    Persistent,
}

/// Constructs a store of the given kind.
pub fn open(kind: StoreKind, shard_count: usize) -> Result<Store, StoreError> {
    match kind {
        StoreKind::Memory => Ok(Store::new(shard_count)),
        StoreKind::Persistent => Err(StoreError::InvalidKind),
    }
}
