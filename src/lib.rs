//! tiered-swap: tiered storage for evicted cache entries.
//!
//! Moves entries a cache node evicts from its heap through a hierarchy of
//! storage tiers:
//!   off-heap memory region (warm) → disk swap space (cold)
//!
//! Other subsystems observe the transitions through partition listeners,
//! the event recorder and the query index hooks.

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod server;
pub mod store;

pub use error::{Result, StoreError};
pub use store::tiered::{TierSelection, TieredStore};
