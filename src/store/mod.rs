//! Tiered swap storage for one cache.
//!
//! This module contains the store facade and the pieces it wires together:
//! - [`entry`]: SwapEntry, EntryEnvelope, SwapKey, TierKind definitions
//! - [`codec`]: Envelope encoding and value materialization
//! - [`listener`]: Per-partition unswap listener registry
//! - [`tracker`]: Reclamation of abandoned lazy iterators
//! - [`tier`]: Off-heap and swap tier adapters, eviction spill
//! - [`iter`]: Closeable iterators and dual-tier chaining
//! - [`tiered`]: The TieredStore facade

pub mod codec;
pub mod entry;
pub mod iter;
pub mod listener;
pub mod tier;
pub mod tiered;
pub mod tracker;
