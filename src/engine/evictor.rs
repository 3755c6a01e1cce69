//! Eviction policy: decides which region entries to push out under pressure.
//!
//! Uses a weighted scoring function combining:
//! - Ticks since last access (old → evictable)
//! - Entry size (large → evictable, off by default)

use std::collections::BinaryHeap;

use bytes::Bytes;

use crate::config::EvictionConfig;

/// An eviction candidate with its computed priority score.
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub partition: u32,
    pub key_bytes: Bytes,
    pub last_access: u64,
    pub size: u64,
    pub score: f64,
}

// Higher score = higher eviction priority (should be evicted first).
impl PartialEq for EvictionCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.score == other.score
    }
}

impl Eq for EvictionCandidate {}

impl PartialOrd for EvictionCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EvictionCandidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.score
            .partial_cmp(&other.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    }
}

/// The eviction policy engine.
pub struct Evictor {
    config: EvictionConfig,
}

impl Evictor {
    pub fn new(config: EvictionConfig) -> Self {
        Self { config }
    }

    /// Compute eviction priority for an entry.
    ///
    /// ```text
    /// priority = age_weight × (now - last_access) + size_weight × size_kib
    /// ```
    pub fn compute_priority(&self, last_access: u64, size: u64, now: u64) -> f64 {
        let age = now.saturating_sub(last_access) as f64;
        let size_kib = size as f64 / 1024.0;
        self.config.age_weight * age + self.config.size_weight * size_kib
    }

    /// Select victims, highest priority first, until at least `bytes_to_free`
    /// bytes are covered or candidates run out.
    ///
    /// Candidates in `protected` (partition, key) are never selected.
    pub fn select_victims(
        &self,
        candidates: impl IntoIterator<Item = (u32, Bytes, u64, u64)>,
        bytes_to_free: u64,
        now: u64,
        protected: &[(u32, &[u8])],
    ) -> Vec<EvictionCandidate> {
        let mut heap = BinaryHeap::new();

        for (partition, key_bytes, last_access, size) in candidates {
            if protected
                .iter()
                .any(|(p, k)| *p == partition && *k == key_bytes.as_ref())
            {
                continue;
            }

            let score = self.compute_priority(last_access, size, now);
            heap.push(EvictionCandidate {
                partition,
                key_bytes,
                last_access,
                size,
                score,
            });
        }

        let mut victims = Vec::new();
        let mut freed = 0u64;
        while freed < bytes_to_free {
            match heap.pop() {
                Some(candidate) => {
                    freed += candidate.size;
                    victims.push(candidate);
                }
                None => break,
            }
        }

        victims
    }
}
