//! Prometheus-backed event recorder.
//!
//! Counts tier transitions by kind and exposes store gauges. The admin server
//! renders the registry in the text exposition format at `/metrics`.

use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::context::{EventKind, EventRecorder, TierEvent};
use crate::store::tiered::StoreStats;

pub struct PrometheusEvents {
    registry: Registry,
    transitions: IntCounterVec,
    off_heap_entries: IntGauge,
    off_heap_allocated: IntGauge,
    swap_keys: IntGauge,
    swap_size: IntGauge,
}

impl PrometheusEvents {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let transitions = IntCounterVec::new(
            Opts::new("tiered_swap_transitions_total", "Entries moved between tiers"),
            &["kind"],
        )?;
        let off_heap_entries = IntGauge::new("tiered_swap_offheap_entries", "Entries in the off-heap region")?;
        let off_heap_allocated =
            IntGauge::new("tiered_swap_offheap_allocated_bytes", "Bytes allocated in the off-heap region")?;
        let swap_keys = IntGauge::new("tiered_swap_swap_keys", "Keys in the swap space")?;
        let swap_size = IntGauge::new("tiered_swap_swap_bytes", "Bytes stored in the swap space")?;

        registry.register(Box::new(transitions.clone()))?;
        registry.register(Box::new(off_heap_entries.clone()))?;
        registry.register(Box::new(off_heap_allocated.clone()))?;
        registry.register(Box::new(swap_keys.clone()))?;
        registry.register(Box::new(swap_size.clone()))?;

        Ok(Self {
            registry,
            transitions,
            off_heap_entries,
            off_heap_allocated,
            swap_keys,
            swap_size,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Transitions of `kind` recorded so far.
    pub fn count(&self, kind: EventKind) -> u64 {
        self.transitions.with_label_values(&[kind.as_str()]).get()
    }

    /// Refresh the store gauges.
    pub fn observe(&self, stats: &StoreStats) {
        self.off_heap_entries.set(stats.off_heap_entries as i64);
        self.off_heap_allocated.set(stats.off_heap_allocated as i64);
        self.swap_keys.set(stats.swap_keys);
        self.swap_size.set(stats.swap_size);
    }

    /// Render every metric in the text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl<K> EventRecorder<K> for PrometheusEvents {
    fn is_recordable(&self, _kind: EventKind) -> bool {
        true
    }

    fn record(&self, event: TierEvent<'_, K>) {
        self.transitions
            .with_label_values(&[event.kind.as_str()])
            .inc();
    }
}
