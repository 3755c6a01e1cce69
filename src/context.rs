//! Collaborators the tiered store depends on.
//!
//! The store never computes affinity, resolves deployments, marshals objects,
//! indexes queries or records events itself. Each concern is a trait here; the
//! defaults below are enough to run a standalone node and the test suites.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{CodecError, StoreError};
use crate::store::entry::{LoaderId, SwapValue};

/// Bounds every cache key must satisfy.
pub trait CacheKey: Clone + Debug + Send + Sync + 'static {}
impl<T: Clone + Debug + Send + Sync + 'static> CacheKey for T {}

/// Bounds every cache value must satisfy.
pub trait CacheValue: Send + Sync + 'static {}
impl<T: Send + Sync + 'static> CacheValue for T {}

/// Handle to a deployment unit's loader, passed to the marshaller on decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Loader {
    pub id: LoaderId,
}

/// Consistent-hash partition assignment.
pub trait Affinity<K>: Send + Sync {
    fn partitions(&self) -> u32;
    fn partition(&self, key: &K) -> u32;
}

/// Resolves loader ids to loaders.
pub trait Deployment: Send + Sync {
    /// `None` when the deployment unit is gone (e.g. undeployed by a peer).
    fn resolve(&self, id: LoaderId) -> Option<Loader>;
    fn local_loader(&self) -> Loader;
    fn global_loader(&self) -> Loader;
}

/// Object marshaller for keys or values.
pub trait Marshaller<T>: Send + Sync {
    fn marshal(&self, value: &T) -> Result<Vec<u8>, CodecError>;
    fn unmarshal(&self, bytes: &[u8], loader: &Loader) -> Result<T, CodecError>;

    /// Loader of the deployment unit owning this value's type, if any.
    fn loader_of(&self, _value: &T) -> Option<LoaderId> {
        None
    }
}

/// Query index hooks.
pub trait QueryIndex<K, V>: Send + Sync {
    fn on_swap(&self, space: &str, key: &K);
    fn on_unswap(&self, key: &K, value: &SwapValue<V>, value_bytes: &[u8]);
}

/// Tier transition event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ToOffHeap,
    FromOffHeap,
    Swapped,
    Unswapped,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ToOffHeap => "to_offheap",
            EventKind::FromOffHeap => "from_offheap",
            EventKind::Swapped => "swapped",
            EventKind::Unswapped => "unswapped",
        }
    }
}

/// A tier transition to record.
#[derive(Debug)]
pub struct TierEvent<'a, K> {
    pub kind: EventKind,
    pub partition: u32,
    pub key: &'a K,
    pub node_id: Uuid,
    pub has_value: bool,
}

/// Event subsystem.
pub trait EventRecorder<K>: Send + Sync {
    fn is_recordable(&self, kind: EventKind) -> bool;
    fn record(&self, event: TierEvent<'_, K>);
}

/// The cache layer that owns the store. Removal through lazy iterators goes
/// here so that it triggers ordinary invalidation and replication.
pub trait CacheRemover<K>: Send + Sync {
    fn remove(&self, key: &K) -> Result<(), StoreError>;
}

/// Everything the store needs from the rest of the node.
pub struct StoreContext<K, V> {
    pub node_id: Uuid,
    pub affinity: Arc<dyn Affinity<K>>,
    pub deployment: Arc<dyn Deployment>,
    pub key_marshaller: Arc<dyn Marshaller<K>>,
    pub value_marshaller: Arc<dyn Marshaller<V>>,
    pub queries: Option<Arc<dyn QueryIndex<K, V>>>,
    pub events: Option<Arc<dyn EventRecorder<K>>>,
    pub cache: Option<Arc<dyn CacheRemover<K>>>,
}

impl<K, V> StoreContext<K, V> {
    pub fn new(
        affinity: Arc<dyn Affinity<K>>,
        deployment: Arc<dyn Deployment>,
        key_marshaller: Arc<dyn Marshaller<K>>,
        value_marshaller: Arc<dyn Marshaller<V>>,
    ) -> Self {
        Self {
            node_id: Uuid::new_v4(),
            affinity,
            deployment,
            key_marshaller,
            value_marshaller,
            queries: None,
            events: None,
            cache: None,
        }
    }

    pub fn with_queries(mut self, queries: Arc<dyn QueryIndex<K, V>>) -> Self {
        self.queries = Some(queries);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventRecorder<K>>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheRemover<K>>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Record an event if the event subsystem wants it.
    pub(crate) fn record(&self, kind: EventKind, partition: u32, key: &K, has_value: bool) {
        if let Some(events) = &self.events {
            if events.is_recordable(kind) {
                events.record(TierEvent {
                    kind,
                    partition,
                    key,
                    node_id: self.node_id,
                    has_value,
                });
            }
        }
    }
}

impl<K, V> StoreContext<K, V>
where
    K: Hash + Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Context backed by hash affinity, a static deployment and bincode marshallers.
    pub fn standalone(partitions: u32) -> Self {
        Self::new(
            Arc::new(HashAffinity::new(partitions)),
            Arc::new(StaticDeployment::new()),
            Arc::new(BincodeMarshaller::new()),
            Arc::new(BincodeMarshaller::new()),
        )
    }
}

/// Partition = hash(key) mod partitions.
#[derive(Debug, Clone)]
pub struct HashAffinity {
    partitions: u32,
}

impl HashAffinity {
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions: partitions.max(1),
        }
    }
}

impl<K: Hash> Affinity<K> for HashAffinity {
    fn partitions(&self) -> u32 {
        self.partitions
    }

    fn partition(&self, key: &K) -> u32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.partitions as u64) as u32
    }
}

/// A deployment with fixed local/global loaders and a table of registered units.
#[derive(Debug)]
pub struct StaticDeployment {
    local: Loader,
    global: Loader,
    units: RwLock<HashMap<LoaderId, Loader>>,
}

impl StaticDeployment {
    pub fn new() -> Self {
        let local = Loader { id: LoaderId::random() };
        let global = Loader { id: LoaderId::random() };
        let mut units = HashMap::new();
        units.insert(local.id, local);
        units.insert(global.id, global);
        Self {
            local,
            global,
            units: RwLock::new(units),
        }
    }

    /// Register a new deployment unit and return its loader id.
    pub fn deploy(&self) -> LoaderId {
        let id = LoaderId::random();
        self.units.write().insert(id, Loader { id });
        id
    }

    /// Forget a deployment unit. Subsequent resolution of `id` fails.
    pub fn undeploy(&self, id: LoaderId) -> bool {
        self.units.write().remove(&id).is_some()
    }
}

impl Default for StaticDeployment {
    fn default() -> Self {
        Self::new()
    }
}

impl Deployment for StaticDeployment {
    fn resolve(&self, id: LoaderId) -> Option<Loader> {
        self.units.read().get(&id).copied()
    }

    fn local_loader(&self) -> Loader {
        self.local
    }

    fn global_loader(&self) -> Loader {
        self.global
    }
}

/// Serde/bincode marshaller. Ignores the loader.
pub struct BincodeMarshaller<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> BincodeMarshaller<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for BincodeMarshaller<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Marshaller<T> for BincodeMarshaller<T>
where
    T: Serialize + DeserializeOwned,
{
    fn marshal(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(value).map_err(|e| CodecError::Marshal(e.to_string()))
    }

    fn unmarshal(&self, bytes: &[u8], _loader: &Loader) -> Result<T, CodecError> {
        bincode::deserialize(bytes).map_err(|e| CodecError::Unmarshal(e.to_string()))
    }
}
