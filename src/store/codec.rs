//! Envelope codec: the only place that turns entries into tier bytes and back.
//!
//! The envelope itself is bincode over [`EntryEnvelope`] and needs no loader.
//! Materializing the value does: it goes through the value marshaller with
//! the loader the envelope names. If that loader no longer resolves, the
//! entry is not usable and decodes to `None` instead of failing.

use std::sync::Arc;

use bytes::Bytes;

use crate::context::{Deployment, Loader, Marshaller, StoreContext};
use crate::error::CodecError;
use crate::store::entry::{key_hash, CacheVersion, EntryEnvelope, LoaderId, SwapEntry, SwapValue};

pub struct EntryCodec<K, V> {
    deployment: Arc<dyn Deployment>,
    key_marshaller: Arc<dyn Marshaller<K>>,
    value_marshaller: Arc<dyn Marshaller<V>>,
}

impl<K, V> Clone for EntryCodec<K, V> {
    fn clone(&self) -> Self {
        Self {
            deployment: self.deployment.clone(),
            key_marshaller: self.key_marshaller.clone(),
            value_marshaller: self.value_marshaller.clone(),
        }
    }
}

impl<K, V> EntryCodec<K, V> {
    pub fn new(
        deployment: Arc<dyn Deployment>,
        key_marshaller: Arc<dyn Marshaller<K>>,
        value_marshaller: Arc<dyn Marshaller<V>>,
    ) -> Self {
        Self {
            deployment,
            key_marshaller,
            value_marshaller,
        }
    }

    pub fn from_context(ctx: &StoreContext<K, V>) -> Self {
        Self::new(
            ctx.deployment.clone(),
            ctx.key_marshaller.clone(),
            ctx.value_marshaller.clone(),
        )
    }

    /// Encode an envelope into its at-rest form.
    pub fn encode(&self, envelope: &EntryEnvelope) -> Result<Bytes, CodecError> {
        bincode::serialize(envelope)
            .map(Bytes::from)
            .map_err(CodecError::Encode)
    }

    /// Decode the at-rest form without touching the value.
    pub fn decode_envelope(&self, bytes: &[u8]) -> Result<EntryEnvelope, CodecError> {
        bincode::deserialize(bytes).map_err(CodecError::Decode)
    }

    /// Decode and materialize. `Ok(None)` when the value's loader is gone.
    pub fn decode(&self, bytes: &[u8]) -> Result<Option<SwapEntry<V>>, CodecError> {
        let envelope = self.decode_envelope(bytes)?;
        self.materialize(envelope)
    }

    /// Rebuild the value carried by an envelope.
    pub fn materialize(&self, envelope: EntryEnvelope) -> Result<Option<SwapEntry<V>>, CodecError> {
        if envelope.value_is_bytes {
            return Ok(Some(SwapEntry {
                value: SwapValue::Bytes(envelope.value_bytes.clone()),
                envelope,
            }));
        }

        let loader = match envelope.value_loader {
            Some(id) => match self.deployment.resolve(id) {
                Some(loader) => loader,
                None => {
                    tracing::debug!(loader = %id, "Value loader is gone, entry is not usable");
                    return Ok(None);
                }
            },
            None => self.deployment.local_loader(),
        };

        let value = self.value_marshaller.unmarshal(&envelope.value_bytes, &loader)?;
        Ok(Some(SwapEntry {
            value: SwapValue::Object(value),
            envelope,
        }))
    }

    pub fn marshal_key(&self, key: &K) -> Result<Bytes, CodecError> {
        self.key_marshaller.marshal(key).map(Bytes::from)
    }

    /// Keys are always decoded with the global loader.
    pub fn unmarshal_key(&self, key_bytes: &[u8]) -> Result<K, CodecError> {
        self.key_marshaller
            .unmarshal(key_bytes, &self.deployment.global_loader())
    }

    /// Envelope for an object value, marshalled with no loader attached.
    pub fn envelope_for(&self, key_bytes: &[u8], value: &V, version: CacheVersion) -> Result<EntryEnvelope, CodecError> {
        let value_bytes = self.value_marshaller.marshal(value)?;
        Ok(EntryEnvelope::object(key_hash(key_bytes), value_bytes, version))
    }

    /// Loader owning the envelope's value.
    ///
    /// Uses the recorded value loader when present. Otherwise an object value
    /// is unmarshalled with the global loader and the marshaller is asked who
    /// owns it. Inline byte values have no owner.
    pub fn value_loader_of(&self, envelope: &EntryEnvelope) -> Result<Option<LoaderId>, CodecError> {
        if envelope.value_loader.is_some() {
            return Ok(envelope.value_loader);
        }
        if envelope.value_is_bytes {
            return Ok(None);
        }

        let value = self
            .value_marshaller
            .unmarshal(&envelope.value_bytes, &self.deployment.global_loader())?;
        Ok(self.value_marshaller.loader_of(&value))
    }

    pub fn global_loader(&self) -> Loader {
        self.deployment.global_loader()
    }
}
