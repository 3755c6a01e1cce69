//! Error types shared across the store.

use thiserror::Error;

use crate::config::ConfigError;
use crate::engine::EngineError;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Envelope encoding failed: {0}")]
    Encode(#[source] bincode::Error),

    #[error("Envelope decoding failed: {0}")]
    Decode(#[source] bincode::Error),

    #[error("Marshalling failed: {0}")]
    Marshal(String),

    #[error("Unmarshalling failed: {0}")]
    Unmarshal(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Tier engine failure: {0}")]
    Engine(#[from] EngineError),

    #[error("Serialization failure: {0}")]
    Codec(#[from] CodecError),

    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("Illegal state: {0}")]
    IllegalState(&'static str),
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
