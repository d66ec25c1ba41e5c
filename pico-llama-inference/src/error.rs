//! Error types for pico-llama inference.
//!
//! Every variant is raised while building a component (header parsing, weight mapping,
//! buffer sizing, vocabulary loading) or when handed unusable input. The steady-state
//! forward/encode/sample routines have no error path.

use thiserror::Error;

/// Result type alias for inference operations.
pub type Result<T> = std::result::Result<T, InferenceError>;

/// Errors that can occur while preparing or driving inference.
#[derive(Error, Debug)]
pub enum InferenceError {
    /// A model dimension does not fit the statically sized buffers.
    #[error("{field} = {value} exceeds compiled capacity {max}")]
    CapacityExceeded { field: &'static str, value: usize, max: usize },

    /// A blob holds fewer bytes than a field declares.
    #[error("blob truncated while reading {what}: need {needed} bytes, have {available}")]
    Truncated { what: String, needed: usize, available: usize },

    /// The vocabulary string pool cannot hold another token.
    #[error("vocabulary pool exhausted: need {needed} bytes, capacity {capacity}")]
    PoolExhausted { needed: usize, capacity: usize },

    /// No text to encode, or a prompt that produced no tokens.
    #[error("empty input: {0}")]
    EmptyInput(&'static str),

    /// Header or parameter values that are inconsistent rather than too large.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The external memory region cannot hold the model blob.
    #[error("external memory region too small: need {needed} bytes, have {capacity}")]
    RegionTooSmall { needed: usize, capacity: usize },

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
