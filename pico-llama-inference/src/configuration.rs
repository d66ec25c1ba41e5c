#[cfg(test)]
#[path = "../tests/unit/configuration_test.rs"]
mod configuration_test;

use crate::error::{InferenceError, Result};
use crate::memory::BlobCursor;

/// Size of the weight-blob header in bytes (7 i32 fields).
pub const HEADER_SIZE: usize = 28;
/// Size of the weight-blob header in 32-bit words.
pub const HEADER_WORDS: usize = HEADER_SIZE / size_of::<i32>();

/// Configuration struct for transformer models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelConfig {
    pub dim: usize,
    pub hidden_dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub vocab_size: usize,
    pub seq_len: usize,
    /// Classifier reuses the token embedding table (positive vocab size in the header).
    pub shared_classifier: bool,
}

impl ModelConfig {
    pub fn head_size(&self) -> usize {
        self.dim / self.n_heads
    }

    pub fn kv_dim(&self) -> usize {
        self.head_size() * self.n_kv_heads
    }

    /// Number of query heads sharing one key/value head.
    pub fn kv_mul(&self) -> usize {
        self.n_heads / self.n_kv_heads
    }
}

/// Header exactly as stored at the start of the weight blob.
#[derive(Debug, Clone, Copy)]
struct Config {
    pub dim: i32,
    pub hidden_dim: i32,
    pub n_layers: i32,
    pub n_heads: i32,
    pub n_kv_heads: i32,
    pub vocab_size: i32,
    pub seq_len: i32,
}

impl TryInto<ModelConfig> for Config {
    type Error = InferenceError;

    fn try_into(self) -> Result<ModelConfig> {
        validate_config(&self)?;

        Ok(ModelConfig {
            dim: self.dim as usize,
            hidden_dim: self.hidden_dim as usize,
            n_layers: self.n_layers as usize,
            n_heads: self.n_heads as usize,
            n_kv_heads: self.n_kv_heads as usize,
            vocab_size: self.vocab_size.unsigned_abs() as usize,
            seq_len: self.seq_len as usize,
            shared_classifier: self.vocab_size > 0,
        })
    }
}

/// Reads and validates the model configuration from the start of a weight blob.
///
/// The header is 7 consecutive little-endian i32 values. A negative vocabulary size
/// flags a dedicated classifier tensor; its absolute value is the real size.
pub fn read_config(blob: &[u8]) -> Result<ModelConfig> {
    let mut cursor = BlobCursor::new(blob);

    macro_rules! read_i32 {
        ($field:literal) => {
            cursor.read_i32(|| format!("header field {}", $field))?
        };
    }

    let config = Config {
        dim: read_i32!("dim"),
        hidden_dim: read_i32!("hidden_dim"),
        n_layers: read_i32!("n_layers"),
        n_heads: read_i32!("n_heads"),
        n_kv_heads: read_i32!("n_kv_heads"),
        vocab_size: read_i32!("vocab_size"),
        seq_len: read_i32!("seq_len"),
    };

    config.try_into()
}

/// Validates the header to ensure the dimensions describe a usable model.
fn validate_config(config: &Config) -> Result<()> {
    let dimensions = [
        ("dim", config.dim),
        ("hidden_dim", config.hidden_dim),
        ("n_layers", config.n_layers),
        ("n_heads", config.n_heads),
        ("n_kv_heads", config.n_kv_heads),
        ("seq_len", config.seq_len),
    ];

    for (name, value) in dimensions {
        if value <= 0 {
            return Err(InferenceError::InvalidConfig(format!("{name} must be positive, got {value}")));
        }
    }

    if config.vocab_size == 0 || config.vocab_size == i32::MIN {
        return Err(InferenceError::InvalidConfig(format!("invalid vocab_size {}", config.vocab_size)));
    }

    if config.n_heads % config.n_kv_heads != 0 {
        return Err(InferenceError::InvalidConfig(format!(
            "n_heads {} is not a multiple of n_kv_heads {}",
            config.n_heads, config.n_kv_heads
        )));
    }

    if config.dim % config.n_heads != 0 || (config.dim / config.n_heads) % 2 != 0 {
        return Err(InferenceError::InvalidConfig(format!(
            "dim {} must split into {} heads of even size",
            config.dim, config.n_heads
        )));
    }

    Ok(())
}

/// Upper bounds every statically sized buffer is compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    pub dim: usize,
    pub hidden_dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub vocab_size: usize,
    pub seq_len: usize,
}

impl Capacity {
    /// Sized for the stories260K checkpoint, fitting the run state into 520 KB of SRAM.
    pub const STORIES_260K: Capacity = Capacity {
        dim: 64,
        hidden_dim: 172,
        n_layers: 5,
        n_heads: 8,
        n_kv_heads: 4,
        vocab_size: 512,
        seq_len: 256,
    };

    pub const fn kv_dim(&self) -> usize {
        self.dim * self.n_kv_heads / self.n_heads
    }

    /// Fails with the first dimension of `config` that exceeds its bound.
    ///
    /// The sequence length is not checked: it is capped instead (see [`Capacity::cap_seq_len`]).
    pub fn check(&self, config: &ModelConfig) -> Result<()> {
        let bounds = [
            ("dim", config.dim, self.dim),
            ("hidden_dim", config.hidden_dim, self.hidden_dim),
            ("n_layers", config.n_layers, self.n_layers),
            ("n_heads", config.n_heads, self.n_heads),
            ("n_kv_heads", config.n_kv_heads, self.n_kv_heads),
            ("vocab_size", config.vocab_size, self.vocab_size),
            ("kv_dim", config.kv_dim(), self.kv_dim()),
        ];

        for (field, value, max) in bounds {
            if value > max {
                return Err(InferenceError::CapacityExceeded { field, value, max });
            }
        }

        Ok(())
    }

    pub fn cap_seq_len(&self, seq_len: usize) -> usize {
        seq_len.min(self.seq_len)
    }
}

impl Default for Capacity {
    fn default() -> Self {
        Self::STORIES_260K
    }
}
