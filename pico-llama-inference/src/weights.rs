#[cfg(test)]
#[path = "../tests/unit/weights_test.rs"]
mod weights_test;

use crate::configuration::{HEADER_WORDS, ModelConfig};
use crate::error::{InferenceError, Result};

/// Non-owning views of every tensor in a llama2 weight blob.
///
/// Tensors follow the header in a fixed order; per-layer tensors are stored contiguously
/// for all layers (`[n_layers, ...]`). Nothing is copied: each field borrows the blob.
#[derive(Clone, Copy)]
pub struct WeightMap<'a> {
    /// `[vocab_size, dim]`
    pub token_embedding_table: &'a [f32],
    /// `[n_layers, dim]`
    pub rms_att_weight: &'a [f32],
    /// `[n_layers, dim, dim]`
    pub wq: &'a [f32],
    /// `[n_layers, kv_dim, dim]`
    pub wk: &'a [f32],
    /// `[n_layers, kv_dim, dim]`
    pub wv: &'a [f32],
    /// `[n_layers, dim, dim]`
    pub wo: &'a [f32],
    /// `[n_layers, dim]`
    pub rms_ffn_weight: &'a [f32],
    /// `[n_layers, hidden_dim, dim]`
    pub w1: &'a [f32],
    /// `[n_layers, dim, hidden_dim]`
    pub w2: &'a [f32],
    /// `[n_layers, hidden_dim, dim]`
    pub w3: &'a [f32],
    /// `[dim]`
    pub rms_final_weight: &'a [f32],
    /// `[vocab_size, dim]`, aliases `token_embedding_table` when the classifier is shared.
    pub wcls: &'a [f32],
}

/// Views of the tensors belonging to one layer.
#[derive(Debug, Clone, Copy)]
pub struct LayerWeights<'a> {
    pub rms_att_weight: &'a [f32],
    pub wq: &'a [f32],
    pub wk: &'a [f32],
    pub wv: &'a [f32],
    pub wo: &'a [f32],
    pub rms_ffn_weight: &'a [f32],
    pub w1: &'a [f32],
    pub w2: &'a [f32],
    pub w3: &'a [f32],
}

impl<'a> WeightMap<'a> {
    /// Maps tensor views over `blob`, which starts with the header.
    ///
    /// `config` must be the header as stored: its `seq_len` locates the two positional
    /// tables that precede a dedicated classifier, so pass it before any capping.
    pub fn new(blob: &'a [f32], config: &ModelConfig) -> Result<Self> {
        let ModelConfig { dim, hidden_dim, n_layers, vocab_size, seq_len, .. } = *config;
        let kv_dim = config.kv_dim();
        let head_size = config.head_size();

        if blob.len() < HEADER_WORDS {
            return Err(truncated("header", HEADER_WORDS, blob.len()));
        }
        let mut tensors = TensorCursor { blob, offset: HEADER_WORDS };

        let token_embedding_table = tensors.take(vocab_size * dim, "token_embedding_table")?;
        let rms_att_weight = tensors.take(n_layers * dim, "rms_att_weight")?;
        let wq = tensors.take(n_layers * dim * dim, "wq")?;
        let wk = tensors.take(n_layers * dim * kv_dim, "wk")?;
        let wv = tensors.take(n_layers * dim * kv_dim, "wv")?;
        let wo = tensors.take(n_layers * dim * dim, "wo")?;
        let rms_ffn_weight = tensors.take(n_layers * dim, "rms_ffn_weight")?;
        let w1 = tensors.take(n_layers * dim * hidden_dim, "w1")?;
        let w2 = tensors.take(n_layers * hidden_dim * dim, "w2")?;
        let w3 = tensors.take(n_layers * dim * hidden_dim, "w3")?;
        let rms_final_weight = tensors.take(dim, "rms_final_weight")?;

        // RoPE is computed analytically, the stored tables are never read.
        tensors.take(seq_len * head_size / 2, "freq_cis_real")?;
        tensors.take(seq_len * head_size / 2, "freq_cis_imag")?;

        let wcls = if config.shared_classifier {
            token_embedding_table
        } else {
            tensors.take(vocab_size * dim, "wcls")?
        };

        Ok(Self {
            token_embedding_table,
            rms_att_weight,
            wq,
            wk,
            wv,
            wo,
            rms_ffn_weight,
            w1,
            w2,
            w3,
            rms_final_weight,
            wcls,
        })
    }

    /// Size in bytes a blob must have to hold every tensor of `config`.
    ///
    /// `None` when the size does not fit in `usize`, which only an unchecked header can
    /// produce.
    pub fn expected_size(config: &ModelConfig) -> Option<usize> {
        let ModelConfig { dim, hidden_dim, n_layers, vocab_size, seq_len, .. } = *config;
        let kv_dim = config.kv_dim();

        let embedding = vocab_size.checked_mul(dim)?;
        let per_layer = dim
            .checked_mul(2)?
            .checked_add(dim.checked_mul(dim)?.checked_mul(2)?)?
            .checked_add(dim.checked_mul(kv_dim)?.checked_mul(2)?)?
            .checked_add(dim.checked_mul(hidden_dim)?.checked_mul(3)?)?;
        let classifier = if config.shared_classifier { 0 } else { embedding };

        HEADER_WORDS
            .checked_add(embedding)?
            .checked_add(n_layers.checked_mul(per_layer)?)?
            .checked_add(dim)?
            .checked_add(seq_len.checked_mul(config.head_size())?)?
            .checked_add(classifier)?
            .checked_mul(size_of::<f32>())
    }

    /// Slices out the tensors of layer `layer`.
    pub fn layer(&self, layer: usize, config: &ModelConfig) -> LayerWeights<'a> {
        let ModelConfig { dim, hidden_dim, .. } = *config;
        let kv_dim = config.kv_dim();

        fn nth(tensor: &[f32], index: usize, size: usize) -> &[f32] {
            &tensor[index * size..(index + 1) * size]
        }

        LayerWeights {
            rms_att_weight: nth(self.rms_att_weight, layer, dim),
            wq: nth(self.wq, layer, dim * dim),
            wk: nth(self.wk, layer, dim * kv_dim),
            wv: nth(self.wv, layer, dim * kv_dim),
            wo: nth(self.wo, layer, dim * dim),
            rms_ffn_weight: nth(self.rms_ffn_weight, layer, dim),
            w1: nth(self.w1, layer, dim * hidden_dim),
            w2: nth(self.w2, layer, hidden_dim * dim),
            w3: nth(self.w3, layer, dim * hidden_dim),
        }
    }
}

impl std::fmt::Debug for WeightMap<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeightMap")
            .field("token_embedding_table", &self.token_embedding_table.len())
            .field("rms_att_weight", &self.rms_att_weight.len())
            .field("wq", &self.wq.len())
            .field("wk", &self.wk.len())
            .field("wv", &self.wv.len())
            .field("wo", &self.wo.len())
            .field("rms_ffn_weight", &self.rms_ffn_weight.len())
            .field("w1", &self.w1.len())
            .field("w2", &self.w2.len())
            .field("w3", &self.w3.len())
            .field("rms_final_weight", &self.rms_final_weight.len())
            .field("shared_classifier", &std::ptr::eq(self.wcls, self.token_embedding_table))
            .finish()
    }
}

struct TensorCursor<'a> {
    blob: &'a [f32],
    offset: usize,
}

impl<'a> TensorCursor<'a> {
    fn take(&mut self, count: usize, name: &str) -> Result<&'a [f32]> {
        let available = self.blob.len() - self.offset;
        if count > available {
            return Err(truncated(name, count, available));
        }

        let tensor = &self.blob[self.offset..self.offset + count];
        self.offset += count;
        Ok(tensor)
    }
}

fn truncated(name: &str, needed_words: usize, available_words: usize) -> InferenceError {
    InferenceError::Truncated {
        what: format!("tensor {name}"),
        needed: needed_words * size_of::<f32>(),
        available: available_words * size_of::<f32>(),
    }
}
