#[cfg(test)]
#[path = "../tests/unit/layers_test.rs"]
mod layers_test;

use crate::configuration::{Capacity, ModelConfig};
use crate::error::Result;
use log::info;

/// Epsilon value for numerical stability in normalization
const EPSILON: f32 = 1e-5;

/// Base frequency for RoPE (Rotary Position Embedding)
const ROPE_THETA: f32 = 10000.0;

/// Token embedding layer - converts token IDs to dense vectors
///
/// **Shape**: [vocab_size, dim]
/// **Note**: Often shared with the classifier weights (weight tying)
pub struct TokenEmbedding<'a> {
    pub embedding_table: &'a [f32],
    pub dim: usize,
}

impl<'a> TokenEmbedding<'a> {
    pub fn new(embedding_table: &'a [f32], dim: usize) -> Self {
        Self { embedding_table, dim }
    }

    pub fn forward(&self, token: usize, output: &mut [f32]) {
        let start_idx = token * self.dim;
        output[..self.dim].copy_from_slice(&self.embedding_table[start_idx..start_idx + self.dim]);
    }
}

impl std::fmt::Debug for TokenEmbedding<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenEmbedding")
            .field("dim", &self.dim)
            .field("vocab_size", &(self.embedding_table.len() / self.dim))
            .finish()
    }
}

/// RMS Layer Normalization
///
/// **Mathematical Formula**:
/// ```text
/// RMSNorm(x) = x / RMS(x) * γ
/// where RMS(x) = sqrt(mean(x²) + ε)
/// ```
pub struct RMSNorm<'a> {
    pub weight: &'a [f32],
}

impl<'a> RMSNorm<'a> {
    pub fn new(weight: &'a [f32]) -> Self {
        Self { weight }
    }

    pub fn forward(&self, output: &mut [f32], input: &[f32]) {
        debug_assert_eq!(output.len(), input.len());
        debug_assert_eq!(input.len(), self.weight.len());

        let scale = rms_scale(input);
        output.iter_mut().zip(input.iter()).zip(self.weight.iter()).for_each(|((out, &inp), &w)| {
            *out = w * (scale * inp);
        });
    }

    pub fn forward_inplace(&self, x: &mut [f32]) {
        debug_assert_eq!(x.len(), self.weight.len());

        let scale = rms_scale(x);
        x.iter_mut().zip(self.weight.iter()).for_each(|(val, &w)| {
            *val = w * (scale * *val);
        });
    }
}

impl std::fmt::Debug for RMSNorm<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RMSNorm").field("dim", &self.weight.len()).finish()
    }
}

/// Reciprocal root-mean-square of `x`.
fn rms_scale(x: &[f32]) -> f32 {
    let sum_of_squares = x.iter().map(|&v| v * v).sum::<f32>();
    1.0f32 / ((sum_of_squares / x.len() as f32) + EPSILON).sqrt()
}

/// Rotary Position Embedding (RoPE)
///
/// Rotates each adjacent coordinate pair `(i, i + 1)` of a head by
/// `pos * theta^(-(i mod head_size) / head_size)`. Angles are computed on the fly,
/// no frequency table is kept.
#[derive(Debug)]
pub struct RoPE {
    pub head_size: usize,
}

impl RoPE {
    pub fn new(head_size: usize) -> Self {
        Self { head_size }
    }

    /// Rotates the query, and the key where the pair falls inside the key/value dimension.
    pub fn apply(&self, pos: usize, q: &mut [f32], k: &mut [f32]) {
        for i in (0..q.len()).step_by(2) {
            let head_dim = i % self.head_size;
            let freq = 1.0f32 / ROPE_THETA.powf(head_dim as f32 / self.head_size as f32);
            let angle = pos as f32 * freq;
            let (sin, cos) = angle.sin_cos();

            rotate(&mut q[i..i + 2], cos, sin);
            if i < k.len() {
                rotate(&mut k[i..i + 2], cos, sin);
            }
        }
    }
}

#[inline]
fn rotate(pair: &mut [f32], cos: f32, sin: f32) {
    let (v0, v1) = (pair[0], pair[1]);
    pair[0] = v0 * cos - v1 * sin;
    pair[1] = v0 * sin + v1 * cos;
}

/// Dense matrix-vector product: `xout[i] = sum_j w[i * n + j] * x[j]` for `i < d`.
pub fn matmul(xout: &mut [f32], x: &[f32], w: &[f32], n: usize, d: usize) {
    debug_assert!(xout.len() >= d, "Output slice length must be at least d: {} >= {}", xout.len(), d);
    debug_assert!(w.len() >= n * d, "Weight slice too small: {} < {}", w.len(), n * d);

    xout[..d].iter_mut().zip(w.chunks_exact(n)).for_each(|(out_val, row)| {
        *out_val = row.iter().zip(&x[..n]).map(|(&w, &x)| w * x).sum();
    });
}

/// Linear layer over a borrowed `[out_features, in_features]` weight matrix.
pub struct Linear<'a> {
    pub weight: &'a [f32],
    pub in_features: usize,
    pub out_features: usize,
}

impl<'a> Linear<'a> {
    pub fn new(weight: &'a [f32], in_features: usize, out_features: usize) -> Self {
        Self { weight, in_features, out_features }
    }

    pub fn forward(&self, output: &mut [f32], input: &[f32]) {
        matmul(output, input, self.weight, self.in_features, self.out_features);
    }
}

impl std::fmt::Debug for Linear<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Linear")
            .field("in_features", &self.in_features)
            .field("out_features", &self.out_features)
            .finish()
    }
}

/// Multi-Head Attention with Grouped Query Attention (GQA)
///
/// **Architecture Details**:
/// - **Standard MHA**: n_heads query heads, n_heads key heads, n_heads value heads
/// - **GQA**: n_heads query heads, n_kv_heads key/value heads (n_kv_heads < n_heads),
///   every `kv_mul` consecutive query heads read the same key/value head
///
/// **Attention Formula**:
/// ```text
/// Attention(Q,K,V) = softmax(QK^T / √d_k)V
/// ```
///
/// Keys and values of layer `l` at position `t` live at
/// `l * seq_len * kv_dim + t * kv_dim` in the caches; each slot is written once, on the
/// forward pass for position `t`, and only slots `0..=pos` are read.
pub struct MultiHeadAttention<'a> {
    pub wq: Linear<'a>,
    pub wk: Linear<'a>,
    pub wv: Linear<'a>,
    pub wo: Linear<'a>,
    pub rope: RoPE,
    pub dim: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub head_size: usize,
    pub kv_mul: usize,
}

impl<'a> MultiHeadAttention<'a> {
    pub fn new(wq: Linear<'a>, wk: Linear<'a>, wv: Linear<'a>, wo: Linear<'a>, config: &ModelConfig) -> Self {
        Self {
            wq,
            wk,
            wv,
            wo,
            rope: RoPE::new(config.head_size()),
            dim: config.dim,
            n_heads: config.n_heads,
            n_kv_heads: config.n_kv_heads,
            head_size: config.head_size(),
            kv_mul: config.kv_mul(),
        }
    }

    /// Reads the normalized input from `state.xb`, leaves the projected output in `state.xb2`.
    pub fn forward(&self, pos: usize, layer_idx: usize, state: &mut RunState) {
        let dim = self.dim;
        let kv_dim = self.n_kv_heads * self.head_size;
        let kv_cache_offset = layer_idx * state.seq_len * kv_dim;
        let slot = kv_cache_offset + pos * kv_dim..kv_cache_offset + (pos + 1) * kv_dim;

        // Q, K, V projections; K and V go straight into this position's cache slot
        self.wq.forward(&mut state.q[..dim], &state.xb[..dim]);
        self.wk.forward(&mut state.key_cache[slot.clone()], &state.xb[..dim]);
        self.wv.forward(&mut state.value_cache[slot.clone()], &state.xb[..dim]);

        self.rope.apply(pos, &mut state.q[..dim], &mut state.key_cache[slot]);

        self.compute_attention(pos, kv_cache_offset, state);

        self.wo.forward(&mut state.xb2[..dim], &state.xb[..dim]);
    }

    fn compute_attention(&self, pos: usize, kv_cache_offset: usize, state: &mut RunState) {
        let attention_scale = (self.head_size as f32).sqrt();
        let kv_dim = self.n_kv_heads * self.head_size;
        let seq_len = state.seq_len;
        let RunState { q, att, xb, key_cache, value_cache, .. } = state;

        for head_idx in 0..self.n_heads {
            let q_head = &q[head_idx * self.head_size..(head_idx + 1) * self.head_size];
            let kv_head_offset = (head_idx / self.kv_mul) * self.head_size;
            let att_head = &mut att[head_idx * seq_len..head_idx * seq_len + pos + 1];

            for (time_step, att_score) in att_head.iter_mut().enumerate() {
                let k_start = kv_cache_offset + time_step * kv_dim + kv_head_offset;
                let score = q_head
                    .iter()
                    .zip(&key_cache[k_start..k_start + self.head_size])
                    .map(|(&q, &k)| q * k)
                    .sum::<f32>();
                *att_score = score / attention_scale;
            }

            softmax(att_head);

            // Weighted sum of values
            let xb_head = &mut xb[head_idx * self.head_size..(head_idx + 1) * self.head_size];
            xb_head.fill(0.0);
            for (time_step, &attention_weight) in att_head.iter().enumerate() {
                let v_start = kv_cache_offset + time_step * kv_dim + kv_head_offset;
                xb_head
                    .iter_mut()
                    .zip(&value_cache[v_start..v_start + self.head_size])
                    .for_each(|(out, &value)| *out += attention_weight * value);
            }
        }
    }
}

impl std::fmt::Debug for MultiHeadAttention<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiHeadAttention")
            .field("n_heads", &self.n_heads)
            .field("n_kv_heads", &self.n_kv_heads)
            .field("head_size", &self.head_size)
            .field("wq", &self.wq)
            .field("wk", &self.wk)
            .field("wv", &self.wv)
            .field("wo", &self.wo)
            .finish()
    }
}

/// Feed-Forward Network with SwiGLU activation
///
/// - Formula: SwiGLU(x) = SiLU(W1·x) ⊙ (W3·x), followed by the W2 down projection
/// - Where SiLU(x) = x · sigmoid(x)
pub struct FeedForward<'a> {
    pub w1: Linear<'a>, // Gate projection
    pub w2: Linear<'a>, // Down projection
    pub w3: Linear<'a>, // Up projection
}

impl<'a> FeedForward<'a> {
    pub fn new(w1: Linear<'a>, w2: Linear<'a>, w3: Linear<'a>) -> Self {
        Self { w1, w2, w3 }
    }

    /// Reads the normalized input from `state.xb` and overwrites it with the output.
    pub fn forward(&self, state: &mut RunState) {
        let dim = self.w1.in_features;
        let hidden_dim = self.w1.out_features;

        self.w1.forward(&mut state.hb[..hidden_dim], &state.xb[..dim]);
        self.w3.forward(&mut state.hb2[..hidden_dim], &state.xb[..dim]);

        state.hb[..hidden_dim].iter_mut().zip(&state.hb2[..hidden_dim]).for_each(|(gate_val, &up_val)| {
            let silu = *gate_val * (1.0f32 + (-*gate_val).exp()).recip();
            *gate_val = silu * up_val;
        });

        self.w2.forward(&mut state.xb[..dim], &state.hb[..hidden_dim]);
    }
}

impl std::fmt::Debug for FeedForward<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedForward")
            .field("hidden_dim", &self.w1.out_features)
            .field("w1", &self.w1)
            .field("w2", &self.w2)
            .field("w3", &self.w3)
            .finish()
    }
}

/// Applies softmax normalization to a slice in-place.
pub fn softmax(x: &mut [f32]) {
    let max_val = x.iter().fold(f32::NEG_INFINITY, |acc, &val| acc.max(val));
    let sum = x
        .iter_mut()
        .map(|val| {
            *val = (*val - max_val).exp();
            *val
        })
        .sum::<f32>();
    x.iter_mut().for_each(|val| *val /= sum);
}

/// Runtime state for transformer inference.
///
/// Every buffer is allocated once at its [`Capacity`] size; a model only uses the
/// leading part that its configuration needs. The bounds are validated in
/// [`RunState::new`] and never rechecked on the hot path.
pub struct RunState {
    /// Activation at the current position.
    /// Shape: [dim]
    pub x: Box<[f32]>,

    /// Normalized input of the residual branches, and attention output per head.
    /// Shape: [dim]
    pub xb: Box<[f32]>,

    /// Output projection of the attention branch.
    /// Shape: [dim]
    pub xb2: Box<[f32]>,

    /// Gate buffer for the feed-forward network.
    /// Shape: [hidden_dim]
    pub hb: Box<[f32]>,

    /// Up-projection buffer for the feed-forward network.
    /// Shape: [hidden_dim]
    pub hb2: Box<[f32]>,

    /// Query for the current position.
    /// Shape: [dim]
    pub q: Box<[f32]>,

    /// Attention scores.
    /// Shape: [n_heads, seq_len]
    pub att: Box<[f32]>,

    /// Output logits over the vocabulary.
    /// Shape: [vocab_size]
    pub logits: Box<[f32]>,

    /// Keys: [n_layers, seq_len, kv_dim]
    pub key_cache: Box<[f32]>,
    /// Values: [n_layers, seq_len, kv_dim]
    pub value_cache: Box<[f32]>,

    /// Sequence length in effect, at most `Capacity::seq_len`.
    pub seq_len: usize,
}

impl RunState {
    /// Creates the zero-filled state after checking `config` against `capacity`.
    ///
    /// Nothing is allocated when a dimension exceeds its bound. A sequence length above
    /// the capacity is capped, not rejected.
    pub fn new(config: &ModelConfig, capacity: &Capacity) -> Result<Self> {
        capacity.check(config)?;

        let seq_len = capacity.cap_seq_len(config.seq_len);
        if seq_len < config.seq_len {
            info!("Capping seq_len from {} to {}", config.seq_len, seq_len);
        }

        let Capacity { dim, hidden_dim, n_layers, n_heads, vocab_size, seq_len: max_seq_len, .. } = *capacity;
        let cache_size = n_layers * max_seq_len * capacity.kv_dim();

        let zeros = |len: usize| vec![0.0f32; len].into_boxed_slice();

        Ok(Self {
            x: zeros(dim),
            xb: zeros(dim),
            xb2: zeros(dim),
            hb: zeros(hidden_dim),
            hb2: zeros(hidden_dim),
            q: zeros(dim),
            att: zeros(n_heads * max_seq_len),
            logits: zeros(vocab_size),
            key_cache: zeros(cache_size),
            value_cache: zeros(cache_size),
            seq_len,
        })
    }
}

impl std::fmt::Debug for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let floats = self.x.len()
            + self.xb.len()
            + self.xb2.len()
            + self.hb.len()
            + self.hb2.len()
            + self.q.len()
            + self.att.len()
            + self.logits.len()
            + self.key_cache.len()
            + self.value_cache.len();

        f.debug_struct("RunState")
            .field("seq_len", &self.seq_len)
            .field("bytes", &(floats * size_of::<f32>()))
            .finish()
    }
}
