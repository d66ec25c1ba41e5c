#[cfg(test)]
#[path = "../../tests/unit/llama2_test.rs"]
mod llama2_test;

use super::Transformer;
use crate::configuration::ModelConfig;
use crate::layers::*;
use crate::weights::WeightMap;

/// Llama2 decoder-only transformer over weights borrowed from external memory.
///
/// **Process Flow:**
/// 1. **Token Embedding**: Copy the token's row of the embedding table into the activation
/// 2. **Transformer Blocks**: Pre-norm attention and SwiGLU feed-forward, each with a residual
/// 3. **Final Normalization**: RMSNorm over the activation
/// 4. **Classification Head**: Project to vocabulary logits
pub struct Llama2Transformer<'a> {
    config: ModelConfig,
    token_embedding: TokenEmbedding<'a>,
    blocks: Vec<TransformerBlock<'a>>,
    final_norm: RMSNorm<'a>,
    lm_head: Linear<'a>,
    state: RunState,
}

impl<'a> Llama2Transformer<'a> {
    /// `config` is the runtime configuration, its `seq_len` matching `state`.
    pub(crate) fn new(config: ModelConfig, weights: WeightMap<'a>, state: RunState) -> Self {
        debug_assert_eq!(config.seq_len, state.seq_len);

        let blocks = (0..config.n_layers)
            .map(|layer_idx| TransformerBlock::new(&config, layer_idx, &weights))
            .collect();

        Self {
            config,
            token_embedding: TokenEmbedding::new(weights.token_embedding_table, config.dim),
            blocks,
            final_norm: RMSNorm::new(weights.rms_final_weight),
            lm_head: Linear::new(weights.wcls, config.dim, config.vocab_size),
            state,
        }
    }

    /// Mutable access to the key/value caches, `[n_layers, seq_len, kv_dim]` each.
    #[cfg(test)]
    pub(crate) fn kv_caches_mut(&mut self) -> (&mut [f32], &mut [f32]) {
        (&mut self.state.key_cache[..], &mut self.state.value_cache[..])
    }
}

impl Transformer for Llama2Transformer<'_> {
    fn forward(&mut self, token: usize, pos: usize) -> &mut [f32] {
        debug_assert!(pos < self.config.seq_len, "position {pos} out of range for seq_len {}", self.config.seq_len);

        let dim = self.config.dim;
        self.token_embedding.forward(token, &mut self.state.x);

        for block in &self.blocks {
            block.forward(pos, &mut self.state);
        }

        self.final_norm.forward_inplace(&mut self.state.x[..dim]);

        let vocab_size = self.config.vocab_size;
        self.lm_head.forward(&mut self.state.logits[..vocab_size], &self.state.x[..dim]);

        &mut self.state.logits[..vocab_size]
    }

    fn get_config(&self) -> &ModelConfig {
        &self.config
    }
}

impl std::fmt::Debug for Llama2Transformer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        struct BlocksSummary<'a, T>(&'a [T]);

        impl<T: std::fmt::Debug> std::fmt::Debug for BlocksSummary<'_, T> {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_list()
                    .entries(self.0.iter().take(1))
                    .entry(&format_args!("... and {} more", self.0.len().saturating_sub(1)))
                    .finish()
            }
        }

        f.debug_struct("Llama2Transformer")
            .field("config", &self.config)
            .field("token_embedding", &self.token_embedding)
            .field("blocks", &BlocksSummary(&self.blocks))
            .field("final_norm", &self.final_norm)
            .field("lm_head", &self.lm_head)
            .field("state", &self.state)
            .finish()
    }
}

/// Transformer Block - decoder layer combining self-attention and feed-forward
pub struct TransformerBlock<'a> {
    pub attn_norm: RMSNorm<'a>,
    pub attention: MultiHeadAttention<'a>,
    pub ffn_norm: RMSNorm<'a>,
    pub feed_forward: FeedForward<'a>,
    pub layer_idx: usize,
}

impl<'a> TransformerBlock<'a> {
    fn new(config: &ModelConfig, layer_idx: usize, weights: &WeightMap<'a>) -> Self {
        let ModelConfig { dim, hidden_dim, .. } = *config;
        let kv_dim = config.kv_dim();
        let layer = weights.layer(layer_idx, config);

        let attention = MultiHeadAttention::new(
            Linear::new(layer.wq, dim, dim),
            Linear::new(layer.wk, dim, kv_dim),
            Linear::new(layer.wv, dim, kv_dim),
            Linear::new(layer.wo, dim, dim),
            config,
        );

        let feed_forward = FeedForward::new(
            Linear::new(layer.w1, dim, hidden_dim),
            Linear::new(layer.w2, hidden_dim, dim),
            Linear::new(layer.w3, dim, hidden_dim),
        );

        Self {
            attn_norm: RMSNorm::new(layer.rms_att_weight),
            attention,
            ffn_norm: RMSNorm::new(layer.rms_ffn_weight),
            feed_forward,
            layer_idx,
        }
    }

    fn forward(&self, pos: usize, state: &mut RunState) {
        let dim = self.attention.dim;

        // Attention block with residual connection
        self.attn_norm.forward(&mut state.xb[..dim], &state.x[..dim]);
        self.attention.forward(pos, self.layer_idx, state);
        state.x[..dim].iter_mut().zip(&state.xb2[..dim]).for_each(|(x_val, &delta)| *x_val += delta);

        // Feed-forward block with residual connection
        self.ffn_norm.forward(&mut state.xb[..dim], &state.x[..dim]);
        self.feed_forward.forward(state);
        state.x[..dim].iter_mut().zip(&state.xb[..dim]).for_each(|(x_val, &delta)| *x_val += delta);
    }
}

impl std::fmt::Debug for TransformerBlock<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformerBlock")
            .field("layer_idx", &self.layer_idx)
            .field("attn_norm", &self.attn_norm)
            .field("attention", &self.attention)
            .field("ffn_norm", &self.ffn_norm)
            .field("feed_forward", &self.feed_forward)
            .finish()
    }
}
