use crate::configuration::{Capacity, ModelConfig, read_config};
use crate::error::Result;
use crate::layers::RunState;
use crate::memory::ExternalMemory;
use crate::weights::WeightMap;
use log::info;

mod llama2;

pub use llama2::Llama2Transformer;

/// Contains the main inference logic for the Transformer model.
pub trait Transformer {
    /// Runs the forward pass for `token` at position `pos` and returns the logits.
    ///
    /// `pos` must be below the configured sequence length, and positions must be visited
    /// in order within one generation run: position `pos` reads the cached keys and
    /// values of every earlier position.
    fn forward(&mut self, token: usize, pos: usize) -> &mut [f32];

    fn get_config(&self) -> &ModelConfig;
}

/// Builder pattern for creating transformer models over a loaded memory region
pub struct TransformerBuilder<'a> {
    memory: &'a ExternalMemory,
    capacity: Capacity,
    ctx_length: Option<usize>,
}

impl<'a> TransformerBuilder<'a> {
    pub fn new(memory: &'a ExternalMemory) -> Self {
        Self { memory, capacity: Capacity::default(), ctx_length: None }
    }

    pub fn with_capacity(mut self, capacity: Capacity) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_ctx_length(mut self, ctx_length: Option<usize>) -> Self {
        self.ctx_length = ctx_length;
        self
    }

    pub fn build(self) -> Result<Llama2Transformer<'a>> {
        let header = read_config(self.memory.bytes())?;
        info!(
            "Transformer: dim={} hidden={} layers={} heads={} kv_heads={} vocab={} seq_len={} shared_classifier={}",
            header.dim,
            header.hidden_dim,
            header.n_layers,
            header.n_heads,
            header.n_kv_heads,
            header.vocab_size,
            header.seq_len,
            header.shared_classifier
        );

        // Validates against the buffer bounds before anything is mapped or allocated
        let mut config = header;
        if let Some(ctx_len) = self.ctx_length {
            config.seq_len = ctx_len.clamp(1, config.seq_len);
        }
        let state = RunState::new(&config, &self.capacity)?;
        config.seq_len = state.seq_len;

        // The layout is described by the header, not by the capped runtime config
        let weights = WeightMap::new(self.memory.floats(), &header)?;

        Ok(Llama2Transformer::new(config, weights, state))
    }
}
