//! Llama2 inference under a static-memory discipline.
//!
//! Weights stay in a fixed external memory region and are read through borrowed views;
//! every working buffer is sized once from compile-time capacity bounds. The crate
//! provides the weight mapper, the forward pass, the BPE tokenizer and the samplers,
//! plus a generation loop that streams decoded text to a sink.

mod configuration;
mod error;
mod generation;
mod layers;
mod memory;
mod models;
mod sampler;
mod tokenizer;
mod weights;
pub mod writer;

use anyhow::{Context, Result};
use log::{debug, info};
use std::io;
use std::time::{SystemTime, UNIX_EPOCH};

pub use crate::configuration::{Capacity, HEADER_SIZE, ModelConfig, read_config};
pub use crate::error::InferenceError;
pub use crate::generation::{ConsoleSink, GenerationReport, PieceSink, generate};
pub use crate::layers::{RunState, softmax};
pub use crate::memory::{ExternalMemory, MappedBlob, PSRAM_WINDOW_SIZE};
pub use crate::models::{Llama2Transformer, Transformer, TransformerBuilder};
pub use crate::sampler::Sampler;
pub use crate::tokenizer::{BOS_TOKEN_ID, BYTE_FALLBACK_OFFSET, EOS_TOKEN_ID, MAX_TOKEN_LENGTH, Tokenizer, Vocabulary};
pub use crate::weights::{LayerWeights, WeightMap};

#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub model_path: String,
    pub tokenizer_path: String,
    pub temperature: f32,
    pub topp: f32,
    pub steps: usize,
    pub ctx_length: Option<usize>,
    pub prompt: Option<String>,
    pub region_size: usize,
    pub seed: u64,
}

impl InferenceConfig {
    pub fn builder() -> InferenceConfigBuilder {
        InferenceConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct InferenceConfigBuilder {
    model_path: Option<String>,
    tokenizer_path: Option<String>,
    temperature: Option<f32>,
    topp: Option<f32>,
    steps: Option<usize>,
    ctx_length: Option<usize>,
    prompt: Option<String>,
    region_size: Option<usize>,
    seed: Option<u64>,
}

impl InferenceConfigBuilder {
    pub fn model_path(mut self, path: Option<&String>) -> Self {
        self.model_path = path.cloned();
        self
    }
    pub fn tokenizer_path(mut self, path: Option<&String>) -> Self {
        self.tokenizer_path = path.cloned();
        self
    }
    pub fn temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }
    pub fn topp(mut self, topp: Option<f32>) -> Self {
        self.topp = topp;
        self
    }
    pub fn steps(mut self, steps: Option<usize>) -> Self {
        self.steps = steps;
        self
    }
    pub fn ctx_length(mut self, ctx_length: Option<usize>) -> Self {
        self.ctx_length = ctx_length;
        self
    }
    pub fn prompt(mut self, prompt: Option<&String>) -> Self {
        self.prompt = prompt.cloned();
        self
    }
    pub fn region_size(mut self, region_size: Option<usize>) -> Self {
        self.region_size = region_size;
        self
    }
    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }
    pub fn build(self) -> std::result::Result<InferenceConfig, String> {
        Ok(InferenceConfig {
            model_path: self.model_path.ok_or("model_path is required")?,
            tokenizer_path: self.tokenizer_path.ok_or("tokenizer_path is required")?,
            temperature: self.temperature.unwrap_or(1.0),
            topp: self.topp.unwrap_or(0.9),
            steps: self.steps.unwrap_or(256),
            ctx_length: self.ctx_length,
            prompt: self.prompt,
            region_size: self.region_size.unwrap_or(PSRAM_WINDOW_SIZE),
            seed: self.seed.unwrap_or_else(|| {
                SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default()
            }),
        })
    }
}

/// Copies the model blob into a fresh external memory region.
fn load_region(config: &InferenceConfig) -> Result<ExternalMemory> {
    let blob = MappedBlob::open(&config.model_path)
        .with_context(|| format!("Failed to open model: {}", config.model_path))?;

    let mut memory = ExternalMemory::new(config.region_size);
    memory.load(blob.as_bytes()).with_context(|| "Failed to load model into external memory")?;
    Ok(memory)
}

fn load_tokenizer(config: &InferenceConfig, model: &ModelConfig, capacity: &Capacity) -> Result<Tokenizer> {
    let blob = MappedBlob::open(&config.tokenizer_path)
        .with_context(|| format!("Failed to open tokenizer: {}", config.tokenizer_path))?;

    Tokenizer::load(blob.as_bytes(), model.vocab_size, capacity.vocab_size)
        .with_context(|| format!("Failed to load tokenizer: {}", config.tokenizer_path))
}

/// Runs inference, printing generated text to stdout.
pub fn run_inference(inference_config: InferenceConfig) -> Result<GenerationReport> {
    debug!("{inference_config:#?}");

    let capacity = Capacity::default();
    let memory = load_region(&inference_config)?;

    let mut transformer = TransformerBuilder::new(&memory)
        .with_capacity(capacity)
        .with_ctx_length(inference_config.ctx_length)
        .build()
        .with_context(|| "Failed to build transformer")?;

    debug!("{transformer:#?}");

    let model_config = *transformer.get_config();
    let tokenizer = load_tokenizer(&inference_config, &model_config, &capacity)?;

    debug!("{tokenizer:#?}");

    let mut sampler = Sampler::new(
        model_config.vocab_size,
        capacity.vocab_size,
        inference_config.temperature,
        inference_config.topp,
        inference_config.seed,
    )?;

    let mut sink = ConsoleSink::new(io::stdout().lock());
    let report = generate(
        &mut transformer,
        &tokenizer,
        &mut sampler,
        inference_config.prompt.as_deref(),
        inference_config.steps,
        &mut sink,
    )?;
    sink.emit(b"\n")?;

    Ok(report)
}

/// Loads the model and tokenizer and logs what was found, without generating.
pub fn inspect_model(inference_config: &InferenceConfig) -> Result<()> {
    let capacity = Capacity::default();
    let memory = load_region(inference_config)?;

    let header = read_config(memory.bytes()).with_context(|| "Failed to read model header")?;
    let expected = WeightMap::expected_size(&header)
        .map_or_else(|| "more than usize::MAX".to_string(), |size| size.to_string());
    info!("Model: {header:?}");
    info!(
        "Model: blob {} bytes, layout needs {} bytes, region capacity {} bytes",
        memory.loaded_len(),
        expected,
        memory.capacity()
    );

    match capacity.check(&header) {
        Ok(()) => info!("Model: fits capacity {capacity:?}"),
        Err(e) => info!("Model: does not fit: {e}"),
    }

    let tokenizer = load_tokenizer(inference_config, &header, &capacity)?;
    let vocab = tokenizer.vocab();
    info!(
        "Tokenizer: {} tokens, pool {} / {} bytes, max_token_length={}",
        vocab.len(),
        vocab.pool_used(),
        vocab.pool_capacity(),
        vocab.max_token_length()
    );

    Ok(())
}
