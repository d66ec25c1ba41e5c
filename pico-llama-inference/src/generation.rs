#[cfg(test)]
#[path = "../tests/unit/generation_test.rs"]
mod generation_test;

use crate::error::{InferenceError, Result};
use crate::models::Transformer;
use crate::sampler::Sampler;
use crate::tokenizer::{BOS_TOKEN_ID, Tokenizer};
use log::info;
use std::io::Write;
use std::time::{Duration, Instant};

/// Receives decoded fragments one at a time, in generation order.
pub trait PieceSink {
    fn emit(&mut self, piece: &[u8]) -> Result<()>;
}

/// Collects the raw fragments.
impl PieceSink for Vec<u8> {
    fn emit(&mut self, piece: &[u8]) -> Result<()> {
        self.extend_from_slice(piece);
        Ok(())
    }
}

/// Writes fragments to a terminal-like writer, flushing after each one.
///
/// Empty fragments and single bytes that are neither printable nor whitespace (raw bytes
/// from `<0xHH>` tokens such as control characters) are dropped.
#[derive(Debug)]
pub struct ConsoleSink<W: Write> {
    out: W,
}

impl<W: Write> ConsoleSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> PieceSink for ConsoleSink<W> {
    fn emit(&mut self, piece: &[u8]) -> Result<()> {
        match piece {
            [] => return Ok(()),
            [byte] if !(byte.is_ascii_graphic() || byte.is_ascii_whitespace() || *byte == 0x0b) => {
                return Ok(());
            }
            _ => {}
        }

        self.out.write_all(piece)?;
        self.out.flush()?;
        Ok(())
    }
}

/// Outcome of one generation run.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationReport {
    /// Tokens the prompt encoded to, BOS included.
    pub prompt_tokens: usize,
    /// Forward passes run.
    pub positions: usize,
    /// Tokens chosen by the sampler and emitted.
    pub generated: usize,
    /// Time spent from the first sampled position onward.
    pub elapsed: Duration,
    /// Generation ended because BOS was chosen.
    pub stopped_on_bos: bool,
}

impl GenerationReport {
    pub fn tokens_per_second(&self) -> Option<f64> {
        let secs = self.elapsed.as_secs_f64();
        (self.generated > 0 && secs > 0.0).then(|| self.generated as f64 / secs)
    }
}

/// Generates text for `prompt`, streaming each fragment to `sink`.
///
/// The prompt is encoded with BOS and replayed through the model; once it is consumed the
/// sampler picks every next token. Runs at most `steps` positions (`0`, or anything
/// above the model's sequence length, means the sequence length) and stops before emitting
/// a sampled BOS.
pub fn generate<T: Transformer>(
    transformer: &mut T,
    tokenizer: &Tokenizer,
    sampler: &mut Sampler,
    prompt: Option<&str>,
    steps: usize,
    sink: &mut impl PieceSink,
) -> Result<GenerationReport> {
    let prompt = prompt.unwrap_or("");
    let prompt_tokens = tokenizer.encode(Some(prompt), true, false)?;

    if prompt_tokens.is_empty() {
        return Err(InferenceError::EmptyInput("prompt encoded to no tokens"));
    }

    let vocab_size = transformer.get_config().vocab_size;
    if let Some(&token) = prompt_tokens.iter().find(|&&token| token >= vocab_size) {
        return Err(InferenceError::InvalidConfig(format!(
            "prompt token {token} is outside the model vocabulary of {vocab_size}"
        )));
    }

    info!("Prompt encoded to {} tokens", prompt_tokens.len());

    let seq_len = transformer.get_config().seq_len;
    let steps = if steps == 0 || steps > seq_len { seq_len } else { steps };

    let mut state = GenerationState::new(prompt_tokens[0]);
    let mut stopped_on_bos = false;

    while state.pos < steps {
        let replaying = state.pos + 1 < prompt_tokens.len();
        if !replaying {
            state.metrics.start_generation();
        }

        let logits = transformer.forward(state.token, state.pos);
        let next_token = if replaying { prompt_tokens[state.pos + 1] } else { sampler.sample(logits) };

        if next_token == BOS_TOKEN_ID {
            state.pos += 1;
            stopped_on_bos = true;
            break;
        }

        sink.emit(tokenizer.decode(state.token, next_token))?;
        if !replaying {
            state.metrics.increment_token();
        }
        state.advance(next_token);
    }

    let report = GenerationReport {
        prompt_tokens: prompt_tokens.len(),
        positions: state.pos,
        generated: state.metrics.generated_count,
        elapsed: state.metrics.elapsed(),
        stopped_on_bos,
    };

    if let Some(tps) = report.tokens_per_second() {
        info!(
            "[Generated {} tokens in {:.2}s - {:.2} tokens/sec]",
            report.generated,
            report.elapsed.as_secs_f64(),
            tps
        );
    }

    Ok(report)
}

/// Tracks token generation performance metrics
struct TokenMetrics {
    start_time: Option<Instant>,
    generated_count: usize,
}

impl TokenMetrics {
    fn new() -> Self {
        Self { start_time: None, generated_count: 0 }
    }

    fn start_generation(&mut self) {
        if self.start_time.is_none() {
            self.start_time = Some(Instant::now());
        }
    }

    fn increment_token(&mut self) {
        self.generated_count += 1;
    }

    fn elapsed(&self) -> Duration {
        self.start_time.map(|start| start.elapsed()).unwrap_or_default()
    }
}

/// Represents the current generation state
struct GenerationState {
    pos: usize,
    token: usize,
    metrics: TokenMetrics,
}

impl GenerationState {
    fn new(initial_token: usize) -> Self {
        Self { pos: 0, token: initial_token, metrics: TokenMetrics::new() }
    }

    fn advance(&mut self, next_token: usize) {
        self.token = next_token;
        self.pos += 1;
    }
}
