#[cfg(test)]
#[path = "../tests/unit/sampler_test.rs"]
mod sampler_test;

use crate::error::{InferenceError, Result};
use crate::layers::softmax;
use log::warn;

/// Xorshift stays at zero forever, so a zero seed is replaced by this one.
pub const ZERO_SEED_REPLACEMENT: u64 = 0x9E37_79B9_7F4A_7C15;

/// Stores a probability and its associated index (token id).
#[derive(Clone, Copy, Debug, Default)]
pub struct ProbIndex {
    pub prob: f32,
    pub index: usize,
}

/// Top-p/temperature sampler for language model logits.
///
/// This struct implements greedy decoding, temperature scaling, top-p (nucleus) sampling,
/// and multinomial sampling, using a simple xorshift RNG for reproducibility.
#[derive(Debug)]
pub struct Sampler {
    /// Order-statistics scratch, sized once to the vocabulary capacity.
    probindex: Box<[ProbIndex]>,
    vocab_size: usize,
    pub temperature: f32,
    pub topp: f32,
    pub rng_state: u64,
}

impl Sampler {
    /// Creates a new sampler.
    ///
    /// # Arguments
    /// * `vocab_size` - Size of the vocabulary the logits cover
    /// * `max_vocab` - Capacity of the scratch buffer, at least `vocab_size`
    /// * `temperature` - Temperature for sampling (0.0 for greedy)
    /// * `topp` - Top-p threshold; values outside (0, 1) sample from the full distribution
    /// * `rng_seed` - Random seed for reproducibility; 0 becomes [`ZERO_SEED_REPLACEMENT`]
    pub fn new(vocab_size: usize, max_vocab: usize, temperature: f32, topp: f32, rng_seed: u64) -> Result<Self> {
        if vocab_size == 0 {
            return Err(InferenceError::InvalidConfig("vocab_size must be positive".to_string()));
        }
        if vocab_size > max_vocab {
            return Err(InferenceError::CapacityExceeded { field: "vocab_size", value: vocab_size, max: max_vocab });
        }
        if !(temperature >= 0.0) || !temperature.is_finite() {
            return Err(InferenceError::InvalidConfig(format!("temperature must be non-negative, got {temperature}")));
        }
        if topp.is_nan() {
            return Err(InferenceError::InvalidConfig("top-p must be a number".to_string()));
        }

        let rng_state = if rng_seed == 0 {
            warn!("Sampler: seed 0 would freeze the generator, using {ZERO_SEED_REPLACEMENT:#x}");
            ZERO_SEED_REPLACEMENT
        } else {
            rng_seed
        };

        Ok(Self {
            probindex: vec![ProbIndex::default(); max_vocab].into_boxed_slice(),
            vocab_size,
            temperature,
            topp,
            rng_state,
        })
    }

    /// Xorshift-based random number generator.
    fn random_u32(&mut self) -> u32 {
        self.rng_state ^= self.rng_state >> 12;
        self.rng_state ^= self.rng_state << 25;
        self.rng_state ^= self.rng_state >> 27;
        (self.rng_state.wrapping_mul(0x2545F4914F6CDD1D) >> 32) as u32
    }

    /// Returns a random float in [0, 1).
    fn random_f32(&mut self) -> f32 {
        (self.random_u32() >> 8) as f32 / 16777216.0
    }

    /// Returns the index of the maximum logit, the first one on ties (greedy decoding).
    fn sample_argmax(logits: &[f32]) -> usize {
        let mut max_i = 0;
        for (i, &logit) in logits.iter().enumerate().skip(1) {
            if logit > logits[max_i] {
                max_i = i;
            }
        }
        max_i
    }

    /// Multinomial sampling from a probability distribution.
    fn sample_mult(probabilities: &[f32], coin: f32) -> usize {
        let mut cdf = 0.0;
        for (i, &prob) in probabilities.iter().enumerate() {
            cdf += prob;
            if coin < cdf {
                return i;
            }
        }
        probabilities.len().saturating_sub(1)
    }

    /// Top-p (nucleus) sampling: sample from the smallest set of tokens whose cumulative probability exceeds `topp`.
    fn sample_topp(&mut self, probabilities: &[f32], coin: f32) -> usize {
        // Tokens below the cutoff cannot be part of the nucleus, skip them before sorting
        let n = probabilities.len();
        let cutoff = if n > 1 { (1.0 - self.topp) / (n - 1) as f32 } else { 0.0 };
        let mut n0 = self.collect_candidates(probabilities, cutoff);
        if n0 == 0 {
            // A flat distribution with a small top-p can leave every token below the cutoff
            n0 = self.collect_candidates(probabilities, 0.0);
            if n0 == 0 {
                return Self::sample_mult(probabilities, coin);
            }
        }

        let candidates = &mut self.probindex[..n0];
        candidates.sort_by(|a, b| b.prob.total_cmp(&a.prob));

        // Find truncation point
        let mut cumulative_prob = 0.0;
        let mut last_idx = n0.saturating_sub(1);
        for (i, candidate) in candidates.iter().enumerate() {
            cumulative_prob += candidate.prob;
            if cumulative_prob > self.topp {
                last_idx = i;
                break;
            }
        }

        // Sample from truncated list
        let r = coin * cumulative_prob;
        let mut cdf = 0.0;
        for candidate in &candidates[..=last_idx] {
            cdf += candidate.prob;
            if r < cdf {
                return candidate.index;
            }
        }
        candidates[last_idx].index
    }

    fn collect_candidates(&mut self, probabilities: &[f32], cutoff: f32) -> usize {
        let mut n0 = 0;
        for (i, &prob) in probabilities.iter().enumerate() {
            if prob >= cutoff {
                self.probindex[n0] = ProbIndex { prob, index: i };
                n0 += 1;
            }
        }
        n0
    }

    /// Samples a token index from logits using temperature and top-p.
    ///
    /// - If temperature is 0, returns the argmax (greedy) and leaves the RNG untouched.
    /// - Otherwise, scales and softmaxes `logits` in place, then draws once from the RNG.
    pub fn sample(&mut self, logits: &mut [f32]) -> usize {
        let logits = &mut logits[..self.vocab_size];

        if self.temperature == 0.0 {
            Self::sample_argmax(logits)
        } else {
            for logit in logits.iter_mut() {
                *logit /= self.temperature;
            }

            softmax(logits);

            let coin = self.random_f32();

            if self.topp <= 0.0 || self.topp >= 1.0 {
                Self::sample_mult(logits, coin)
            } else {
                self.sample_topp(logits, coin)
            }
        }
    }
}
