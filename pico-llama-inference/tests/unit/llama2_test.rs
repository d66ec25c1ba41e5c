use super::*;
use crate::error::InferenceError;
use crate::memory::ExternalMemory;
use crate::models::TransformerBuilder;
use crate::writer::{write_header, write_tensor};

fn tiny_config() -> ModelConfig {
    ModelConfig {
        dim: 8,
        hidden_dim: 12,
        n_layers: 2,
        n_heads: 2,
        n_kv_heads: 1,
        vocab_size: 16,
        seq_len: 8,
        shared_classifier: true,
    }
}

// Deterministic values in [-0.5, 0.5)
fn pseudo_random(len: usize, seed: u32) -> Vec<f32> {
    let mut state = seed.wrapping_mul(2654435761).wrapping_add(1);
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            (state >> 8) as f32 / 16777216.0 - 0.5
        })
        .collect()
}

fn model_blob(config: &ModelConfig, classifier: Option<&[f32]>) -> Vec<u8> {
    let ModelConfig { dim, hidden_dim, n_layers, vocab_size, seq_len, .. } = *config;
    let kv_dim = config.kv_dim();

    let tensors = [
        pseudo_random(vocab_size * dim, 1),
        vec![1.0; n_layers * dim],
        pseudo_random(n_layers * dim * dim, 2),
        pseudo_random(n_layers * dim * kv_dim, 3),
        pseudo_random(n_layers * dim * kv_dim, 4),
        pseudo_random(n_layers * dim * dim, 5),
        vec![1.0; n_layers * dim],
        pseudo_random(n_layers * dim * hidden_dim, 6),
        pseudo_random(n_layers * hidden_dim * dim, 7),
        pseudo_random(n_layers * dim * hidden_dim, 8),
        vec![1.0; dim],
        // freq_cis_real and freq_cis_imag
        vec![0.0; seq_len * config.head_size()],
    ];

    let mut blob: Vec<u8> = Vec::new();
    write_header(&mut blob, config).unwrap();
    for tensor in &tensors {
        write_tensor(&mut blob, tensor).unwrap();
    }
    if let Some(wcls) = classifier {
        write_tensor(&mut blob, wcls).unwrap();
    }
    blob
}

fn load(blob: &[u8]) -> ExternalMemory {
    let mut memory = ExternalMemory::new(blob.len());
    memory.load(blob).unwrap();
    memory
}

#[test]
fn test_forward_returns_finite_logits_over_vocabulary() {
    let config = tiny_config();
    let memory = load(&model_blob(&config, None));
    let mut transformer = TransformerBuilder::new(&memory).build().unwrap();

    let logits = transformer.forward(1, 0);

    assert_eq!(logits.len(), config.vocab_size);
    assert!(logits.iter().all(|l| l.is_finite()));
    assert!(logits.iter().any(|&l| l != 0.0));
}

#[test]
fn test_forward_is_deterministic() {
    let config = tiny_config();
    let memory = load(&model_blob(&config, None));
    let mut first = TransformerBuilder::new(&memory).build().unwrap();
    let mut second = TransformerBuilder::new(&memory).build().unwrap();

    for (pos, token) in [1, 7, 3].into_iter().enumerate() {
        let expected = first.forward(token, pos).to_vec();
        assert_eq!(second.forward(token, pos).to_vec(), expected);
    }
}

#[test]
fn test_forward_never_reads_future_cache_slots() {
    let config = tiny_config();
    let memory = load(&model_blob(&config, None));
    let mut clean = TransformerBuilder::new(&memory).build().unwrap();
    let mut poisoned = TransformerBuilder::new(&memory).build().unwrap();

    let (key_cache, value_cache) = poisoned.kv_caches_mut();
    key_cache.fill(f32::NAN);
    value_cache.fill(f32::NAN);

    for (pos, token) in [1, 5, 9, 3, 14].into_iter().enumerate() {
        let expected = clean.forward(token, pos).to_vec();
        let logits = poisoned.forward(token, pos).to_vec();

        assert!(logits.iter().all(|l| l.is_finite()), "non-finite logits at pos {pos}");
        assert_eq!(logits, expected);
    }
}

#[test]
fn test_context_depends_on_earlier_positions() {
    let config = tiny_config();
    let memory = load(&model_blob(&config, None));
    let mut a = TransformerBuilder::new(&memory).build().unwrap();
    let mut b = TransformerBuilder::new(&memory).build().unwrap();

    a.forward(2, 0);
    b.forward(11, 0);

    assert_ne!(a.forward(5, 1).to_vec(), b.forward(5, 1).to_vec());
}

#[test]
fn test_dedicated_classifier_is_used() {
    let config = ModelConfig { shared_classifier: false, ..tiny_config() };
    let wcls = vec![0.0; config.vocab_size * config.dim];
    let memory = load(&model_blob(&config, Some(wcls.as_slice())));
    let mut transformer = TransformerBuilder::new(&memory).build().unwrap();

    assert!(!transformer.get_config().shared_classifier);
    assert!(transformer.forward(1, 0).iter().all(|&l| l == 0.0));
}

#[test]
fn test_dim_over_capacity_is_rejected() {
    let config = ModelConfig { dim: 128, ..tiny_config() };
    let mut blob: Vec<u8> = Vec::new();
    write_header(&mut blob, &config).unwrap();
    let memory = load(&blob);

    let result = TransformerBuilder::new(&memory).build();

    assert!(matches!(result, Err(InferenceError::CapacityExceeded { field: "dim", value: 128, max: 64 })));
}

#[test]
fn test_truncated_blob_is_rejected() {
    let config = tiny_config();
    let mut blob = model_blob(&config, None);
    blob.truncate(blob.len() - 4);
    let memory = load(&blob);

    let result = TransformerBuilder::new(&memory).build();

    assert!(matches!(result, Err(InferenceError::Truncated { .. })));
}

#[test]
fn test_seq_len_is_capped_to_capacity() {
    let config = ModelConfig { seq_len: 512, ..tiny_config() };
    let memory = load(&model_blob(&config, None));

    let mut transformer = TransformerBuilder::new(&memory).build().unwrap();

    assert_eq!(transformer.get_config().seq_len, 256);
    assert!(transformer.forward(1, 255).iter().all(|l| l.is_finite()));
}

#[test]
fn test_ctx_length_overrides_seq_len() {
    let config = tiny_config();
    let memory = load(&model_blob(&config, None));

    let shorter = TransformerBuilder::new(&memory).with_ctx_length(Some(4)).build().unwrap();
    let longer = TransformerBuilder::new(&memory).with_ctx_length(Some(1000)).build().unwrap();
    let zero = TransformerBuilder::new(&memory).with_ctx_length(Some(0)).build().unwrap();

    assert_eq!(shorter.get_config().seq_len, 4);
    assert_eq!(longer.get_config().seq_len, 8);
    assert_eq!(zero.get_config().seq_len, 1);
}

#[cfg(debug_assertions)]
#[test]
#[should_panic(expected = "out of range")]
fn test_position_past_seq_len_panics_in_debug() {
    let config = tiny_config();
    let memory = load(&model_blob(&config, None));
    let mut transformer = TransformerBuilder::new(&memory).build().unwrap();

    transformer.forward(1, config.seq_len);
}
