use super::*;
use byteorder::{LittleEndian, WriteBytesExt};

fn header(fields: [i32; 7]) -> Vec<u8> {
    let mut blob: Vec<u8> = Vec::new();
    for field in fields {
        blob.write_i32::<LittleEndian>(field).unwrap();
    }
    blob
}

fn stories_260k() -> ModelConfig {
    ModelConfig {
        dim: 64,
        hidden_dim: 172,
        n_layers: 5,
        n_heads: 8,
        n_kv_heads: 4,
        vocab_size: 512,
        seq_len: 512,
        shared_classifier: true,
    }
}

#[test]
fn test_read_config_shared_classifier() {
    let config = read_config(&header([64, 172, 5, 8, 4, 512, 512])).unwrap();

    assert_eq!(config, stories_260k());
    assert_eq!(config.head_size(), 8);
    assert_eq!(config.kv_dim(), 32);
    assert_eq!(config.kv_mul(), 2);
}

#[test]
fn test_read_config_negative_vocab_means_dedicated_classifier() {
    let config = read_config(&header([64, 172, 5, 8, 4, -512, 512])).unwrap();

    assert_eq!(config.vocab_size, 512);
    assert!(!config.shared_classifier);
}

#[test]
fn test_read_config_ignores_trailing_bytes() {
    let mut blob = header([64, 172, 5, 8, 4, 512, 512]);
    blob.extend_from_slice(&[0xAB; 10]);

    assert_eq!(read_config(&blob).unwrap(), stories_260k());
}

#[test]
fn test_read_config_short_header() {
    let blob = header([64, 172, 5, 8, 4, 512, 512]);

    let err = read_config(&blob[..HEADER_SIZE - 2]).unwrap_err();

    match err {
        InferenceError::Truncated { what, needed, available } => {
            assert_eq!(what, "header field seq_len");
            assert_eq!(needed, 4);
            assert_eq!(available, 2);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_read_config_rejects_inconsistent_values() {
    let cases = [
        [0, 172, 5, 8, 4, 512, 512],
        [64, 172, -1, 8, 4, 512, 512],
        [64, 172, 5, 8, 4, 0, 512],
        [64, 172, 5, 8, 3, 512, 512],
        [64, 172, 5, 6, 6, 512, 512],
        [64, 172, 5, 64, 4, 512, 512],
        [64, 172, 5, 8, 4, 512, 0],
        [64, 172, 5, 8, 4, i32::MIN, 512],
    ];

    for fields in cases {
        let result = read_config(&header(fields));
        assert!(matches!(result, Err(InferenceError::InvalidConfig(_))), "accepted {fields:?}");
    }
}

#[test]
fn test_capacity_accepts_target_model() {
    assert!(Capacity::STORIES_260K.check(&stories_260k()).is_ok());
    assert_eq!(Capacity::default(), Capacity::STORIES_260K);
    assert_eq!(Capacity::STORIES_260K.kv_dim(), 32);
}

#[test]
fn test_capacity_reports_first_exceeded_field() {
    let capacity = Capacity::STORIES_260K;
    let cases = [
        (ModelConfig { dim: 72, ..stories_260k() }, "dim", 72, 64),
        (ModelConfig { hidden_dim: 173, ..stories_260k() }, "hidden_dim", 173, 172),
        (ModelConfig { n_layers: 6, ..stories_260k() }, "n_layers", 6, 5),
        (ModelConfig { vocab_size: 32000, ..stories_260k() }, "vocab_size", 32000, 512),
        // dim 64 with two kv heads out of two
        (ModelConfig { n_heads: 2, n_kv_heads: 2, ..stories_260k() }, "kv_dim", 64, 32),
    ];

    for (config, expected_field, expected_value, expected_max) in cases {
        match capacity.check(&config) {
            Err(InferenceError::CapacityExceeded { field, value, max }) => {
                assert_eq!(field, expected_field);
                assert_eq!(value, expected_value);
                assert_eq!(max, expected_max);
            }
            other => panic!("expected capacity error for {expected_field}, got {other:?}"),
        }
    }
}

#[test]
fn test_capacity_does_not_reject_long_sequences() {
    let config = ModelConfig { seq_len: 4096, ..stories_260k() };

    assert!(Capacity::STORIES_260K.check(&config).is_ok());
    assert_eq!(Capacity::STORIES_260K.cap_seq_len(4096), 256);
    assert_eq!(Capacity::STORIES_260K.cap_seq_len(100), 100);
}
