use super::*;
use crate::configuration::ModelConfig;
use crate::writer::write_vocabulary;

const VOCAB: [(&str, f32); 10] = [
    ("<unk>", 0.0),
    ("<s>", 0.0),
    ("</s>", 0.0),
    (" hi", 2.0),
    (" there", 0.0),
    ("!", 0.0),
    (" ", 0.0),
    ("h", 0.0),
    ("i", 0.0),
    ("hi", 1.0),
];

/// Emits one-hot logits for a scripted token at each position and records its inputs.
struct ScriptedModel {
    config: ModelConfig,
    script: Vec<usize>,
    logits: Vec<f32>,
    calls: Vec<(usize, usize)>,
}

impl ScriptedModel {
    fn new(script: &[usize], seq_len: usize) -> Self {
        let config = ModelConfig {
            dim: 4,
            hidden_dim: 4,
            n_layers: 1,
            n_heads: 1,
            n_kv_heads: 1,
            vocab_size: VOCAB.len(),
            seq_len,
            shared_classifier: true,
        };
        Self { config, script: script.to_vec(), logits: vec![0.0; VOCAB.len()], calls: Vec::new() }
    }
}

impl Transformer for ScriptedModel {
    fn forward(&mut self, token: usize, pos: usize) -> &mut [f32] {
        self.calls.push((token, pos));
        let next = self.script.get(pos).or(self.script.last()).copied().unwrap_or(0);
        self.logits.fill(0.0);
        self.logits[next] = 1.0;
        &mut self.logits
    }

    fn get_config(&self) -> &ModelConfig {
        &self.config
    }
}

fn tokenizer() -> Tokenizer {
    let mut blob: Vec<u8> = Vec::new();
    write_vocabulary(&mut blob, &VOCAB[..]).unwrap();
    Tokenizer::load(&blob, VOCAB.len(), VOCAB.len()).unwrap()
}

fn greedy() -> Sampler {
    Sampler::new(VOCAB.len(), VOCAB.len(), 0.0, 0.9, 1).unwrap()
}

#[test]
fn test_generate_without_prompt_stops_on_bos() {
    let mut model = ScriptedModel::new(&[3, 4, 5, BOS_TOKEN_ID], 16);
    let mut output: Vec<u8> = Vec::new();

    let report = generate(&mut model, &tokenizer(), &mut greedy(), None, 16, &mut output).unwrap();

    assert_eq!(output, b"hi there!");
    assert_eq!(report.prompt_tokens, 1);
    assert_eq!(report.generated, 3);
    assert_eq!(report.positions, 4);
    assert!(report.stopped_on_bos);
    assert_eq!(model.calls, vec![(1, 0), (3, 1), (4, 2), (5, 3)]);
}

#[test]
fn test_generate_replays_prompt() {
    // "hi" encodes to [BOS, " hi"]; the model's choice at position 0 is ignored
    let mut model = ScriptedModel::new(&[5, 4, 5], 16);
    let mut output: Vec<u8> = Vec::new();

    let report = generate(&mut model, &tokenizer(), &mut greedy(), Some("hi"), 3, &mut output).unwrap();

    assert_eq!(output, b"hi there!");
    assert_eq!(report.prompt_tokens, 2);
    assert_eq!(report.generated, 2);
    assert_eq!(report.positions, 3);
    assert!(!report.stopped_on_bos);
    assert_eq!(model.calls, vec![(1, 0), (3, 1), (4, 2)]);
}

#[test]
fn test_generate_zero_steps_runs_to_seq_len() {
    let mut model = ScriptedModel::new(&[5], 4);
    let mut output: Vec<u8> = Vec::new();

    let report = generate(&mut model, &tokenizer(), &mut greedy(), Some(""), 0, &mut output).unwrap();

    assert_eq!(report.positions, 4);
    assert_eq!(report.generated, 4);
    assert_eq!(output, b"!!!!");
}

#[test]
fn test_generate_steps_are_capped_by_seq_len() {
    let mut model = ScriptedModel::new(&[5], 3);
    let mut output: Vec<u8> = Vec::new();

    let report = generate(&mut model, &tokenizer(), &mut greedy(), None, 100, &mut output).unwrap();

    assert_eq!(report.positions, 3);
    assert_eq!(model.calls.last(), Some(&(5, 2)));
}

#[test]
fn test_generate_long_prompt_is_cut_at_steps() {
    let mut model = ScriptedModel::new(&[5], 16);
    let mut output: Vec<u8> = Vec::new();

    let report = generate(&mut model, &tokenizer(), &mut greedy(), Some("hi hi hi"), 2, &mut output).unwrap();

    assert_eq!(report.positions, 2);
    assert_eq!(report.generated, 0);
    assert_eq!(report.tokens_per_second(), None);
}

#[test]
fn test_generate_rejects_prompt_outside_vocabulary() {
    let mut model = ScriptedModel::new(&[5], 16);
    let mut output: Vec<u8> = Vec::new();

    // 'z' falls back to byte id 125, past the ten-token vocabulary
    let err = generate(&mut model, &tokenizer(), &mut greedy(), Some("z"), 4, &mut output).unwrap_err();

    assert!(matches!(err, InferenceError::InvalidConfig(_)));
    assert!(model.calls.is_empty());
}

#[test]
fn test_console_sink_filters_unprintable_bytes() {
    let mut sink = ConsoleSink::new(Vec::<u8>::new());

    sink.emit(b"hello").unwrap();
    sink.emit(b"").unwrap();
    sink.emit(&[0x07]).unwrap();
    sink.emit(b"\n").unwrap();
    sink.emit(&[0xE2, 0x9C, 0x93]).unwrap();

    assert_eq!(sink.into_inner(), b"hello\n\xE2\x9C\x93");
}

#[test]
fn test_tokens_per_second() {
    let report = GenerationReport {
        prompt_tokens: 1,
        positions: 11,
        generated: 10,
        elapsed: Duration::from_secs(2),
        stopped_on_bos: false,
    };

    assert_eq!(report.tokens_per_second(), Some(5.0));
}
