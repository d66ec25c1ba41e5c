//! Writers for the weight and vocabulary blob formats read by this crate.

use crate::configuration::ModelConfig;
use crate::error::{InferenceError, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use std::io::Write;

/// Writes the 7-field weight-blob header.
///
/// The vocabulary size is stored negated when the classifier is not shared.
pub fn write_header<W: Write>(writer: &mut W, config: &ModelConfig) -> Result<()> {
    let vocab_size = to_i32(config.vocab_size, "vocab_size")?;
    let fields = [
        to_i32(config.dim, "dim")?,
        to_i32(config.hidden_dim, "hidden_dim")?,
        to_i32(config.n_layers, "n_layers")?,
        to_i32(config.n_heads, "n_heads")?,
        to_i32(config.n_kv_heads, "n_kv_heads")?,
        if config.shared_classifier { vocab_size } else { -vocab_size },
        to_i32(config.seq_len, "seq_len")?,
    ];

    for field in fields {
        writer.write_i32::<LittleEndian>(field)?;
    }
    Ok(())
}

/// Appends a tensor as little-endian f32 values.
pub fn write_tensor<W: Write>(writer: &mut W, values: &[f32]) -> Result<()> {
    for &value in values {
        writer.write_f32::<LittleEndian>(value)?;
    }
    Ok(())
}

/// Writes a vocabulary blob: the maximum token length, then `(score, length, bytes)` per token.
pub fn write_vocabulary<W: Write, T: AsRef<[u8]>>(writer: &mut W, tokens: &[(T, f32)]) -> Result<()> {
    let max_token_length = tokens.iter().map(|(token, _)| token.as_ref().len()).max().unwrap_or(0);
    writer.write_i32::<LittleEndian>(to_i32(max_token_length, "max_token_length")?)?;

    for (token, score) in tokens {
        let bytes = token.as_ref();
        writer.write_f32::<LittleEndian>(*score)?;
        writer.write_i32::<LittleEndian>(to_i32(bytes.len(), "token length")?)?;
        writer.write_all(bytes)?;
    }
    Ok(())
}

fn to_i32(value: usize, name: &str) -> Result<i32> {
    i32::try_from(value).map_err(|_| InferenceError::InvalidConfig(format!("{name} {value} does not fit in i32")))
}
