//! Tokenizer for SentencePiece-style BPE vocabularies.
//!
//! - Loads token strings and merge scores from a binary blob into a fixed-size string pool.
//! - Encodes text by codepoint lookup with byte fallback, then greedy highest-score BPE merges.
//! - Decodes token ids to raw byte fragments, resolving `<0xHH>` byte tokens.

#[cfg(test)]
#[path = "../tests/unit/tokenizer_test.rs"]
mod tokenizer_test;

use crate::error::{InferenceError, Result};
use crate::memory::BlobCursor;
use log::{info, warn};

/// Longest token string the pool reserves room for.
pub const MAX_TOKEN_LENGTH: usize = 128;
/// Beginning-of-sequence token id.
pub const BOS_TOKEN_ID: usize = 1;
/// End-of-sequence token id.
pub const EOS_TOKEN_ID: usize = 2;
/// Byte `b` falls back to token `b + BYTE_FALLBACK_OFFSET`; ids below it are control tokens.
pub const BYTE_FALLBACK_OFFSET: usize = 3;

#[derive(Debug, Clone, Copy)]
struct Entry {
    offset: usize,
    len: usize,
}

#[derive(Debug)]
enum SortedIndex {
    Unbuilt,
    /// Token ids ordered by their byte strings.
    Built(Box<[usize]>),
}

/// Token strings and merge scores, stored in an owned fixed-capacity pool.
///
/// Each string is copied into the pool followed by a NUL byte, so the pool budget is
/// `max_vocab * (MAX_TOKEN_LENGTH + 1)` bytes. Strings never change after loading.
pub struct Vocabulary {
    pool: Box<[u8]>,
    pool_used: usize,
    entries: Vec<Entry>,
    scores: Vec<f32>,
    max_token_length: u32,
    longest_piece: usize,
    sorted: SortedIndex,
}

impl Vocabulary {
    /// Loads `vocab_size` records and builds the sorted index.
    pub fn load(blob: &[u8], vocab_size: usize, max_vocab: usize) -> Result<Self> {
        let mut vocab = Self::parse(blob, vocab_size, max_vocab)?;
        vocab.build_sorted_index();
        Ok(vocab)
    }

    /// Loads `vocab_size` records without building the sorted index.
    ///
    /// Layout: one i32 maximum token length, then per token an f32 score, an i32 length
    /// and that many raw bytes.
    pub fn parse(blob: &[u8], vocab_size: usize, max_vocab: usize) -> Result<Self> {
        if vocab_size > max_vocab {
            return Err(InferenceError::CapacityExceeded { field: "vocab_size", value: vocab_size, max: max_vocab });
        }

        let mut cursor = BlobCursor::new(blob);
        // Informational only; nothing is sized from it
        let header_length = cursor.read_i32(|| "max token length".to_string())?;
        let max_token_length = u32::try_from(header_length).unwrap_or_else(|_| {
            warn!("Tokenizer: negative max_token_length {header_length} in header, treating it as 0");
            0
        });

        let capacity = max_vocab * (MAX_TOKEN_LENGTH + 1);
        let mut pool = vec![0u8; capacity].into_boxed_slice();
        let mut pool_used = 0;
        let mut longest_piece = 0;
        let mut entries = Vec::with_capacity(vocab_size);
        let mut scores = Vec::with_capacity(vocab_size);

        for i in 0..vocab_size {
            let score = cursor.read_f32(|| format!("score of token {i}"))?;
            let len = cursor.read_i32(|| format!("length of token {i}"))?;
            let len = usize::try_from(len)
                .map_err(|_| InferenceError::InvalidConfig(format!("token {i} has negative length {len}")))?;
            let bytes = cursor.get_bytes(len, || format!("bytes of token {i}"))?;

            let needed = pool_used + len + 1;
            if needed > capacity {
                return Err(InferenceError::PoolExhausted { needed, capacity });
            }

            pool[pool_used..pool_used + len].copy_from_slice(bytes);
            pool[pool_used + len] = 0;
            entries.push(Entry { offset: pool_used, len });
            scores.push(score);
            pool_used = needed;
            longest_piece = longest_piece.max(len);
        }

        info!("Tokenizer: loaded {vocab_size} tokens ({pool_used} of {capacity} pool bytes), max_token_length={max_token_length}");

        Ok(Self { pool, pool_used, entries, scores, max_token_length, longest_piece, sorted: SortedIndex::Unbuilt })
    }

    /// Builds the sorted index; a no-op once it exists.
    pub fn build_sorted_index(&mut self) {
        if let SortedIndex::Built(_) = self.sorted {
            return;
        }

        let mut ids: Box<[usize]> = (0..self.entries.len()).collect();
        ids.sort_by(|&a, &b| self.piece(a).cmp(self.piece(b)));
        self.sorted = SortedIndex::Built(ids);
    }

    pub fn is_indexed(&self) -> bool {
        matches!(self.sorted, SortedIndex::Built(_))
    }

    /// Finds the id of the token whose string is exactly `s`.
    ///
    /// Binary search over the sorted index, or a linear scan before it is built.
    pub fn lookup(&self, s: &[u8]) -> Option<usize> {
        match &self.sorted {
            SortedIndex::Built(ids) => ids.binary_search_by(|&id| self.piece(id).cmp(s)).ok().map(|i| ids[i]),
            SortedIndex::Unbuilt => (0..self.entries.len()).find(|&id| self.piece(id) == s),
        }
    }

    /// The token's string, without the pool's NUL terminator.
    pub fn piece(&self, id: usize) -> &[u8] {
        let Entry { offset, len } = self.entries[id];
        &self.pool[offset..offset + len]
    }

    pub fn get(&self, id: usize) -> Option<&[u8]> {
        (id < self.entries.len()).then(|| self.piece(id))
    }

    pub fn score(&self, id: usize) -> f32 {
        self.scores[id]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_token_length(&self) -> u32 {
        self.max_token_length
    }

    /// Length in bytes of the longest piece actually loaded.
    pub fn longest_piece(&self) -> usize {
        self.longest_piece
    }

    /// Pool bytes in use, terminators included.
    pub fn pool_used(&self) -> usize {
        self.pool_used
    }

    pub fn pool_capacity(&self) -> usize {
        self.pool.len()
    }
}

impl std::fmt::Debug for Vocabulary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vocabulary")
            .field("len", &self.len())
            .field("max_token_length", &self.max_token_length)
            .field("pool_used", &self.pool_used)
            .field("pool_capacity", &self.pool.len())
            .field("indexed", &self.is_indexed())
            .finish()
    }
}

/// Byte-pair encoder and decoder over a [`Vocabulary`].
pub struct Tokenizer {
    vocab: Vocabulary,
    /// `byte_pieces[b]` is the one-byte fragment `b`.
    byte_pieces: [u8; 256],
}

impl Tokenizer {
    pub fn new(vocab: Vocabulary) -> Self {
        let mut byte_pieces = [0u8; 256];
        for (i, byte) in byte_pieces.iter_mut().enumerate() {
            *byte = i as u8;
        }
        Self { vocab, byte_pieces }
    }

    /// Loads the vocabulary blob and builds the sorted index.
    pub fn load(blob: &[u8], vocab_size: usize, max_vocab: usize) -> Result<Self> {
        Vocabulary::load(blob, vocab_size, max_vocab).map(Self::new)
    }

    pub fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }

    /// Decodes `token`, which follows `prev_token`, to a raw fragment.
    ///
    /// A leading space is dropped right after BOS, and `<0xHH>` tokens become the single
    /// byte `HH`. Out-of-range ids decode to nothing.
    pub fn decode(&self, prev_token: usize, token: usize) -> &[u8] {
        let Some(mut piece) = self.vocab.get(token) else {
            return &[];
        };
        if prev_token == BOS_TOKEN_ID && piece.first() == Some(&b' ') {
            piece = &piece[1..];
        }

        match parse_byte_token(piece) {
            Some(byte) => std::slice::from_ref(&self.byte_pieces[byte as usize]),
            None => piece,
        }
    }

    /// Encodes `text` into token ids, optionally framed by BOS and EOS.
    ///
    /// Fails only when there is no text at all; an empty string encodes to the framing
    /// tokens alone.
    pub fn encode(&self, text: Option<&str>, bos: bool, eos: bool) -> Result<Vec<usize>> {
        let text = text.ok_or(InferenceError::EmptyInput("no text to encode"))?;
        let mut tokens = Vec::with_capacity(text.len() + 3);

        if bos {
            tokens.push(BOS_TOKEN_ID);
        }

        // Dummy prefix, as SentencePiece adds with add_dummy_prefix
        if !text.is_empty() {
            match self.vocab.lookup(b" ") {
                Some(id) => tokens.push(id),
                None => {
                    warn!("Tokenizer: no single-space token, using byte fallback for the dummy prefix");
                    tokens.push(b' ' as usize + BYTE_FALLBACK_OFFSET);
                }
            }
        }

        for (start, ch) in text.char_indices() {
            let codepoint = &text.as_bytes()[start..start + ch.len_utf8()];
            match self.vocab.lookup(codepoint) {
                Some(id) => tokens.push(id),
                None => tokens.extend(codepoint.iter().map(|&b| b as usize + BYTE_FALLBACK_OFFSET)),
            }
        }

        self.merge(&mut tokens);

        if eos {
            tokens.push(EOS_TOKEN_ID);
        }

        Ok(tokens)
    }

    /// Repeatedly merges the adjacent pair whose concatenation is the best-scoring token.
    ///
    /// Ties keep the leftmost pair. Every round removes one token, so this stops after at
    /// most `tokens.len() - 1` rounds. Returns the number of rounds.
    fn merge(&self, tokens: &mut Vec<usize>) -> usize {
        let mut merged = Vec::with_capacity(self.vocab.longest_piece() * 2);
        let mut rounds = 0;

        loop {
            let mut best_score = -1e10f32;
            let mut best = None;

            for (idx, pair) in tokens.windows(2).enumerate() {
                // Byte-fallback ids may lie past a truncated vocabulary
                let (Some(left), Some(right)) = (self.vocab.get(pair[0]), self.vocab.get(pair[1])) else {
                    continue;
                };
                merged.clear();
                merged.extend_from_slice(left);
                merged.extend_from_slice(right);

                if let Some(id) = self.vocab.lookup(&merged) {
                    let score = self.vocab.score(id);
                    if score > best_score {
                        best_score = score;
                        best = Some((idx, id));
                    }
                }
            }

            let Some((idx, id)) = best else {
                return rounds;
            };

            tokens[idx] = id;
            tokens.remove(idx + 1);
            rounds += 1;
        }
    }
}

impl std::fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tokenizer")
            .field("vocab", &self.vocab)
            .field("bos_token_id", &BOS_TOKEN_ID)
            .field("eos_token_id", &EOS_TOKEN_ID)
            .finish_non_exhaustive()
    }
}

/// Parses a byte token of the form `<0xHH>`.
fn parse_byte_token(piece: &[u8]) -> Option<u8> {
    match piece {
        [b'<', b'0', b'x', hi, lo, b'>'] if hi.is_ascii_hexdigit() && lo.is_ascii_hexdigit() => {
            let hex = [*hi, *lo];
            u8::from_str_radix(std::str::from_utf8(&hex).ok()?, 16).ok()
        }
        _ => None,
    }
}
