//! Sentencepiece-style BPE tokenizer for llama2 vocabularies.
//!
//! - Loads token strings and merge scores from a binary file.
//! - Encodes text by looking up every UTF-8 codepoint (falling back to raw byte tokens)
//!   and then greedily merging the best scoring adjacent pair until nothing merges.
//! - Decodes a token given its predecessor, undoing the dummy-prefix space after BOS and
//!   expanding `<0xHH>` byte tokens.

use std::borrow::Cow;
use std::path::Path;
use std::sync::OnceLock;

use byteorder::{ByteOrder, LittleEndian};
use log::{info, warn};

use crate::error::{LoadError, LoadResult};

/// Unknown token ID
pub const UNK_TOKEN_ID: usize = 0;
/// Beginning-of-sequence token ID
pub const BOS_TOKEN_ID: usize = 1;
/// End-of-sequence token ID
pub const EOS_TOKEN_ID: usize = 2;
/// Raw byte `b` is token `b + BYTE_TOKEN_OFFSET`, after the three control tokens.
pub const BYTE_TOKEN_OFFSET: usize = 3;

/// Token strings and merge scores as stored in the vocabulary file.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    /// Vocabulary: each token is a byte sequence (not necessarily valid UTF-8)
    pub tokens: Vec<Vec<u8>>,
    /// Merge scores for BPE merges (higher is better)
    pub scores: Vec<f32>,
    /// Maximum token length (in bytes)
    pub max_token_length: usize,
}

impl Vocabulary {
    /// Loads `vocab_size` entries from a vocabulary file.
    ///
    /// Layout: i32 max token length, then per token `{f32 score, i32 length, raw bytes}`.
    pub fn load(path: impl AsRef<Path>, vocab_size: usize) -> LoadResult<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|err| LoadError::io(path, err))?;
        let vocabulary = Self::parse(&bytes, vocab_size, path)?;

        info!("Loaded {} tokens from {} (max token length {})", vocab_size, path.display(), vocabulary.max_token_length);

        Ok(vocabulary)
    }

    fn parse(bytes: &[u8], vocab_size: usize, path: &Path) -> LoadResult<Self> {
        let mut reader = ByteReader { bytes, offset: 0, path };

        let max_token_length = reader.read_i32()?;
        let max_token_length = usize::try_from(max_token_length)
            .map_err(|_| reader.malformed(format!("negative max token length {max_token_length}")))?;

        let mut tokens = Vec::new();
        let mut scores = Vec::new();
        let entry_bytes = size_of::<Vec<u8>>() + size_of::<f32>();
        tokens
            .try_reserve_exact(vocab_size)
            .and_then(|_| scores.try_reserve_exact(vocab_size))
            .map_err(|_| LoadError::Allocation { what: "vocabulary", bytes: vocab_size * entry_bytes })?;

        for id in 0..vocab_size {
            scores.push(reader.read_f32()?);

            let len = reader.read_i32()?;
            let len = usize::try_from(len).map_err(|_| reader.malformed(format!("token {id} has length {len}")))?;
            tokens.push(reader.take(len)?.to_vec());
        }

        Ok(Self { tokens, scores, max_token_length })
    }

    /// Builds a vocabulary from `(token, score)` pairs.
    pub fn from_tokens<T: AsRef<[u8]>>(entries: &[(T, f32)]) -> Self {
        let tokens: Vec<Vec<u8>> = entries.iter().map(|(token, _)| token.as_ref().to_vec()).collect();
        let max_token_length = tokens.iter().map(Vec::len).max().unwrap_or(0);
        let scores = entries.iter().map(|&(_, score)| score).collect();

        Self { tokens, scores, max_token_length }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    offset: usize,
    path: &'a Path,
}

impl<'a> ByteReader<'a> {
    fn take(&mut self, count: usize) -> LoadResult<&'a [u8]> {
        let end = self.offset + count;
        if end > self.bytes.len() {
            return Err(LoadError::ShortRead { path: self.path.to_path_buf(), expected: end, actual: self.bytes.len() });
        }

        let result = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(result)
    }

    fn read_i32(&mut self) -> LoadResult<i32> {
        self.take(4).map(LittleEndian::read_i32)
    }

    fn read_f32(&mut self) -> LoadResult<f32> {
        self.take(4).map(LittleEndian::read_f32)
    }

    fn malformed(&self, reason: String) -> LoadError {
        LoadError::Malformed { path: self.path.to_path_buf(), reason }
    }
}

/// Tokenizer for sentencepiece-style BPE vocabularies.
pub struct Tokenizer {
    vocab: Vocabulary,
    /// Token ids ordered by token bytes, built on first encode.
    sorted_vocab: OnceLock<Vec<usize>>,
    /// Byte `b` decodes to `byte_pieces[b..b + 1]`.
    byte_pieces: [u8; 256],
}

impl Tokenizer {
    pub fn new(vocab: Vocabulary) -> Self {
        Self { vocab, sorted_vocab: OnceLock::new(), byte_pieces: std::array::from_fn(|i| i as u8) }
    }

    /// Loads the vocabulary file and wraps it into a tokenizer.
    pub fn from_file(path: impl AsRef<Path>, vocab_size: usize) -> LoadResult<Self> {
        Vocabulary::load(path, vocab_size).map(Self::new)
    }

    pub fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    fn sorted_vocab(&self) -> &[usize] {
        self.sorted_vocab.get_or_init(|| {
            let mut ids: Vec<usize> = (0..self.vocab.len()).collect();
            ids.sort_by(|&a, &b| self.vocab.tokens[a].cmp(&self.vocab.tokens[b]));
            ids
        })
    }

    /// Looks up an exact token string and returns its id, if present.
    pub fn lookup(&self, piece: &[u8]) -> Option<usize> {
        let sorted = self.sorted_vocab();
        sorted.binary_search_by(|&id| self.vocab.tokens[id].as_slice().cmp(piece)).ok().map(|pos| sorted[pos])
    }

    fn byte_token(&self, byte: u8) -> usize {
        let id = byte as usize + BYTE_TOKEN_OFFSET;
        if id < self.vocab.len() {
            id
        } else {
            warn!("No byte token for {byte:#04x} in a vocabulary of {}, using <unk>", self.vocab.len());
            UNK_TOKEN_ID
        }
    }

    /// Encodes a string into a sequence of token IDs using BPE.
    ///
    /// 1. Optional BOS, then the dummy-prefix space when the text is not empty.
    /// 2. One token per codepoint, or one token per byte when the codepoint is unknown.
    /// 3. Repeatedly merges the adjacent pair whose concatenation has the highest score
    ///    (leftmost pair on ties) until no concatenation is in the vocabulary.
    /// 4. Optional EOS.
    pub fn encode(&self, text: &str, add_bos: bool, add_eos: bool) -> Vec<usize> {
        let mut tokens = Vec::with_capacity(text.len() + 3);

        if add_bos {
            tokens.push(BOS_TOKEN_ID);
        }

        if !text.is_empty() {
            let dummy_prefix = self.lookup(b" ").unwrap_or_else(|| self.byte_token(b' '));
            tokens.push(dummy_prefix);
        }

        let mut utf8 = [0u8; 4];
        for ch in text.chars() {
            let codepoint = ch.encode_utf8(&mut utf8).as_bytes();
            match self.lookup(codepoint) {
                Some(id) => tokens.push(id),
                None => tokens.extend(codepoint.iter().map(|&byte| self.byte_token(byte))),
            }
        }

        let mut merged = Vec::with_capacity(self.vocab.max_token_length * 2);
        loop {
            let mut best: Option<(usize, usize)> = None;
            let mut best_score = -1e10f32;

            for (idx, pair) in tokens.windows(2).enumerate() {
                merged.clear();
                merged.extend_from_slice(&self.vocab.tokens[pair[0]]);
                merged.extend_from_slice(&self.vocab.tokens[pair[1]]);

                if let Some(id) = self.lookup(&merged) {
                    if self.vocab.scores[id] > best_score {
                        best_score = self.vocab.scores[id];
                        best = Some((idx, id));
                    }
                }
            }

            let Some((idx, id)) = best else { break };
            tokens[idx] = id;
            tokens.remove(idx + 1);
        }

        if add_eos {
            tokens.push(EOS_TOKEN_ID);
        }

        tokens
    }

    /// Decodes `token` following `prev_token` into raw bytes.
    ///
    /// Out-of-range ids decode to an empty piece.
    pub fn decode_bytes(&self, prev_token: usize, token: usize) -> &[u8] {
        let Some(mut piece) = self.vocab.tokens.get(token).map(Vec::as_slice) else {
            return &[];
        };

        // after BOS the sentencepiece decoder strips the dummy-prefix space
        if prev_token == BOS_TOKEN_ID && piece.first() == Some(&b' ') {
            piece = &piece[1..];
        }

        match parse_byte_token(piece) {
            Some(byte) => &self.byte_pieces[byte as usize..byte as usize + 1],
            None => piece,
        }
    }

    /// Decodes `token` following `prev_token` into text, replacing invalid UTF-8.
    pub fn decode(&self, prev_token: usize, token: usize) -> Cow<'_, str> {
        String::from_utf8_lossy(self.decode_bytes(prev_token, token))
    }
}

/// Parses raw byte tokens of the form `<0xHH>`.
fn parse_byte_token(piece: &[u8]) -> Option<u8> {
    match piece {
        [b'<', b'0', b'x', hi, lo, b'>'] => {
            let hex = [*hi, *lo];
            u8::from_str_radix(std::str::from_utf8(&hex).ok()?, 16).ok()
        }
        _ => None,
    }
}

impl std::fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tokenizer")
            .field("vocab_size", &self.vocab.len())
            .field("max_token_length", &self.vocab.max_token_length)
            .field("sorted", &self.sorted_vocab.get().is_some())
            .finish_non_exhaustive()
    }
}
