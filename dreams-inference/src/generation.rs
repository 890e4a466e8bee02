use std::io::{self, Write};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info};
use parking_lot::Mutex;

use crate::InferenceConfig;
use crate::error::LoadResult;
use crate::sampler::Sampler;
use crate::tokenizer::Tokenizer;
use crate::transformer::{Transformer, TransformerBuilder};

/// Capacity of the bounded output text, terminator slot included.
pub const OUTPUT_CAPACITY: usize = 8 * 1024;

/// Fraction of the step budget after which generation stops at the next sentence boundary.
const EARLY_STOP_FRACTION: f64 = 0.8;

/// Receiver of generated text.
pub trait OutputSink {
    /// Called with every fragment that survives the output filter, as soon as it is decoded.
    fn on_fragment(&mut self, _fragment: &str) {}

    /// Called once per run with the complete, bounded output text.
    fn publish(&mut self, text: &str);
}

/// Keeps the most recently published text for readers on other threads.
#[derive(Debug, Clone, Default)]
pub struct LatestText {
    inner: Arc<Mutex<String>>,
}

impl LatestText {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> String {
        self.inner.lock().clone()
    }
}

impl OutputSink for LatestText {
    fn publish(&mut self, text: &str) {
        let mut latest = self.inner.lock();
        latest.clear();
        latest.push_str(text);
    }
}

/// Streams fragments to stdout; the first write error is kept for [`StdoutSink::finish`].
#[derive(Debug, Default)]
pub struct StdoutSink {
    error: Option<io::Error>,
}

impl StdoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finish(self) -> io::Result<()> {
        self.error.map_or(Ok(()), Err)
    }

    fn write(&mut self, text: &str) {
        if self.error.is_some() {
            return;
        }
        let mut stdout = io::stdout().lock();
        if let Err(err) = stdout.write_all(text.as_bytes()).and_then(|_| stdout.flush()) {
            self.error = Some(err);
        }
    }
}

impl OutputSink for StdoutSink {
    fn on_fragment(&mut self, fragment: &str) {
        self.write(fragment);
    }

    fn publish(&mut self, _text: &str) {
        self.write("\n");
    }
}

/// Output text bounded to a fixed capacity.
///
/// Decoded pieces are filtered before they are kept:
/// - a leading `"` is dropped while the buffer is still empty,
/// - `<s>` and `</s>` are dropped, also when embedded in a longer piece,
/// - single bytes that are neither printable ASCII nor whitespace are dropped.
///
/// A piece that would not leave room for the terminator slot is not stored, but it is still
/// returned for streaming.
#[derive(Debug, Clone)]
pub struct TextBuffer {
    text: String,
    capacity: usize,
}

impl TextBuffer {
    pub fn new(capacity: usize) -> Self {
        Self { text: String::with_capacity(capacity), capacity }
    }

    pub fn clear(&mut self) {
        self.text.clear();
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Filters `piece` and appends it when it fits; returns the filtered fragment, if any.
    pub fn push(&mut self, piece: &[u8]) -> Option<String> {
        let mut piece = piece;
        if self.text.is_empty() && piece.first() == Some(&b'"') {
            piece = &piece[1..];
        }

        if piece == b"<s>" || piece == b"</s>" {
            return None;
        }

        let mut filtered = piece.to_vec();
        remove_all(&mut filtered, b"<s>");
        remove_all(&mut filtered, b"</s>");

        match filtered.as_slice() {
            [] => return None,
            [byte] if !is_printable_or_space(*byte) => return None,
            _ => {}
        }

        let fragment = String::from_utf8_lossy(&filtered).into_owned();
        if self.text.len() + fragment.len() < self.capacity.saturating_sub(1) {
            self.text.push_str(&fragment);
        }

        Some(fragment)
    }
}

impl Default for TextBuffer {
    fn default() -> Self {
        Self::new(OUTPUT_CAPACITY)
    }
}

fn remove_all(bytes: &mut Vec<u8>, needle: &[u8]) {
    while let Some(start) = bytes.windows(needle.len()).position(|window| window == needle) {
        bytes.drain(start..start + needle.len());
    }
}

fn is_printable_or_space(byte: u8) -> bool {
    (0x20..=0x7e).contains(&byte) || matches!(byte, b'\t' | b'\n' | 0x0b | 0x0c | b'\r')
}

/// Replaces a budget of 0, or one beyond the context window, by the context window.
pub fn normalize_steps(steps: usize, seq_len: usize) -> usize {
    if steps == 0 || steps > seq_len { seq_len } else { steps }
}

/// Where the generation loop takes its next token from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Next token is forced from the encoded prompt.
    PromptReplay,
    /// Next token comes from the sampler.
    FreeGeneration,
    Done,
}

/// Result of one generation run.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    /// Every token fed after the initial BOS, prompt tokens included.
    pub tokens: Vec<usize>,
    /// The bounded, filtered output text.
    pub text: String,
    pub tokens_per_second: f32,
}

/// Tracks token generation throughput
struct TokenMetrics {
    start_time: Option<Instant>,
}

impl TokenMetrics {
    fn new() -> Self {
        Self { start_time: None }
    }

    /// Starts the clock after the first step, so model warm-up is not counted.
    fn start(&mut self) {
        if self.start_time.is_none() {
            self.start_time = Some(Instant::now());
        }
    }

    fn tokens_per_second(&self, pos: usize) -> f32 {
        let Some(start_time) = self.start_time else { return 0.0 };
        let elapsed = start_time.elapsed().as_secs_f64();
        if pos > 1 && elapsed > 0.0 { ((pos - 1) as f64 / elapsed) as f32 } else { 0.0 }
    }
}

/// Represents the current generation state
struct GenerationState {
    phase: Phase,
    pos: usize,
    token: usize,
    steps: usize,
    prompt_len: usize,
    in_sentence: bool,
    metrics: TokenMetrics,
}

impl GenerationState {
    fn new(initial_token: usize, prompt_len: usize, steps: usize) -> Self {
        let mut state = Self {
            phase: Phase::PromptReplay,
            pos: 0,
            token: initial_token,
            steps,
            prompt_len,
            in_sentence: false,
            metrics: TokenMetrics::new(),
        };
        state.phase = state.next_phase();
        state
    }

    /// A piece starting with `.`, `!` or `?` closes a sentence, any other visible character opens one.
    fn track_sentence(&mut self, piece: &[u8]) {
        match piece.first() {
            Some(b'.' | b'!' | b'?') => self.in_sentence = false,
            Some(byte) if !byte.is_ascii_whitespace() && *byte != 0x0b => self.in_sentence = true,
            _ => {}
        }
    }

    fn advance(&mut self, next_token: usize) {
        self.token = next_token;
        self.pos += 1;
        self.metrics.start();
        self.phase = self.next_phase();
    }

    fn next_phase(&self) -> Phase {
        if self.pos >= self.steps
            || (self.pos as f64 > self.steps as f64 * EARLY_STOP_FRACTION && !self.in_sentence)
        {
            Phase::Done
        } else if self.pos + 1 < self.prompt_len {
            Phase::PromptReplay
        } else {
            Phase::FreeGeneration
        }
    }
}

/// Model, tokenizer and sampler of one device, plus the bounded output text.
///
/// Only one generation runs at a time: [`Session::generate`] takes `&mut self`.
#[derive(Debug)]
pub struct Session {
    transformer: Transformer,
    tokenizer: Tokenizer,
    sampler: Sampler,
    output: TextBuffer,
}

impl Session {
    pub fn new(transformer: Transformer, tokenizer: Tokenizer, sampler: Sampler) -> Self {
        Self { transformer, tokenizer, sampler, output: TextBuffer::default() }
    }

    /// Loads checkpoint and vocabulary named by `config` and builds the sampler.
    pub fn load(config: &InferenceConfig) -> LoadResult<Self> {
        let transformer = TransformerBuilder::new(&config.checkpoint_path).with_ctx_length(config.ctx_length).build()?;
        debug!("{transformer:#?}");

        let vocab_size = transformer.config().vocab_size;
        let tokenizer = Tokenizer::from_file(&config.tokenizer_path, vocab_size)?;
        debug!("{tokenizer:#?}");

        let sampler = Sampler::new(vocab_size, config.temperature, config.topp, config.seed);
        info!("Sampler: temperature={} topp={} seed={}", sampler.temperature, sampler.topp, sampler.seed());

        Ok(Self::new(transformer, tokenizer, sampler))
    }

    pub fn transformer(&self) -> &Transformer {
        &self.transformer
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    /// Runs one generation from a fresh key/value cache and a reseeded sampler.
    ///
    /// The prompt (empty when `None`) is replayed token by token, then the sampler takes over
    /// until `steps` positions ran, or earlier once 80% of the budget is used and the text is
    /// not inside a sentence. A run that ends mid-sentence is closed with a period.
    /// `on_complete` receives the throughput once, then `sink` receives the full text.
    pub fn generate(
        &mut self,
        prompt: Option<&str>,
        steps: usize,
        sink: &mut dyn OutputSink,
        on_complete: impl FnOnce(f32),
    ) -> Generation {
        let seed = self.sampler.seed();
        self.transformer.reset(seed);
        self.sampler.reset();
        self.output.clear();

        let prompt_tokens = self.tokenizer.encode(prompt.unwrap_or(""), true, false);
        let steps = normalize_steps(steps, self.transformer.config().seq_len);
        debug!("Generating {steps} steps from {} prompt tokens", prompt_tokens.len());

        let mut state = GenerationState::new(prompt_tokens[0], prompt_tokens.len(), steps);
        let mut tokens = Vec::with_capacity(steps);

        while state.phase != Phase::Done {
            self.sampler.advance(state.pos);
            let logits = self.transformer.forward(state.token, state.pos);

            let next = match state.phase {
                Phase::PromptReplay => prompt_tokens[state.pos + 1],
                _ => self.sampler.sample(logits),
            };

            let piece = self.tokenizer.decode_bytes(state.token, next);
            state.track_sentence(piece);
            if let Some(fragment) = self.output.push(piece) {
                sink.on_fragment(&fragment);
            }

            tokens.push(next);
            state.advance(next);
        }

        if state.in_sentence {
            if let Some(fragment) = self.output.push(b".") {
                sink.on_fragment(&fragment);
            }
        }

        let tokens_per_second = state.metrics.tokens_per_second(state.pos);
        info!("Achieved {tokens_per_second:.2} tok/s over {} positions", state.pos);
        on_complete(tokens_per_second);

        sink.publish(self.output.as_str());

        Generation { tokens, text: self.output.as_str().to_owned(), tokens_per_second }
    }
}
