//! On-device text generation for tiny llama2-style checkpoints.
//!
//! The forward pass splits every matrix multiplication and the multi-head attention between
//! the calling thread and two persistent worker lanes.

mod configuration;
mod error;
mod generation;
mod layers;
mod sampler;
mod scheduler;
mod tensor;
mod tokenizer;
mod transformer;
mod utils;

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use log::debug;

pub use crate::configuration::{HEADER_SIZE, ModelConfig, load_config};
pub use crate::error::{LoadError, LoadResult};
pub use crate::generation::{
    Generation, LatestText, OUTPUT_CAPACITY, OutputSink, Phase, Session, StdoutSink, TextBuffer, normalize_steps,
};
pub use crate::layers::{AttentionShape, RmsNorm, Rope, attend, softmax, swiglu};
pub use crate::sampler::{Sampler, XorShiftRng};
pub use crate::scheduler::ForkJoin;
pub use crate::tensor::{TensorView, matmul_rows};
pub use crate::tokenizer::{BOS_TOKEN_ID, BYTE_TOKEN_OFFSET, EOS_TOKEN_ID, Tokenizer, UNK_TOKEN_ID, Vocabulary};
pub use crate::transformer::{LayerWeights, Transformer, TransformerBuilder, TransformerWeights};

/// Vocabulary file expected next to the checkpoint when none is given.
pub const DEFAULT_TOKENIZER_FILE: &str = "tok512.bin";

#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub checkpoint_path: PathBuf,
    pub tokenizer_path: PathBuf,
    pub temperature: f32,
    pub topp: f32,
    pub steps: usize,
    pub ctx_length: Option<usize>,
    pub prompt: Option<String>,
    pub seed: u64,
}

impl InferenceConfig {
    pub fn builder() -> InferenceConfigBuilder {
        InferenceConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct InferenceConfigBuilder {
    checkpoint_path: Option<PathBuf>,
    tokenizer_path: Option<PathBuf>,
    temperature: Option<f32>,
    topp: Option<f32>,
    steps: Option<usize>,
    ctx_length: Option<usize>,
    prompt: Option<String>,
    seed: Option<u64>,
}

impl InferenceConfigBuilder {
    pub fn checkpoint_path(mut self, path: Option<impl AsRef<Path>>) -> Self {
        self.checkpoint_path = path.map(|p| p.as_ref().to_path_buf());
        self
    }
    pub fn tokenizer_path(mut self, path: Option<impl AsRef<Path>>) -> Self {
        self.tokenizer_path = path.map(|p| p.as_ref().to_path_buf());
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
    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }
    pub fn build(self) -> Result<InferenceConfig, String> {
        let checkpoint_path = self.checkpoint_path.ok_or("checkpoint_path is required")?;
        let tokenizer_path = self.tokenizer_path.unwrap_or_else(|| checkpoint_path.with_file_name(DEFAULT_TOKENIZER_FILE));

        Ok(InferenceConfig {
            checkpoint_path,
            tokenizer_path,
            temperature: self.temperature.unwrap_or(0.7),
            topp: self.topp.unwrap_or(0.8),
            steps: self.steps.unwrap_or(1024),
            ctx_length: self.ctx_length,
            prompt: self.prompt,
            seed: self.seed.unwrap_or_else(|| {
                SystemTime::now().duration_since(UNIX_EPOCH).map(|elapsed| elapsed.as_secs()).unwrap_or_default()
            }),
        })
    }
}

/// Loads the model and runs one generation, streaming the text to stdout.
pub fn run_inference(inference_config: InferenceConfig) -> Result<Generation> {
    debug!("{inference_config:#?}");

    let mut session = Session::load(&inference_config)
        .with_context(|| format!("Failed to load model from {}", inference_config.checkpoint_path.display()))?;

    let mut sink = StdoutSink::new();
    let generation = session.generate(inference_config.prompt.as_deref(), inference_config.steps, &mut sink, |tps| {
        eprintln!("achieved tok/s: {tps:.2}")
    });
    sink.finish().context("Failed to write generated text")?;

    Ok(generation)
}

/// Encodes `text` with the vocabulary sized by the checkpoint header, without loading weights.
pub fn run_encode(checkpoint_path: &Path, tokenizer_path: &Path, text: &str) -> Result<Vec<usize>> {
    let config = load_config(checkpoint_path)
        .with_context(|| format!("Failed to read header of {}", checkpoint_path.display()))?;
    let tokenizer = Tokenizer::from_file(tokenizer_path, config.vocab_size)?;

    Ok(tokenizer.encode(text, true, false))
}
