use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::configuration::{HEADER_SIZE, ModelConfig, read_config};
use crate::error::{LoadError, LoadResult};
use crate::layers::{AttentionShape, RmsNorm, Rope, swiglu};
use crate::sampler::XorShiftRng;
use crate::scheduler::ForkJoin;
use crate::tensor::TensorView;
use crate::utils::{WeightCursor, read_f32_region, zeroed};

/// Amplitude of the uniform noise added to the residual stream after the embedding lookup.
const RESIDUAL_NOISE: f32 = 0.01;

/// Keeps the residual-noise stream apart from the sampler stream built from the same seed.
const NOISE_STREAM: u64 = 0xD1B5_4A32_D192_ED03;

/// Decoder-only llama2-style transformer over one flat float32 weight region.
///
/// **Per position:**
/// 1. Token embedding lookup plus a small uniform noise on the residual stream
/// 2. For every layer: RMSNorm → Q/K/V projections → RoPE → grouped-query attention over the
///    key/value cache → output projection + residual → RMSNorm → SwiGLU FFN + residual
/// 3. Final RMSNorm and the classifier projection into vocabulary logits
///
/// Every matrix multiplication and the multi-head attention go through the [`ForkJoin`]
/// scheduler, which splits them between the calling thread and a persistent worker.
pub struct Transformer {
    config: ModelConfig,
    weights: TransformerWeights,
    state: RunState,
    scheduler: ForkJoin,
    rope: Rope,
}

impl Transformer {
    /// Wraps loaded weights with freshly allocated scratch buffers and starts the worker lanes.
    pub fn new(config: ModelConfig, weights: TransformerWeights) -> LoadResult<Self> {
        let state = RunState::new(&config)?;
        let scheduler = ForkJoin::new().map_err(LoadError::WorkerSpawn)?;

        Ok(Self { rope: Rope::new(config.head_size()), config, weights, state, scheduler })
    }

    /// Runs one position through the network and returns the logits over the vocabulary.
    ///
    /// The key/value rows for `pos` are written into the cache, so positions must be fed
    /// in order starting from 0 after a [`Transformer::reset`].
    ///
    /// # Panics
    /// If `pos >= seq_len` or `token >= vocab_size`.
    pub fn forward(&mut self, token: usize, pos: usize) -> &mut [f32] {
        let Self { config, weights, state, scheduler, rope } = self;

        assert!(pos < config.seq_len, "position {pos} outside the context of {}", config.seq_len);
        assert!(token < config.vocab_size, "token {token} outside the vocabulary of {}", config.vocab_size);

        let dim = config.dim;
        let kv_dim = config.kv_dim();
        let shape = AttentionShape {
            pos,
            head_size: config.head_size(),
            kv_dim,
            kv_mul: config.kv_mul(),
            seq_len: config.seq_len,
        };

        let embedding = weights.get(weights.token_embedding);
        state.x.copy_from_slice(&embedding[token * dim..(token + 1) * dim]);
        for value in state.x.iter_mut() {
            *value += state.noise.next_f32() * RESIDUAL_NOISE;
        }

        for (layer_idx, layer) in weights.layers.iter().enumerate() {
            RmsNorm::new(weights.get(layer.rms_att)).forward(&mut state.xb, &state.x);

            // key and value for this position land directly in the layer's cache slot
            let layer_offset = layer_idx * config.seq_len * kv_dim;
            let row = layer_offset + pos * kv_dim..layer_offset + (pos + 1) * kv_dim;

            scheduler.matmul(&mut state.q, &state.xb, weights.get(layer.wq));
            scheduler.matmul(&mut state.key_cache[row.clone()], &state.xb, weights.get(layer.wk));
            scheduler.matmul(&mut state.value_cache[row.clone()], &state.xb, weights.get(layer.wv));

            rope.apply(&mut state.q, &mut state.key_cache[row.clone()], pos);

            let history = layer_offset..row.end;
            scheduler.attention(
                &state.q,
                &state.key_cache[history.clone()],
                &state.value_cache[history],
                &mut state.att,
                &mut state.xb,
                &shape,
            );

            scheduler.matmul(&mut state.xb2, &state.xb, weights.get(layer.wo));
            residual_add(&mut state.x, &state.xb2);

            RmsNorm::new(weights.get(layer.rms_ffn)).forward(&mut state.xb, &state.x);

            scheduler.matmul(&mut state.hb, &state.xb, weights.get(layer.w1));
            scheduler.matmul(&mut state.hb2, &state.xb, weights.get(layer.w3));
            swiglu(&mut state.hb, &state.hb2);
            scheduler.matmul(&mut state.xb, &state.hb, weights.get(layer.w2));
            residual_add(&mut state.x, &state.xb);
        }

        RmsNorm::new(weights.get(weights.rms_final)).forward_inplace(&mut state.x);
        scheduler.matmul(&mut state.logits, &state.x, weights.get(weights.classifier));

        &mut state.logits
    }

    /// Clears the key/value cache and restarts the residual-noise stream from `seed`.
    pub fn reset(&mut self, seed: u64) {
        self.state.reset(seed);
        debug!("Run state reset with seed {seed}");
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn weights(&self) -> &TransformerWeights {
        &self.weights
    }

    pub fn scheduler(&self) -> &ForkJoin {
        &self.scheduler
    }
}

impl std::fmt::Debug for Transformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        struct LayersSummary<'a, T>(&'a [T]);

        impl<T: std::fmt::Debug> std::fmt::Debug for LayersSummary<'_, T> {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_list()
                    .entries(self.0.iter().take(1))
                    .entry(&format_args!("... and {} more", self.0.len().saturating_sub(1)))
                    .finish()
            }
        }

        f.debug_struct("Transformer")
            .field("config", &self.config)
            .field("region_floats", &self.weights.region.len())
            .field("layers", &LayersSummary(&self.weights.layers))
            .field("classifier", &self.weights.classifier)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

fn residual_add(x: &mut [f32], delta: &[f32]) {
    x.iter_mut().zip(delta).for_each(|(value, &d)| *value += d);
}

/// Views of one decoder layer inside the weight region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerWeights {
    /// Attention RMSNorm weight, `[dim]`
    pub rms_att: TensorView,
    /// Query projection, `[dim, dim]`
    pub wq: TensorView,
    /// Key projection, `[kv_dim, dim]`
    pub wk: TensorView,
    /// Value projection, `[kv_dim, dim]`
    pub wv: TensorView,
    /// Output projection, `[dim, dim]`
    pub wo: TensorView,
    /// FFN RMSNorm weight, `[dim]`
    pub rms_ffn: TensorView,
    /// Gate projection, `[hidden_dim, dim]`
    pub w1: TensorView,
    /// Down projection, `[dim, hidden_dim]`
    pub w2: TensorView,
    /// Up projection, `[hidden_dim, dim]`
    pub w3: TensorView,
}

/// The owned weight region plus the views carved out of it at load time.
///
/// The checkpoint stores every tensor kind for all layers before the next kind, so the
/// per-layer views are obtained by splitting each stacked tensor into `n_layers` parts.
#[derive(Debug)]
pub struct TransformerWeights {
    region: Vec<f32>,
    /// Token embedding table, `[vocab_size, dim]`
    pub token_embedding: TensorView,
    pub layers: Vec<LayerWeights>,
    /// Final RMSNorm weight, `[dim]`
    pub rms_final: TensorView,
    /// Classifier, `[vocab_size, dim]`; equal to `token_embedding` for shared checkpoints
    pub classifier: TensorView,
}

impl TransformerWeights {
    /// Number of floats to read after the header for `config`.
    ///
    /// `available` is the number of floats the file actually holds; it decides whether an
    /// unshared checkpoint also carries the legacy RoPE table in front of its classifier.
    pub fn required_floats(config: &ModelConfig, available: usize) -> LoadResult<usize> {
        let overflow = || LoadError::InvalidHeader(format!("weight region size overflows for {config:?}"));

        let base = region_floats(config, false).ok_or_else(overflow)?;
        if !config.shared_classifier {
            let with_legacy = region_floats(config, true).ok_or_else(overflow)?;
            if available >= with_legacy {
                return Ok(with_legacy);
            }
        }

        Ok(base)
    }

    /// Lays the tensors of `config` out over `region`.
    pub fn from_region(config: &ModelConfig, region: Vec<f32>) -> LoadResult<Self> {
        let ModelConfig { dim, hidden_dim, n_layers, vocab_size, seq_len, .. } = *config;
        let kv_dim = config.kv_dim();

        let mut cursor = WeightCursor::new(region.len());
        let token_embedding = cursor.take(vocab_size * dim)?;

        let rms_att = cursor.take(n_layers * dim)?.split(n_layers);
        let wq = cursor.take(n_layers * dim * dim)?.split(n_layers);
        let wk = cursor.take(n_layers * dim * kv_dim)?.split(n_layers);
        let wv = cursor.take(n_layers * dim * kv_dim)?.split(n_layers);
        let wo = cursor.take(n_layers * dim * dim)?.split(n_layers);
        let rms_ffn = cursor.take(n_layers * dim)?.split(n_layers);
        let w1 = cursor.take(n_layers * dim * hidden_dim)?.split(n_layers);
        let w2 = cursor.take(n_layers * hidden_dim * dim)?.split(n_layers);
        let w3 = cursor.take(n_layers * dim * hidden_dim)?.split(n_layers);

        let rms_final = cursor.take(dim)?;

        let classifier = if config.shared_classifier {
            token_embedding
        } else {
            let legacy_rope = seq_len * config.head_size();
            if cursor.remaining() >= legacy_rope + vocab_size * dim {
                debug!("Skipping legacy RoPE table of {legacy_rope} floats");
                cursor.skip(legacy_rope)?;
            }
            cursor.take(vocab_size * dim)?
        };

        let layers = (0..n_layers)
            .map(|l| LayerWeights {
                rms_att: rms_att[l],
                wq: wq[l],
                wk: wk[l],
                wv: wv[l],
                wo: wo[l],
                rms_ffn: rms_ffn[l],
                w1: w1[l],
                w2: w2[l],
                w3: w3[l],
            })
            .collect();

        Ok(Self { region, token_embedding, layers, rms_final, classifier })
    }

    /// Borrows the floats behind `view`.
    pub fn get(&self, view: TensorView) -> &[f32] {
        &self.region[view.range()]
    }

    pub fn region(&self) -> &[f32] {
        &self.region
    }
}

fn region_floats(config: &ModelConfig, legacy_rope: bool) -> Option<usize> {
    let ModelConfig { dim, hidden_dim, n_layers, vocab_size, seq_len, .. } = *config;
    let kv_dim = config.kv_dim();

    let embedding = vocab_size.checked_mul(dim)?;
    let attention = dim.checked_mul(dim)?.checked_mul(2)?.checked_add(dim.checked_mul(kv_dim)?.checked_mul(2)?)?;
    let ffn = dim.checked_mul(hidden_dim)?.checked_mul(3)?;
    let norms = dim.checked_mul(2)?;
    let per_layer = attention.checked_add(ffn)?.checked_add(norms)?;

    let mut total = embedding.checked_add(per_layer.checked_mul(n_layers)?)?.checked_add(dim)?;
    if !config.shared_classifier {
        if legacy_rope {
            total = total.checked_add(seq_len.checked_mul(config.head_size())?)?;
        }
        total = total.checked_add(embedding)?;
    }

    Some(total)
}

/// Scratch buffers reused by every position and layer.
///
/// Sizes are fixed at construction; nothing here is reallocated during generation.
#[derive(Debug)]
struct RunState {
    /// Residual stream, `[dim]`
    x: Vec<f32>,
    /// Normalized input and attention output, `[dim]`
    xb: Vec<f32>,
    /// Projection output before the residual add, `[dim]`
    xb2: Vec<f32>,
    /// FFN gate, `[hidden_dim]`
    hb: Vec<f32>,
    /// FFN up projection, `[hidden_dim]`
    hb2: Vec<f32>,
    /// Query, `[dim]`
    q: Vec<f32>,
    /// `[n_layers, seq_len, kv_dim]`
    key_cache: Vec<f32>,
    /// `[n_layers, seq_len, kv_dim]`
    value_cache: Vec<f32>,
    /// Attention scores, `[n_heads, seq_len]`
    att: Vec<f32>,
    /// `[vocab_size]`
    logits: Vec<f32>,
    noise: XorShiftRng,
}

impl RunState {
    fn new(config: &ModelConfig) -> LoadResult<Self> {
        let ModelConfig { dim, hidden_dim, n_layers, n_heads, vocab_size, seq_len, .. } = *config;

        let cache_len = n_layers
            .checked_mul(seq_len)
            .and_then(|len| len.checked_mul(config.kv_dim()))
            .ok_or(LoadError::Allocation { what: "key/value cache", bytes: usize::MAX })?;

        Ok(Self {
            x: zeroed(dim, "residual stream")?,
            xb: zeroed(dim, "attention scratch")?,
            xb2: zeroed(dim, "attention scratch")?,
            hb: zeroed(hidden_dim, "ffn scratch")?,
            hb2: zeroed(hidden_dim, "ffn scratch")?,
            q: zeroed(dim, "query buffer")?,
            key_cache: zeroed(cache_len, "key cache")?,
            value_cache: zeroed(cache_len, "value cache")?,
            att: zeroed(n_heads * seq_len, "attention scores")?,
            logits: zeroed(vocab_size, "logits")?,
            noise: XorShiftRng::new(NOISE_STREAM),
        })
    }

    fn reset(&mut self, seed: u64) {
        self.key_cache.fill(0.0);
        self.value_cache.fill(0.0);
        self.noise = XorShiftRng::new(seed ^ NOISE_STREAM);
    }
}

/// Loads a [`Transformer`] from a checkpoint file.
#[derive(Debug)]
pub struct TransformerBuilder {
    checkpoint_path: PathBuf,
    ctx_length: Option<usize>,
}

impl TransformerBuilder {
    pub fn new(checkpoint_path: impl AsRef<Path>) -> Self {
        Self { checkpoint_path: checkpoint_path.as_ref().to_path_buf(), ctx_length: None }
    }

    /// Shrinks the context window; values of 0 or above the checkpoint's `seq_len` are ignored.
    pub fn with_ctx_length(mut self, ctx_length: Option<usize>) -> Self {
        self.ctx_length = ctx_length;
        self
    }

    pub fn build(self) -> LoadResult<Transformer> {
        let path = self.checkpoint_path.as_path();

        let file = File::open(path).map_err(|err| LoadError::io(path, err))?;
        let file_len = file.metadata().map_err(|err| LoadError::io(path, err))?.len();
        let mut reader = BufReader::new(file);

        let mut config = read_config(&mut reader, path)?;
        info!(
            "Model: dim={} hidden_dim={} layers={} heads={} kv_heads={} vocab={} seq_len={} shared_classifier={}",
            config.dim,
            config.hidden_dim,
            config.n_layers,
            config.n_heads,
            config.n_kv_heads,
            config.vocab_size,
            config.seq_len,
            config.shared_classifier
        );

        let available = usize::try_from(file_len.saturating_sub(HEADER_SIZE as u64) / 4).unwrap_or(usize::MAX);
        let needed = TransformerWeights::required_floats(&config, available)?;
        info!("Reading {needed} weight floats ({} bytes)", needed * std::mem::size_of::<f32>());

        let region = read_f32_region(&mut reader, needed, path)?;
        // the layout follows the on-disk seq_len, the override only affects the run state
        let weights = TransformerWeights::from_region(&config, region)?;

        if let Some(ctx_length) = self.ctx_length.filter(|&len| len > 0 && len < config.seq_len) {
            info!("Context window shrunk from {} to {ctx_length}", config.seq_len);
            config.seq_len = ctx_length;
        }

        Transformer::new(config, weights)
    }
}
