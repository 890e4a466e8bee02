use log::warn;

use crate::layers::softmax;

/// Replacement for a zero seed; xorshift never leaves the all-zero state.
const FALLBACK_SEED: u64 = 0x9E37_79B9_7F4A_7C15;

/// Multiplier mixed into the state before every generation step.
const STEP_MIX: u64 = 6364136223846793005;

/// Amplitude of the uniform noise added to every logit.
const LOGIT_NOISE: f32 = 0.2;

/// xorshift64* generator shared by the sampler and the residual-noise injection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XorShiftRng {
    state: u64,
}

impl XorShiftRng {
    pub fn new(seed: u64) -> Self {
        Self { state: if seed == 0 { FALLBACK_SEED } else { seed } }
    }

    pub fn next_u32(&mut self) -> u32 {
        self.state ^= self.state >> 12;
        self.state ^= self.state << 25;
        self.state ^= self.state >> 27;
        ((self.state.wrapping_mul(0x2545F4914F6CDD1D)) >> 32) as u32
    }

    /// Returns a random float in [0, 1).
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u32() >> 8) as f32 / 16777216.0
    }

    /// Decorrelates successive positions of one run.
    pub fn mix_step(&mut self, pos: usize) {
        self.state ^= (pos as u64).wrapping_mul(STEP_MIX).wrapping_add(1);
        if self.state == 0 {
            self.state = FALLBACK_SEED;
        }
    }
}

/// Stores a probability and its associated index (token id).
#[derive(Clone, Copy, Debug, Default)]
pub struct ProbIndex {
    pub prob: f32,
    pub index: usize,
}

/// Noisy nucleus sampler.
///
/// Logits are scaled by the temperature, perturbed with small uniform noise, turned into
/// probabilities and sorted in descending order; the token at which the running sum first
/// reaches `topp` is selected. The noise is the only source of randomness, which keeps a
/// tiny model from looping on the same continuation.
#[derive(Debug)]
pub struct Sampler {
    pub probindex: Vec<ProbIndex>,
    pub temperature: f32,
    pub topp: f32,
    seed: u64,
    rng: XorShiftRng,
}

impl Sampler {
    /// Creates a new sampler with the given vocabulary size, temperature, top-p, and RNG seed.
    ///
    /// # Arguments
    /// * `vocab_size` - Size of the vocabulary, fixes the scratch buffer size
    /// * `temperature` - Temperature in (0, 2]; anything else falls back to 1.0 on first use
    /// * `topp` - Cumulative probability threshold, clamped to [0, 1]
    /// * `rng_seed` - Random seed; every run restarts from it
    pub fn new(vocab_size: usize, temperature: f32, topp: f32, rng_seed: u64) -> Self {
        let clamped = if topp.is_nan() { 1.0 } else { topp.clamp(0.0, 1.0) };
        if clamped != topp {
            warn!("Top-p {topp} outside [0, 1], using {clamped}");
        }

        Self {
            probindex: vec![ProbIndex::default(); vocab_size],
            temperature,
            topp: clamped,
            seed: rng_seed,
            rng: XorShiftRng::new(rng_seed),
        }
    }

    /// Restarts the random stream from the construction seed.
    pub fn reset(&mut self) {
        self.rng = XorShiftRng::new(self.seed);
    }

    /// Mixes the generation position into the random state.
    pub fn advance(&mut self, pos: usize) {
        self.rng.mix_step(pos);
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Returns the index of the maximum probability (first one on ties).
    fn sample_argmax(probabilities: &[f32]) -> usize {
        probabilities
            .iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (i, &p)| if p > best.1 { (i, p) } else { best })
            .0
    }

    fn validate_temperature(&mut self) {
        if !(self.temperature > 0.0 && self.temperature <= 2.0) {
            warn!("Invalid temperature: {}, resetting to 1.0", self.temperature);
            self.temperature = 1.0;
        }
    }

    /// Samples a token index from logits; `logits` is overwritten with probabilities.
    pub fn sample(&mut self, logits: &mut [f32]) -> usize {
        debug_assert_eq!(logits.len(), self.probindex.len(), "logits do not match the vocabulary");
        self.validate_temperature();

        if self.temperature != 1.0 {
            logits.iter_mut().for_each(|logit| *logit /= self.temperature);
        }

        for logit in logits.iter_mut() {
            *logit += (self.rng.next_f32() - 0.5) * LOGIT_NOISE;
        }

        softmax(logits);

        for (slot, (index, &prob)) in self.probindex.iter_mut().zip(logits.iter().enumerate()) {
            *slot = ProbIndex { prob, index };
        }

        // stable sort: equal probabilities keep ascending token order
        self.probindex.sort_by(|a, b| b.prob.total_cmp(&a.prob));

        let mut cumulative_prob = 0.0f32;
        for candidate in &self.probindex {
            cumulative_prob += candidate.prob;
            if cumulative_prob >= self.topp {
                return candidate.index;
            }
        }

        Self::sample_argmax(logits)
    }
}
