use std::ops::Range;

use crate::tensor::dot;

/// Epsilon value for numerical stability in normalization
const EPSILON: f32 = 1e-5;

/// Base frequency for RoPE (Rotary Position Embedding)
const ROPE_BASE_FREQ: f32 = 10000.0;

/// RMS Layer Normalization over a borrowed weight vector.
///
/// ```text
/// RMSNorm(x) = x / sqrt(mean(x²) + ε) * γ
/// ```
#[derive(Debug, Clone, Copy)]
pub struct RmsNorm<'a> {
    pub weight: &'a [f32],
}

impl<'a> RmsNorm<'a> {
    pub fn new(weight: &'a [f32]) -> Self {
        Self { weight }
    }

    pub fn forward(&self, output: &mut [f32], input: &[f32]) {
        debug_assert_eq!(output.len(), input.len());
        debug_assert_eq!(input.len(), self.weight.len());

        let scale = rms_scale(input);
        output.iter_mut().zip(input).zip(self.weight).for_each(|((out, &inp), &w)| {
            *out = w * (scale * inp);
        });
    }

    pub fn forward_inplace(&self, x: &mut [f32]) {
        debug_assert_eq!(x.len(), self.weight.len());

        let scale = rms_scale(x);
        x.iter_mut().zip(self.weight).for_each(|(val, &w)| {
            *val = w * (scale * *val);
        });
    }
}

fn rms_scale(x: &[f32]) -> f32 {
    let sum_of_squares = x.iter().map(|&v| v * v).sum::<f32>();
    1.0f32 / ((sum_of_squares / x.len() as f32) + EPSILON).sqrt()
}

/// Applies softmax normalization to a slice in-place.
///
/// The maximum is subtracted before exponentiation so large logits do not overflow.
pub fn softmax(x: &mut [f32]) {
    let max_val = x.iter().fold(f32::NEG_INFINITY, |acc, &val| acc.max(val));
    let sum = x
        .iter_mut()
        .map(|val| {
            *val = (*val - max_val).exp();
            *val
        })
        .sum::<f32>();
    let inv_sum = sum.recip();
    x.iter_mut().for_each(|val| *val *= inv_sum);
}

/// Rotary Position Embedding with interleaved pairs.
///
/// Each even component `i` forms a pair with `i + 1` and is rotated by
/// `pos / 10000^((i mod head_size) / head_size)`.
#[derive(Debug, Clone, Copy)]
pub struct Rope {
    pub head_size: usize,
}

impl Rope {
    pub fn new(head_size: usize) -> Self {
        Self { head_size }
    }

    /// Rotates the query vector and the (possibly narrower) key vector in place.
    ///
    /// With grouped-query attention `key.len() < query.len()`, so only the pairs that
    /// exist in the key are rotated there.
    pub fn apply(&self, query: &mut [f32], key: &mut [f32], pos: usize) {
        for i in (0..query.len()).step_by(2) {
            let head_dim = i % self.head_size;
            let freq = 1.0f32 / ROPE_BASE_FREQ.powf(head_dim as f32 / self.head_size as f32);
            let angle = pos as f32 * freq;
            let (sin, cos) = angle.sin_cos();

            rotate_pair(&mut query[i..i + 2], cos, sin);
            if i < key.len() {
                rotate_pair(&mut key[i..i + 2], cos, sin);
            }
        }
    }
}

#[inline]
fn rotate_pair(pair: &mut [f32], cos: f32, sin: f32) {
    let (v0, v1) = (pair[0], pair[1]);
    pair[0] = v0 * cos - v1 * sin;
    pair[1] = v0 * sin + v1 * cos;
}

/// SwiGLU gate: `hb[i] = silu(hb[i]) * hb2[i]` with `silu(v) = v * sigmoid(v)`.
pub fn swiglu(hb: &mut [f32], hb2: &[f32]) {
    debug_assert_eq!(hb.len(), hb2.len());

    hb.iter_mut().zip(hb2).for_each(|(gate_val, &linear_val)| {
        let swish_output = *gate_val * (1.0f32 + (-*gate_val).exp()).recip();
        *gate_val = swish_output * linear_val;
    });
}

/// Dimensions shared by every head of one attention call.
#[derive(Debug, Clone, Copy)]
pub struct AttentionShape {
    pub pos: usize,
    pub head_size: usize,
    pub kv_dim: usize,
    pub kv_mul: usize,
    pub seq_len: usize,
}

/// Scaled dot-product attention for a contiguous range of query heads.
///
/// - `query` is the full query vector of the current position.
/// - `keys`/`values` are this layer's cache rows `0..=pos`, each `kv_dim` wide.
/// - `scores` holds `seq_len` floats per head in `heads`, `output` holds `head_size` per head.
///
/// Used verbatim by both lanes of the fork/join scheduler.
pub fn attend(
    heads: Range<usize>,
    query: &[f32],
    keys: &[f32],
    values: &[f32],
    scores: &mut [f32],
    output: &mut [f32],
    shape: &AttentionShape,
) {
    let AttentionShape { pos, head_size, kv_dim, kv_mul, seq_len } = *shape;
    let attention_scale = (head_size as f32).sqrt().recip();

    debug_assert_eq!(scores.len(), heads.len() * seq_len);
    debug_assert_eq!(output.len(), heads.len() * head_size);

    for ((head_idx, att_slice), out_slice) in
        heads.zip(scores.chunks_exact_mut(seq_len)).zip(output.chunks_exact_mut(head_size))
    {
        let q = &query[head_idx * head_size..(head_idx + 1) * head_size];
        let kv_head_offset = (head_idx / kv_mul) * head_size;
        let att_head = &mut att_slice[..=pos];

        att_head.iter_mut().enumerate().for_each(|(time_step, att_score)| {
            let k_start = time_step * kv_dim + kv_head_offset;
            *att_score = dot(q, &keys[k_start..k_start + head_size]) * attention_scale;
        });

        softmax(att_head);

        out_slice.fill(0.0);
        for (time_step, &attention_weight) in att_head.iter().enumerate() {
            let v_start = time_step * kv_dim + kv_head_offset;
            out_slice
                .iter_mut()
                .zip(&values[v_start..v_start + head_size])
                .for_each(|(out, &value)| *out += attention_weight * value);
        }
    }
}
