//! Helpers writing toy checkpoints and vocabularies in the on-disk formats.

#![allow(dead_code)]

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Result;
use byteorder::{LittleEndian, WriteBytesExt};
use dreams_inference::{ModelConfig, TransformerWeights};
use tempfile::TempDir;

/// dim=16, 2 layers, 4 query heads sharing 2 key/value heads.
pub const DIM: i32 = 16;
pub const HIDDEN_DIM: i32 = 32;
pub const N_LAYERS: i32 = 2;
pub const N_HEADS: i32 = 4;
pub const N_KV_HEADS: i32 = 2;
pub const SEQ_LEN: i32 = 32;

/// Vocabulary where " cat" (id 3) is the best merge.
pub const CAT_VOCAB: [(&str, f32); 10] = [
    ("<unk>", 0.0),
    ("<s>", 0.0),
    ("</s>", 0.0),
    (" cat", 0.9),
    (" ", 0.0),
    ("c", 0.0),
    ("a", 0.0),
    ("t", 0.0),
    ("at", 0.3),
    ("cat", 0.5),
];

pub struct ToyModel {
    pub dir: TempDir,
    pub checkpoint: PathBuf,
    pub tokenizer: PathBuf,
    pub config: ModelConfig,
}

pub fn header(vocab_size: i32) -> [i32; 7] {
    [DIM, HIDDEN_DIM, N_LAYERS, N_HEADS, N_KV_HEADS, vocab_size, SEQ_LEN]
}

pub fn model_config(vocab_size: usize, shared_classifier: bool) -> ModelConfig {
    ModelConfig {
        dim: DIM as usize,
        hidden_dim: HIDDEN_DIM as usize,
        n_layers: N_LAYERS as usize,
        n_heads: N_HEADS as usize,
        n_kv_heads: N_KV_HEADS as usize,
        vocab_size,
        seq_len: SEQ_LEN as usize,
        shared_classifier,
    }
}

/// Small deterministic weights in [-0.25, 0.25).
pub fn toy_weights(count: usize, seed: u32) -> Vec<f32> {
    let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
    (0..count)
        .map(|_| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            ((state >> 8) as f32 / 16_777_216.0 - 0.5) * 0.5
        })
        .collect()
}

pub fn write_checkpoint(path: &Path, header: [i32; 7], floats: &[f32]) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for value in header {
        writer.write_i32::<LittleEndian>(value)?;
    }
    for &value in floats {
        writer.write_f32::<LittleEndian>(value)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_vocabulary<T: AsRef<[u8]>>(path: &Path, entries: &[(T, f32)]) -> Result<()> {
    let max_token_length = entries.iter().map(|(token, _)| token.as_ref().len()).max().unwrap_or(0);

    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_i32::<LittleEndian>(max_token_length as i32)?;
    for (token, score) in entries {
        let bytes = token.as_ref();
        writer.write_f32::<LittleEndian>(*score)?;
        writer.write_i32::<LittleEndian>(bytes.len() as i32)?;
        writer.write_all(bytes)?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes a checkpoint sized for `entries` plus the vocabulary itself into a fresh directory.
pub fn toy_model<T: AsRef<[u8]>>(entries: &[(T, f32)], shared_classifier: bool) -> Result<ToyModel> {
    let dir = TempDir::new()?;
    let checkpoint = dir.path().join("model.bin");
    let tokenizer = dir.path().join("tok512.bin");

    let config = model_config(entries.len(), shared_classifier);
    let floats = TransformerWeights::required_floats(&config, 0)?;
    let vocab_field = if shared_classifier { -(entries.len() as i32) } else { entries.len() as i32 };

    write_checkpoint(&checkpoint, header(vocab_field), &toy_weights(floats, 7))?;
    write_vocabulary(&tokenizer, entries)?;

    Ok(ToyModel { dir, checkpoint, tokenizer, config })
}
