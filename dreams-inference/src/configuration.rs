use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::error::{LoadError, LoadResult};
use byteorder::{LittleEndian, ReadBytesExt};

/// Size of the checkpoint header in bytes (7 i32 fields)
pub const HEADER_SIZE: usize = 28;

/// Hyperparameters of a llama2-style checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelConfig {
    pub dim: usize,
    pub hidden_dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub vocab_size: usize,
    pub seq_len: usize,
    /// Classifier aliases the token embedding table.
    pub shared_classifier: bool,
}

impl ModelConfig {
    pub fn head_size(&self) -> usize {
        self.dim / self.n_heads
    }

    /// Width of one key (or value) row in the cache.
    pub fn kv_dim(&self) -> usize {
        self.dim * self.n_kv_heads / self.n_heads
    }

    /// Number of query heads sharing one key/value head.
    pub fn kv_mul(&self) -> usize {
        self.n_heads / self.n_kv_heads
    }
}

/// Raw header as stored on disk.
#[derive(Debug, Clone, Copy)]
struct Header {
    dim: i32,
    hidden_dim: i32,
    n_layers: i32,
    n_heads: i32,
    n_kv_heads: i32,
    vocab_size: i32,
    seq_len: i32,
}

impl TryFrom<Header> for ModelConfig {
    type Error = LoadError;

    fn try_from(header: Header) -> LoadResult<Self> {
        validate_header(&header)?;

        Ok(ModelConfig {
            dim: header.dim as usize,
            hidden_dim: header.hidden_dim as usize,
            n_layers: header.n_layers as usize,
            n_heads: header.n_heads as usize,
            n_kv_heads: header.n_kv_heads as usize,
            vocab_size: header.vocab_size.unsigned_abs() as usize,
            seq_len: header.seq_len as usize,
            // negative vocabulary size marks a classifier that reuses the embedding table
            shared_classifier: header.vocab_size < 0,
        })
    }
}

/// Reads and validates the model configuration from the start of a checkpoint.
///
/// The header is 7 consecutive little-endian i32 values:
/// `dim, hidden_dim, n_layers, n_heads, n_kv_heads, vocab_size, seq_len`.
/// Running out of bytes surfaces as an [`std::io::Error`] with `UnexpectedEof`.
pub fn read_config<R: Read>(reader: &mut R, path: &Path) -> LoadResult<ModelConfig> {
    read_header(reader).map_err(|err| LoadError::io(path, err))?.try_into()
}

/// Reads only the header of the checkpoint at `path`, without touching the weights.
pub fn load_config(path: &Path) -> LoadResult<ModelConfig> {
    let file = File::open(path).map_err(|err| LoadError::io(path, err))?;
    read_config(&mut BufReader::new(file), path)
}

fn read_header<R: Read>(reader: &mut R) -> std::io::Result<Header> {
    macro_rules! read_i32 {
        () => {
            reader.read_i32::<LittleEndian>()?
        };
    }

    Ok(Header {
        dim: read_i32!(),
        hidden_dim: read_i32!(),
        n_layers: read_i32!(),
        n_heads: read_i32!(),
        n_kv_heads: read_i32!(),
        vocab_size: read_i32!(),
        seq_len: read_i32!(),
    })
}

/// Validates the header to ensure the derived tensor shapes are well formed.
fn validate_header(header: &Header) -> LoadResult<()> {
    let dimensions = [
        ("dim", header.dim),
        ("hidden_dim", header.hidden_dim),
        ("n_layers", header.n_layers),
        ("n_heads", header.n_heads),
        ("n_kv_heads", header.n_kv_heads),
        ("seq_len", header.seq_len),
    ];

    for (name, value) in dimensions {
        if value <= 0 {
            return Err(LoadError::InvalidHeader(format!("{name} must be positive, got {value}")));
        }
    }

    if header.vocab_size == 0 || header.vocab_size == i32::MIN {
        return Err(LoadError::InvalidHeader(format!("invalid vocab_size {}", header.vocab_size)));
    }

    if header.dim % header.n_heads != 0 {
        return Err(LoadError::InvalidHeader(format!(
            "dim {} is not divisible by n_heads {}",
            header.dim, header.n_heads
        )));
    }

    if header.n_kv_heads > header.n_heads || header.n_heads % header.n_kv_heads != 0 {
        return Err(LoadError::InvalidHeader(format!(
            "n_heads {} is not a multiple of n_kv_heads {}",
            header.n_heads, header.n_kv_heads
        )));
    }

    if (header.dim / header.n_heads) % 2 != 0 {
        return Err(LoadError::InvalidHeader(format!(
            "head size {} must be even for rotary embedding",
            header.dim / header.n_heads
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn header_bytes(values: [i32; 7]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn reads_shared_classifier_from_negative_vocab() {
        let bytes = header_bytes([16, 32, 2, 4, 2, -8, 12]);
        let config = read_config(&mut Cursor::new(bytes), Path::new("model.bin")).unwrap();

        assert_eq!(config.vocab_size, 8);
        assert!(config.shared_classifier);
        assert_eq!(config.head_size(), 4);
        assert_eq!(config.kv_dim(), 8);
        assert_eq!(config.kv_mul(), 2);
    }

    #[test]
    fn positive_vocab_keeps_separate_classifier() {
        let bytes = header_bytes([16, 32, 2, 4, 4, 8, 12]);
        let config = read_config(&mut Cursor::new(bytes), Path::new("model.bin")).unwrap();

        assert!(!config.shared_classifier);
        assert_eq!(config.kv_dim(), 16);
    }

    #[test]
    fn truncated_header_is_io_error() {
        let mut bytes = header_bytes([16, 32, 2, 4, 4, 8, 12]);
        bytes.truncate(HEADER_SIZE - 3);

        let err = read_config(&mut Cursor::new(bytes), Path::new("model.bin")).unwrap_err();
        assert!(matches!(err, LoadError::Io { .. }), "{err}");
    }

    #[test]
    fn rejects_inconsistent_heads() {
        for values in [[15, 32, 2, 4, 4, 8, 12], [16, 32, 2, 4, 3, 8, 12], [16, 32, 2, 2, 4, 8, 12], [16, 0, 2, 4, 4, 8, 12]]
        {
            let err = read_config(&mut Cursor::new(header_bytes(values)), Path::new("model.bin")).unwrap_err();
            assert!(matches!(err, LoadError::InvalidHeader(_)), "{values:?}: {err}");
        }
    }
}
