use std::io::{ErrorKind, Read};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{LoadError, LoadResult};
use crate::tensor::TensorView;

/// Bytes decoded per read when filling the weight region.
const READ_CHUNK_BYTES: usize = 64 * 1024;

/// Hands out consecutive tensor views over a weight region of known length.
#[derive(Debug)]
pub(crate) struct WeightCursor {
    offset: usize,
    len: usize,
}

impl WeightCursor {
    pub fn new(len: usize) -> Self {
        Self { offset: 0, len }
    }

    pub fn take(&mut self, count: usize) -> LoadResult<TensorView> {
        if self.offset + count > self.len {
            return Err(LoadError::InvalidHeader(format!(
                "weight region too small: need {count} floats at offset {}, have {}",
                self.offset, self.len
            )));
        }

        let view = TensorView { offset: self.offset, len: count };
        self.offset += count;
        Ok(view)
    }

    pub fn skip(&mut self, count: usize) -> LoadResult<()> {
        self.take(count).map(|_| ())
    }

    pub fn remaining(&self) -> usize {
        self.len - self.offset
    }
}

/// Allocates a zero-filled scratch buffer, reporting failure instead of aborting.
pub(crate) fn zeroed(len: usize, what: &'static str) -> LoadResult<Vec<f32>> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(len)
        .map_err(|_| LoadError::Allocation { what, bytes: len.saturating_mul(std::mem::size_of::<f32>()) })?;
    buffer.resize(len, 0.0);
    Ok(buffer)
}

/// Reads exactly `count` little-endian f32 values into a freshly reserved buffer.
///
/// The buffer is reserved up front so an oversized checkpoint fails with
/// [`LoadError::Allocation`] instead of aborting inside the allocator.
pub(crate) fn read_f32_region<R: Read>(reader: &mut R, count: usize, path: &Path) -> LoadResult<Vec<f32>> {
    let expected = count * std::mem::size_of::<f32>();

    let mut region = Vec::new();
    region
        .try_reserve_exact(count)
        .map_err(|_| LoadError::Allocation { what: "weight region", bytes: expected })?;

    let mut chunk = vec![0u8; READ_CHUNK_BYTES.min(expected.max(4))];
    let mut actual = 0;

    while actual < expected {
        let want = (expected - actual).min(chunk.len());
        let got = read_full(reader, &mut chunk[..want]).map_err(|err| LoadError::io(path, err))?;
        actual += got;

        if got < want {
            return Err(LoadError::ShortRead { path: path.to_path_buf(), expected, actual });
        }

        region.extend(chunk[..got].chunks_exact(4).map(LittleEndian::read_f32));
    }

    Ok(region)
}

/// Fills `buf` as far as the reader allows and returns the number of bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}
