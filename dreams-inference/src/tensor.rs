use std::ops::Range;

/// Location of one tensor inside the flat weight region.
///
/// Views are computed once when the checkpoint is laid out and never change afterwards,
/// so every slice handed to the forward pass is a read-only borrow of the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorView {
    pub offset: usize,
    pub len: usize,
}

impl TensorView {
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.len
    }

    /// Splits the view into `count` equally sized consecutive views.
    pub fn split(&self, count: usize) -> Vec<TensorView> {
        debug_assert_eq!(self.len % count, 0, "view of {} floats does not split into {count}", self.len);
        let each = self.len / count;
        (0..count).map(|i| TensorView { offset: self.offset + i * each, len: each }).collect()
    }
}

/// Dot product of one weight row with the input vector.
///
/// Both halves of a forked matmul go through this function, so the summation order for a
/// given row never depends on which lane computed it.
#[inline]
pub fn dot(row: &[f32], x: &[f32]) -> f32 {
    debug_assert_eq!(row.len(), x.len());
    row.iter().zip(x).fold(0.0f32, |acc, (&w, &v)| acc + w * v)
}

/// Computes `out[i] = W[i, :] · x` for the rows of `w` that correspond to `out`.
///
/// `w` holds exactly `out.len()` rows of `x.len()` columns, row-major.
pub fn matmul_rows(out: &mut [f32], x: &[f32], w: &[f32]) {
    let n = x.len();
    assert_eq!(w.len(), out.len() * n, "weight slice does not match {} rows of {n} columns", out.len());

    out.iter_mut().zip(w.chunks_exact(n)).for_each(|(out_val, row)| *out_val = dot(row, x));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matmul_rows_multiplies_row_major() {
        // 2x3 matrix
        let w = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let x = [1.0, 0.0, -1.0];
        let mut out = [0.0; 2];

        matmul_rows(&mut out, &x, &w);

        assert_eq!(out, [-2.0, -2.0]);
    }

    #[test]
    fn matmul_rows_accepts_empty_output() {
        let mut out: [f32; 0] = [];
        matmul_rows(&mut out, &[1.0, 2.0], &[]);
    }

    #[test]
    fn view_splits_into_consecutive_layers() {
        let view = TensorView { offset: 10, len: 12 };
        let parts = view.split(3);

        assert_eq!(parts, vec![
            TensorView { offset: 10, len: 4 },
            TensorView { offset: 14, len: 4 },
            TensorView { offset: 18, len: 4 }
        ]);
    }
}
