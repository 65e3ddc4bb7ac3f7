use ndarray::{Array2, ArrayView1, ArrayView2};

use super::utils::{is_zero_vector, l2_norm};

/// Class embedding table handed to the detector, one row per class.
///
/// Row `r` belongs to the class the current `IndexAligner` maps `r` to. Every
/// non-zero row has unit L2 norm. A committed table is shared behind an
/// `Arc` and never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingTable {
    data: Array2<f32>,
}

impl EmbeddingTable {
    /// All-zero table of the given shape
    pub fn zeros(rows: usize, dim: usize) -> Self {
        Self {
            data: Array2::zeros((rows, dim)),
        }
    }

    pub(crate) fn from_array(data: Array2<f32>) -> Self {
        Self { data }
    }

    pub fn rows(&self) -> usize {
        self.data.nrows()
    }

    pub fn dim(&self) -> usize {
        self.data.ncols()
    }

    pub fn is_empty(&self) -> bool {
        self.rows() == 0
    }

    pub fn row(&self, index: usize) -> Option<ArrayView1<'_, f32>> {
        (index < self.rows()).then(|| self.data.row(index))
    }

    pub fn view(&self) -> ArrayView2<'_, f32> {
        self.data.view()
    }

    /// True when every row is zero, as produced by the zero-fill fallback
    pub fn is_all_zero(&self) -> bool {
        self.data.iter().all(|&x| x == 0.0)
    }

    /// Norm of every row, in row order
    pub fn row_norms(&self) -> Vec<f32> {
        self.data.outer_iter().map(l2_norm).collect()
    }

    /// Rows that carry an embedding
    pub fn non_zero_rows(&self) -> usize {
        self.data.outer_iter().filter(|row| !is_zero_vector(*row)).count()
    }

    /// Largest absolute element-wise difference; `None` when shapes differ
    pub fn max_abs_diff(&self, other: &EmbeddingTable) -> Option<f32> {
        if self.data.dim() != other.data.dim() {
            return None;
        }
        Some(
            self.data
                .iter()
                .zip(other.data.iter())
                .map(|(a, b)| (a - b).abs())
                .fold(0.0, f32::max),
        )
    }
}
