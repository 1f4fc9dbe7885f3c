//! Tensor Operations
//!
//! A minimal dense tensor used by every layer, head and the optimizer.
//! Tensors store a flat `Vec<f32>` in row-major order together with their
//! shape. Almost everything in this crate is a matrix `[rows, cols]` (a batch
//! of row vectors) or a vector `[n]`, so only those layouts get dedicated
//! kernels.
//!
//! ## Example
//!
//! ```rust
//! use tritask::Tensor;
//!
//! let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]);
//! let w = Tensor::new(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], vec![3, 2]);
//! let y = x.matmul(&w);
//! assert_eq!(y.shape, vec![2, 2]);
//! assert_eq!(y.data, vec![4.0, 5.0, 10.0, 11.0]);
//! ```
//!
//! ## Performance
//!
//! Large matrix products use a cache-blocked kernel parallelised over output
//! row blocks with Rayon. Element-wise operations are parallel as well. Small
//! inputs take a sequential path so that tiny heads do not pay thread
//! overhead.

use rayon::prelude::*;

/// Work threshold (multiply-adds) above which matmul goes parallel
const PARALLEL_MATMUL_WORK: usize = 4_096;

/// Element count above which element-wise kernels go parallel
pub(crate) const PARALLEL_ELEMENTS: usize = 1_000;

/// A dense row-major array of `f32`
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    /// Flat storage of all tensor elements
    pub data: Vec<f32>,
    /// Dimensions of the tensor
    pub shape: Vec<usize>,
}

impl Tensor {
    /// Create a tensor from flat data and a shape
    ///
    /// # Panics
    ///
    /// Panics if the product of the shape does not equal the data length.
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
        let expected: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            expected,
            "Data length ({}) doesn't match shape {:?} (expected {})",
            data.len(),
            shape,
            expected
        );
        Self { data, shape }
    }

    /// Create a tensor filled with zeros
    pub fn zeros(shape: Vec<usize>) -> Self {
        let size = shape.iter().product();
        Self::new(vec![0.0; size], shape)
    }

    /// Create a zero tensor with the same shape as `self`
    pub fn zeros_like(&self) -> Self {
        Self::zeros(self.shape.clone())
    }

    /// Create a `[n]` vector
    pub fn vector(data: Vec<f32>) -> Self {
        let n = data.len();
        Self::new(data, vec![n])
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of rows of a matrix (or 1 for a vector)
    pub fn rows(&self) -> usize {
        match self.shape.len() {
            1 => 1,
            2 => self.shape[0],
            _ => panic!("rows() requires a 1D or 2D tensor, got {:?}", self.shape),
        }
    }

    /// Number of columns of a matrix (or the length of a vector)
    pub fn cols(&self) -> usize {
        *self.shape.last().expect("cols() on a scalar tensor")
    }

    /// Borrow row `i` of a matrix
    pub fn row(&self, i: usize) -> &[f32] {
        let cols = self.cols();
        &self.data[i * cols..(i + 1) * cols]
    }

    /// Matrix multiplication `[m, k] @ [k, n] -> [m, n]`
    ///
    /// # Panics
    ///
    /// Panics if either operand is not 2D or the inner dimensions differ.
    pub fn matmul(&self, other: &Tensor) -> Tensor {
        assert!(
            self.shape.len() == 2 && other.shape.len() == 2,
            "Unsupported matmul shapes: {:?} @ {:?}",
            self.shape,
            other.shape
        );
        assert_eq!(
            self.shape[1], other.shape[0],
            "Matrix dimensions incompatible: [{}, {}] @ [{}, {}]",
            self.shape[0], self.shape[1], other.shape[0], other.shape[1]
        );

        let m = self.shape[0];
        let k = self.shape[1];
        let n = other.shape[1];

        if m * n * k >= PARALLEL_MATMUL_WORK {
            return self.matmul_parallel_blocked(other, m, n, k);
        }

        let mut result = vec![0.0; m * n];
        for i in 0..m {
            let out_row = &mut result[i * n..(i + 1) * n];
            for l in 0..k {
                let a_val = self.data[i * k + l];
                Self::axpy(a_val, &other.data[l * n..(l + 1) * n], out_row);
            }
        }
        Tensor::new(result, vec![m, n])
    }

    /// `result[j] += a * b[j]`, written so LLVM can vectorise it
    #[inline(always)]
    fn axpy(a: f32, b: &[f32], result: &mut [f32]) {
        for (r, &b_val) in result.iter_mut().zip(b) {
            *r += a * b_val;
        }
    }

    /// Cache-blocked matmul parallelised over blocks of output rows
    fn matmul_parallel_blocked(&self, other: &Tensor, m: usize, n: usize, k: usize) -> Tensor {
        // 8x8 blocks keep the working set inside L1
        const BLOCK: usize = 8;

        let mut result = vec![0.0; m * n];
        result
            .par_chunks_mut(BLOCK * n)
            .enumerate()
            .for_each(|(block_i, out_block)| {
                let i_start = block_i * BLOCK;
                let i_end = (i_start + BLOCK).min(m);
                for j_start in (0..n).step_by(BLOCK) {
                    let j_end = (j_start + BLOCK).min(n);
                    for k_start in (0..k).step_by(BLOCK) {
                        let k_end = (k_start + BLOCK).min(k);
                        for i in i_start..i_end {
                            let row_offset = (i - i_start) * n;
                            for l in k_start..k_end {
                                Self::axpy(
                                    self.data[i * k + l],
                                    &other.data[l * n + j_start..l * n + j_end],
                                    &mut out_block[row_offset + j_start..row_offset + j_end],
                                );
                            }
                        }
                    }
                }
            });

        Tensor::new(result, vec![m, n])
    }

    /// Transpose of a matrix
    pub fn transpose(&self) -> Tensor {
        assert_eq!(self.shape.len(), 2, "transpose() requires a 2D tensor");
        let rows = self.shape[0];
        let cols = self.shape[1];
        let mut result = vec![0.0; rows * cols];
        for i in 0..rows {
            for j in 0..cols {
                result[j * rows + i] = self.data[i * cols + j];
            }
        }
        Tensor::new(result, vec![cols, rows])
    }

    /// Element-wise addition with broadcasting of a trailing vector
    ///
    /// Supports an exact shape match, and `[rows, n] + [n]` (bias addition).
    pub fn add(&self, other: &Tensor) -> Tensor {
        if self.shape == other.shape {
            return self.zip_map(other, |a, b| a + b);
        }

        if self.shape.len() == 2 && other.shape.len() == 1 && other.len() == self.cols() {
            let cols = self.cols();
            let data = self
                .data
                .iter()
                .enumerate()
                .map(|(i, &x)| x + other.data[i % cols])
                .collect();
            return Tensor::new(data, self.shape.clone());
        }

        panic!(
            "Unsupported broadcast for add: {:?} + {:?}",
            self.shape, other.shape
        );
    }

    /// In-place element-wise addition of a tensor of identical shape
    pub fn add_assign(&mut self, other: &Tensor) {
        assert_eq!(
            self.shape, other.shape,
            "Shapes must match for in-place addition"
        );
        if self.len() > PARALLEL_ELEMENTS {
            self.data
                .par_iter_mut()
                .zip(&other.data)
                .for_each(|(a, &b)| *a += b);
        } else {
            for (a, &b) in self.data.iter_mut().zip(&other.data) {
                *a += b;
            }
        }
    }

    /// Apply `f` to every element
    pub fn map<F>(&self, f: F) -> Tensor
    where
        F: Fn(f32) -> f32 + Sync + Send,
    {
        let data = if self.len() > PARALLEL_ELEMENTS {
            self.data.par_iter().map(|&x| f(x)).collect()
        } else {
            self.data.iter().map(|&x| f(x)).collect()
        };
        Tensor::new(data, self.shape.clone())
    }

    /// Combine two tensors of identical shape element by element
    pub fn zip_map<F>(&self, other: &Tensor, f: F) -> Tensor
    where
        F: Fn(f32, f32) -> f32 + Sync + Send,
    {
        assert_eq!(
            self.shape, other.shape,
            "Shapes must match: {:?} vs {:?}",
            self.shape, other.shape
        );
        let data = if self.len() > PARALLEL_ELEMENTS {
            self.data
                .par_iter()
                .zip(&other.data)
                .map(|(&a, &b)| f(a, b))
                .collect()
        } else {
            self.data
                .iter()
                .zip(&other.data)
                .map(|(&a, &b)| f(a, b))
                .collect()
        };
        Tensor::new(data, self.shape.clone())
    }

    /// Sum over rows: `[rows, cols] -> [cols]`
    pub fn sum_rows(&self) -> Tensor {
        let cols = self.cols();
        let mut sums = vec![0.0; cols];
        for row in self.data.chunks(cols) {
            for (s, &x) in sums.iter_mut().zip(row) {
                *s += x;
            }
        }
        Tensor::vector(sums)
    }

    /// Concatenate two matrices with the same row count along the feature axis
    pub fn concat_cols(&self, other: &Tensor) -> Tensor {
        assert_eq!(
            self.rows(),
            other.rows(),
            "Row counts must match for concatenation"
        );
        let rows = self.rows();
        let (ca, cb) = (self.cols(), other.cols());
        let mut data = Vec::with_capacity(rows * (ca + cb));
        for i in 0..rows {
            data.extend_from_slice(self.row(i));
            data.extend_from_slice(other.row(i));
        }
        Tensor::new(data, vec![rows, ca + cb])
    }

    /// Split a matrix along the feature axis at column `at`
    ///
    /// Inverse of [`Tensor::concat_cols`].
    pub fn split_cols(&self, at: usize) -> (Tensor, Tensor) {
        let rows = self.rows();
        let cols = self.cols();
        assert!(at <= cols, "split point {} beyond {} columns", at, cols);
        let mut left = Vec::with_capacity(rows * at);
        let mut right = Vec::with_capacity(rows * (cols - at));
        for i in 0..rows {
            let row = self.row(i);
            left.extend_from_slice(&row[..at]);
            right.extend_from_slice(&row[at..]);
        }
        (
            Tensor::new(left, vec![rows, at]),
            Tensor::new(right, vec![rows, cols - at]),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matmul_small() {
        let a = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);
        let b = Tensor::new(vec![5.0, 6.0, 7.0, 8.0], vec![2, 2]);
        assert_eq!(a.matmul(&b).data, vec![19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_matmul_parallel_matches_sequential() {
        let m = 19;
        let k = 23;
        let n = 17;
        let a = Tensor::new((0..m * k).map(|i| (i % 7) as f32 - 3.0).collect(), vec![m, k]);
        let b = Tensor::new((0..k * n).map(|i| (i % 5) as f32 * 0.5).collect(), vec![k, n]);

        let blocked = a.matmul(&b);

        let mut expected = vec![0.0; m * n];
        for i in 0..m {
            for j in 0..n {
                for l in 0..k {
                    expected[i * n + j] += a.data[i * k + l] * b.data[l * n + j];
                }
            }
        }
        for (x, y) in blocked.data.iter().zip(&expected) {
            assert!((x - y).abs() < 1e-4);
        }
    }

    #[test]
    fn test_transpose() {
        let t = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]);
        let tt = t.transpose();
        assert_eq!(tt.shape, vec![3, 2]);
        assert_eq!(tt.data, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_add_bias_broadcast() {
        let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);
        let b = Tensor::vector(vec![10.0, 20.0]);
        assert_eq!(x.add(&b).data, vec![11.0, 22.0, 13.0, 24.0]);
    }

    #[test]
    fn test_concat_then_split_restores_halves() {
        let a = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);
        let b = Tensor::new(vec![5.0, 6.0, 7.0, 8.0, 9.0, 10.0], vec![2, 3]);
        let joined = a.concat_cols(&b);
        assert_eq!(joined.shape, vec![2, 5]);
        assert_eq!(joined.row(1), &[3.0, 4.0, 8.0, 9.0, 10.0]);

        let (left, right) = joined.split_cols(2);
        assert_eq!(left, a);
        assert_eq!(right, b);
    }

    #[test]
    fn test_sum_rows() {
        let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![3, 2]);
        assert_eq!(x.sum_rows().data, vec![9.0, 12.0]);
    }

    #[test]
    #[should_panic(expected = "doesn't match shape")]
    fn test_new_rejects_bad_shape() {
        Tensor::new(vec![1.0, 2.0, 3.0], vec![2, 2]);
    }
}
