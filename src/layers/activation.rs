//! Activation and Similarity Functions
//!
//! Element-wise activations used by the heads and the encoder pooler, plus
//! row-wise cosine similarity, each with its derivative for backpropagation.
//!
//! ## ReLU
//!
//! ```text
//! relu(x)  = max(x, 0)
//! relu'(x) = 1 if x > 0 else 0
//! ```
//!
//! ## Tanh
//!
//! ```text
//! tanh'(x) = 1 - tanh(x)²     (computed from the forward output)
//! ```
//!
//! ## Cosine similarity
//!
//! For rows `a`, `b` with norms clamped below at `COSINE_EPS`:
//!
//! ```text
//! cos(a, b) = a·b / (max(|a|, ε) · max(|b|, ε))
//! ∂cos/∂a   = b / (|a||b|) - cos · a / |a|²
//! ```

use crate::tensor::Tensor;

/// Lower clamp on vector norms in cosine similarity
pub const COSINE_EPS: f32 = 1e-8;

pub fn relu_forward(x: &Tensor) -> Tensor {
    x.map(|v| v.max(0.0))
}

/// Gradient of ReLU given the forward *input*
pub fn relu_backward(grad_out: &Tensor, x: &Tensor) -> Tensor {
    grad_out.zip_map(x, |g, v| if v > 0.0 { g } else { 0.0 })
}

pub fn tanh_forward(x: &Tensor) -> Tensor {
    x.map(f32::tanh)
}

/// Gradient of tanh given the forward *output*
pub fn tanh_backward(grad_out: &Tensor, y: &Tensor) -> Tensor {
    grad_out.zip_map(y, |g, t| g * (1.0 - t * t))
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Values reused by [`cosine_similarity_backward`]
#[derive(Clone, Debug)]
pub struct CosineCache {
    pub a: Tensor,
    pub b: Tensor,
    pub norm_a: Vec<f32>,
    pub norm_b: Vec<f32>,
    pub cos: Vec<f32>,
}

/// Row-wise cosine similarity of two `[batch, dim]` matrices
///
/// Returns one value per row, shape `[batch]`.
pub fn cosine_similarity_forward(a: &Tensor, b: &Tensor) -> (Tensor, CosineCache) {
    assert_eq!(a.shape, b.shape, "cosine similarity needs equal shapes");
    let rows = a.rows();

    let mut norm_a = Vec::with_capacity(rows);
    let mut norm_b = Vec::with_capacity(rows);
    let mut cos = Vec::with_capacity(rows);
    for i in 0..rows {
        let (ra, rb) = (a.row(i), b.row(i));
        let dot: f32 = ra.iter().zip(rb).map(|(x, y)| x * y).sum();
        let na = ra.iter().map(|x| x * x).sum::<f32>().sqrt();
        let nb = rb.iter().map(|x| x * x).sum::<f32>().sqrt();
        cos.push(dot / (na.max(COSINE_EPS) * nb.max(COSINE_EPS)));
        norm_a.push(na);
        norm_b.push(nb);
    }

    let out = Tensor::vector(cos.clone());
    let cache = CosineCache {
        a: a.clone(),
        b: b.clone(),
        norm_a,
        norm_b,
        cos,
    };
    (out, cache)
}

/// Gradients of the row-wise cosine with respect to both inputs
///
/// A clamped norm is treated as a constant, so its direction term drops out.
pub fn cosine_similarity_backward(grad_out: &Tensor, cache: &CosineCache) -> (Tensor, Tensor) {
    let rows = cache.a.rows();
    let dim = cache.a.cols();
    let mut grad_a = Vec::with_capacity(rows * dim);
    let mut grad_b = Vec::with_capacity(rows * dim);

    for i in 0..rows {
        let g = grad_out.data[i];
        let (ra, rb) = (cache.a.row(i), cache.b.row(i));
        let na = cache.norm_a[i].max(COSINE_EPS);
        let nb = cache.norm_b[i].max(COSINE_EPS);
        let c = cache.cos[i];
        let a_free = cache.norm_a[i] > COSINE_EPS;
        let b_free = cache.norm_b[i] > COSINE_EPS;

        for (&x, &y) in ra.iter().zip(rb) {
            let mut da = y / (na * nb);
            if a_free {
                da -= c * x / (na * na);
            }
            grad_a.push(g * da);

            let mut db = x / (na * nb);
            if b_free {
                db -= c * y / (nb * nb);
            }
            grad_b.push(g * db);
        }
    }

    (
        Tensor::new(grad_a, vec![rows, dim]),
        Tensor::new(grad_b, vec![rows, dim]),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relu_clips_negatives() {
        let x = Tensor::vector(vec![-1.0, 0.0, 2.0]);
        assert_eq!(relu_forward(&x).data, vec![0.0, 0.0, 2.0]);
        let g = relu_backward(&Tensor::vector(vec![1.0, 1.0, 1.0]), &x);
        assert_eq!(g.data, vec![0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_tanh_backward_matches_derivative() {
        let x = Tensor::vector(vec![-0.7, 0.1, 1.3]);
        let y = tanh_forward(&x);
        let g = tanh_backward(&Tensor::vector(vec![1.0; 3]), &y);
        for (i, &v) in x.data.iter().enumerate() {
            let h = 1e-3;
            let numeric = ((v + h).tanh() - (v - h).tanh()) / (2.0 * h);
            assert!((g.data[i] - numeric).abs() < 1e-3);
        }
    }

    #[test]
    fn test_cosine_of_parallel_and_orthogonal_rows() {
        let a = Tensor::new(vec![1.0, 0.0, 2.0, 2.0], vec![2, 2]);
        let b = Tensor::new(vec![0.0, 3.0, 1.0, 1.0], vec![2, 2]);
        let (cos, _) = cosine_similarity_forward(&a, &b);
        assert!(cos.data[0].abs() < 1e-6);
        assert!((cos.data[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_backward_matches_finite_differences() {
        let a = Tensor::new(vec![0.3, -1.2, 0.8], vec![1, 3]);
        let b = Tensor::new(vec![1.1, 0.4, -0.5], vec![1, 3]);
        let (_, cache) = cosine_similarity_forward(&a, &b);
        let (ga, gb) = cosine_similarity_backward(&Tensor::vector(vec![1.0]), &cache);

        let h = 1e-3;
        for j in 0..3 {
            let mut plus = a.clone();
            let mut minus = a.clone();
            plus.data[j] += h;
            minus.data[j] -= h;
            let numeric = (cosine_similarity_forward(&plus, &b).0.data[0]
                - cosine_similarity_forward(&minus, &b).0.data[0])
                / (2.0 * h);
            assert!((ga.data[j] - numeric).abs() < 1e-3, "d/da[{}]", j);

            let mut plus = b.clone();
            let mut minus = b.clone();
            plus.data[j] += h;
            minus.data[j] -= h;
            let numeric = (cosine_similarity_forward(&a, &plus).0.data[0]
                - cosine_similarity_forward(&a, &minus).0.data[0])
                / (2.0 * h);
            assert!((gb.data[j] - numeric).abs() < 1e-3, "d/db[{}]", j);
        }
    }

    #[test]
    fn test_cosine_of_zero_row_is_zero() {
        let a = Tensor::new(vec![0.0, 0.0], vec![1, 2]);
        let b = Tensor::new(vec![1.0, 2.0], vec![1, 2]);
        let (cos, cache) = cosine_similarity_forward(&a, &b);
        assert_eq!(cos.data[0], 0.0);
        let (ga, gb) = cosine_similarity_backward(&Tensor::vector(vec![1.0]), &cache);
        assert!(ga.data.iter().all(|v| v.is_finite()));
        assert!(gb.data.iter().all(|v| v.is_finite()));
    }
}
