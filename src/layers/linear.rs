//! Linear Layer (Fully Connected)
//!
//! Affine transformation `y = x @ W + b` over a batch of row vectors.
//!
//! ## Forward Pass
//!
//! ```text
//! Input:  x [batch, in_features]
//! Weight: W [in_features, out_features]
//! Bias:   b [out_features]
//! Output: y = x @ W + b [batch, out_features]
//! ```
//!
//! ## Backward Pass
//!
//! ```text
//! grad_W = x^T @ grad_y
//! grad_b = sum(grad_y, axis=0)
//! grad_x = grad_y @ W^T
//! ```
//!
//! Weight and bias live in the [`ParamStore`]; the layer only keeps their
//! handles. Gradients are accumulated into the store, so several backward
//! passes through the same layer add up until the store is zeroed.
//!
//! ## Initialization
//!
//! Both weight and bias are drawn from `U(-1/√in, 1/√in)`.

use rand::distributions::{Distribution, Uniform};
use rand::Rng;

use crate::params::{ParamId, ParamStore};
use crate::tensor::Tensor;

/// Linear layer whose parameters live in a [`ParamStore`]
#[derive(Clone, Debug)]
pub struct TrainableLinear {
    pub weight: ParamId,
    pub bias: ParamId,
    pub in_features: usize,
    pub out_features: usize,
}

impl TrainableLinear {
    /// Register a new layer named `name` in `params`
    ///
    /// # Arguments
    ///
    /// * `params` - Arena receiving `{name}.weight` and `{name}.bias`
    /// * `name` - Parameter name prefix
    /// * `in_features` - Input dimension
    /// * `out_features` - Output dimension
    /// * `rng` - Initialization stream
    pub fn new<R: Rng + ?Sized>(
        params: &mut ParamStore,
        name: &str,
        in_features: usize,
        out_features: usize,
        rng: &mut R,
    ) -> Self {
        let bound = 1.0 / (in_features as f32).sqrt();
        let dist = Uniform::new_inclusive(-bound, bound);
        let mut sample = |n: usize| -> Vec<f32> { (0..n).map(|_| dist.sample(&mut *rng)).collect() };

        let weight_data = sample(in_features * out_features);
        let bias_data = sample(out_features);

        let weight = params.register(
            format!("{name}.weight"),
            Tensor::new(weight_data, vec![in_features, out_features]),
        );
        let bias = params.register(format!("{name}.bias"), Tensor::vector(bias_data));

        Self {
            weight,
            bias,
            in_features,
            out_features,
        }
    }

    /// Forward pass
    ///
    /// Returns the output `[batch, out_features]` and a cache holding `x`.
    pub fn forward(&self, params: &ParamStore, x: &Tensor) -> (Tensor, LinearCache) {
        let y = x
            .matmul(params.value(self.weight))
            .add(params.value(self.bias));
        (y, LinearCache { x: x.clone() })
    }

    /// Backward pass
    ///
    /// Accumulates weight and bias gradients into `params` and returns the
    /// gradient with respect to the layer input.
    pub fn backward(&self, params: &mut ParamStore, grad_out: &Tensor, cache: &LinearCache) -> Tensor {
        if params.requires_grad(self.weight) {
            params.accumulate_grad(self.weight, cache.x.transpose().matmul(grad_out));
        }
        if params.requires_grad(self.bias) {
            params.accumulate_grad(self.bias, grad_out.sum_rows());
        }
        grad_out.matmul(&params.value(self.weight).transpose())
    }

    pub fn parameters(&self) -> [ParamId; 2] {
        [self.weight, self.bias]
    }
}

/// Cache for linear layer backward pass
#[derive(Clone, Debug)]
pub struct LinearCache {
    pub x: Tensor,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Gradient;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn layer_with(weight: Vec<f32>, bias: Vec<f32>, shape: [usize; 2]) -> (ParamStore, TrainableLinear) {
        let mut params = ParamStore::new();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let layer = TrainableLinear::new(&mut params, "fc", shape[0], shape[1], &mut rng);
        params.get_mut(layer.weight).value = Tensor::new(weight, shape.to_vec());
        params.get_mut(layer.bias).value = Tensor::vector(bias);
        (params, layer)
    }

    #[test]
    fn test_init_within_bounds() {
        let mut params = ParamStore::new();
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let layer = TrainableLinear::new(&mut params, "fc", 16, 4, &mut rng);
        let bound = 0.25 + 1e-6;
        assert!(params.value(layer.weight).data.iter().all(|w| w.abs() <= bound));
        assert_eq!(params.get(layer.weight).name, "fc.weight");
        assert_eq!(params.value(layer.bias).shape, vec![4]);
    }

    #[test]
    fn test_forward_affine() {
        let (params, layer) = layer_with(vec![1.0, 2.0, 3.0, 4.0], vec![0.5, -0.5], [2, 2]);
        let x = Tensor::new(vec![1.0, 1.0], vec![1, 2]);
        let (y, _) = layer.forward(&params, &x);
        assert_eq!(y.data, vec![4.5, 5.5]);
    }

    #[test]
    fn test_backward_gradients() {
        let (mut params, layer) = layer_with(vec![1.0, 2.0, 3.0, 4.0], vec![0.0, 0.0], [2, 2]);
        let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);
        let (_, cache) = layer.forward(&params, &x);

        let grad_out = Tensor::new(vec![1.0, 0.0, 0.0, 1.0], vec![2, 2]);
        let grad_x = layer.backward(&mut params, &grad_out, &cache);

        // grad_x = grad_out @ W^T
        assert_eq!(grad_x.data, vec![1.0, 3.0, 2.0, 4.0]);
        match params.grad(layer.weight) {
            Some(Gradient::Dense(g)) => assert_eq!(g.data, vec![1.0, 3.0, 2.0, 4.0]),
            other => panic!("unexpected weight grad {:?}", other),
        }
        match params.grad(layer.bias) {
            Some(Gradient::Dense(g)) => assert_eq!(g.data, vec![1.0, 1.0]),
            other => panic!("unexpected bias grad {:?}", other),
        }
    }
}
