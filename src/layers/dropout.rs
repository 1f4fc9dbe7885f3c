//! Dropout Layer
//!
//! Randomly zeros activations during training and rescales the survivors by
//! `1 / (1 - rate)`. In eval mode the input passes through unchanged. Masks
//! are drawn from the caller's RNG so runs are reproducible.

use rand::Rng;

use crate::tensor::Tensor;

/// Dropout with an explicit train/eval switch
#[derive(Clone, Debug)]
pub struct TrainableDropout {
    pub rate: f32,
    pub training: bool,
}

impl TrainableDropout {
    /// Create a new dropout layer in training mode
    ///
    /// # Panics
    ///
    /// Panics if `rate` is outside `[0, 1]`.
    pub fn new(rate: f32) -> Self {
        assert!(
            (0.0..=1.0).contains(&rate),
            "Dropout rate must be between 0.0 and 1.0"
        );
        Self {
            rate,
            training: true,
        }
    }

    /// Forward pass with caching for backward
    pub fn forward<R: Rng + ?Sized>(&self, x: &Tensor, rng: &mut R) -> (Tensor, DropoutCache) {
        if !self.training || self.rate == 0.0 {
            return (x.clone(), DropoutCache { mask: None, scale: 1.0 });
        }

        if self.rate >= 1.0 {
            let cache = DropoutCache {
                mask: Some(vec![false; x.len()]),
                scale: 1.0,
            };
            return (x.zeros_like(), cache);
        }

        let scale = 1.0 / (1.0 - self.rate);
        let mask: Vec<bool> = (0..x.len()).map(|_| rng.gen::<f32>() >= self.rate).collect();
        let data = x
            .data
            .iter()
            .zip(&mask)
            .map(|(&v, &keep)| if keep { v * scale } else { 0.0 })
            .collect();

        (
            Tensor::new(data, x.shape.clone()),
            DropoutCache {
                mask: Some(mask),
                scale,
            },
        )
    }

    /// Backward pass: apply the forward mask to the incoming gradient
    pub fn backward(&self, grad_output: &Tensor, cache: &DropoutCache) -> Tensor {
        match &cache.mask {
            Some(mask) => {
                let data = grad_output
                    .data
                    .iter()
                    .zip(mask)
                    .map(|(&g, &keep)| if keep { g * cache.scale } else { 0.0 })
                    .collect();
                Tensor::new(data, grad_output.shape.clone())
            }
            None => grad_output.clone(),
        }
    }
}

/// Cache for dropout backward pass
#[derive(Clone, Debug)]
pub struct DropoutCache {
    /// Dropout mask (true = kept), `None` when dropout was inactive
    pub mask: Option<Vec<bool>>,
    pub scale: f32,
}
