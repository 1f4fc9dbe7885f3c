//! AdamW Optimizer Implementation
//!
//! Adam with decoupled weight decay over every parameter of a
//! [`ParamStore`]. Moment state is kept per parameter, keyed by its
//! [`ParamId`], and created lazily the first time the parameter receives a
//! gradient.
//!
//! ## Algorithm
//!
//! For each parameter θ with gradient g, on its own step count t:
//!
//! ```text
//! t = t + 1
//! m = β₁ * m + (1 - β₁) * g        # First moment (momentum)
//! v = β₂ * v + (1 - β₂) * g²       # Second moment (variance)
//! m_hat = m / (1 - β₁^t)           # Bias correction
//! v_hat = v / (1 - β₂^t)           # Bias correction
//! θ = θ - α * m_hat / (√v_hat + ε) # Adam step
//! θ = θ - θ * α * λ                # Weight decay on the stepped value
//! ```
//!
//! where α is the learning rate and λ the weight decay.
//!
//! ## Weight decay ordering
//!
//! Decay is applied **after** the Adam step, to the value the step produced.
//! The textbook decoupled form decays the pre-step value instead; the two
//! differ by a term of order `α² λ`. The post-step form is kept so that runs
//! reproduce results of the reference training setup.
//!
//! ## Bias correction
//!
//! Bias correction is always applied. `correct_bias` is accepted for
//! configuration compatibility and does not change the update.
//!
//! ## Skipped parameters
//!
//! A parameter without a gradient (a frozen encoder, or a head that did not
//! take part in the iteration) keeps both its value and its optimizer state
//! untouched.
//!
//! ## Example
//!
//! ```rust
//! use tritask::optimizer::{AdamW, AdamWConfig};
//! use tritask::params::ParamStore;
//! use tritask::Tensor;
//!
//! let mut params = ParamStore::new();
//! let p = params.register("p", Tensor::vector(vec![1.0]));
//! let mut optimizer = AdamW::new(AdamWConfig::new(0.1).with_weight_decay(0.01)).unwrap();
//!
//! params.accumulate_grad(p, Tensor::vector(vec![0.5]));
//! optimizer.step(&mut params).unwrap();
//! assert!((params.value(p).data[0] - 0.8991).abs() < 1e-5);
//! ```

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::params::{Gradient, ParamId, ParamStore};
use crate::tensor::{Tensor, PARALLEL_ELEMENTS};

/// Hyperparameters of [`AdamW`]
///
/// Built with [`AdamWConfig::new`] and the `with_*` setters, validated when
/// the optimizer is constructed.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdamWConfig {
    pub lr: f32,
    pub betas: (f32, f32),
    pub eps: f32,
    pub weight_decay: f32,
    pub correct_bias: bool,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            betas: (0.9, 0.999),
            eps: 1e-6,
            weight_decay: 0.0,
            correct_bias: true,
        }
    }
}

impl AdamWConfig {
    /// Default hyperparameters with the given learning rate
    pub fn new(lr: f32) -> Self {
        Self {
            lr,
            ..Self::default()
        }
    }

    pub fn with_betas(mut self, beta1: f32, beta2: f32) -> Self {
        self.betas = (beta1, beta2);
        self
    }

    pub fn with_eps(mut self, eps: f32) -> Self {
        self.eps = eps;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    pub fn with_correct_bias(mut self, correct_bias: bool) -> Self {
        self.correct_bias = correct_bias;
        self
    }

    /// Check the hyperparameter ranges
    pub fn validate(&self) -> Result<()> {
        // Written as negated range checks so NaN is rejected too
        if !(self.lr >= 0.0) {
            return Err(Error::InvalidLearningRate(self.lr));
        }
        for (index, value) in [self.betas.0, self.betas.1].into_iter().enumerate() {
            if !(0.0..1.0).contains(&value) {
                return Err(Error::InvalidBeta { index, value });
            }
        }
        if !(self.eps >= 0.0) {
            return Err(Error::InvalidEpsilon(self.eps));
        }
        Ok(())
    }
}

/// Moment estimates of one parameter
#[derive(Clone, Debug, PartialEq)]
pub struct ParamState {
    /// Number of updates this parameter has received
    pub step: u64,
    /// First moment (exponential average of gradients)
    pub exp_avg: Tensor,
    /// Second moment (exponential average of squared gradients)
    pub exp_avg_sq: Tensor,
}

impl ParamState {
    fn new(shape: &[usize]) -> Self {
        Self {
            step: 0,
            exp_avg: Tensor::zeros(shape.to_vec()),
            exp_avg_sq: Tensor::zeros(shape.to_vec()),
        }
    }
}

/// AdamW optimizer with per-parameter state
#[derive(Clone, Debug)]
pub struct AdamW {
    config: AdamWConfig,
    /// Indexed by `ParamId`; `None` until the parameter's first update
    state: Vec<Option<ParamState>>,
}

/// Per-step scalars shared by every element of one parameter
#[derive(Clone, Copy)]
struct StepScalars {
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    weight_decay: f32,
    bias_correction1: f32,
    bias_correction2: f32,
}

#[inline(always)]
fn adamw_element(p: &mut f32, g: f32, m: &mut f32, v: &mut f32, k: StepScalars) {
    *m = k.beta1 * *m + (1.0 - k.beta1) * g;
    *v = k.beta2 * *v + (1.0 - k.beta2) * g * g;

    let m_hat = *m / k.bias_correction1;
    let v_hat = *v / k.bias_correction2;

    *p -= k.lr * m_hat / (v_hat.sqrt() + k.eps);
    *p -= *p * k.lr * k.weight_decay;
}

impl AdamW {
    /// Create an optimizer, rejecting out-of-range hyperparameters
    pub fn new(config: AdamWConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: Vec::new(),
        })
    }

    pub fn config(&self) -> &AdamWConfig {
        &self.config
    }

    /// Optimizer state of a parameter, `None` before its first update
    pub fn state(&self, id: ParamId) -> Option<&ParamState> {
        self.state.get(id.index()).and_then(Option::as_ref)
    }

    /// Every parameter that has optimizer state, in handle order
    pub fn states(&self) -> impl Iterator<Item = (ParamId, &ParamState)> {
        self.state
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (ParamId(i), s)))
    }

    /// Rebuild an optimizer from saved state
    pub fn from_state(
        config: AdamWConfig,
        states: impl IntoIterator<Item = (ParamId, ParamState)>,
    ) -> Result<Self> {
        let mut optimizer = Self::new(config)?;
        for (id, state) in states {
            *optimizer.slot(id) = Some(state);
        }
        Ok(optimizer)
    }

    fn slot(&mut self, id: ParamId) -> &mut Option<ParamState> {
        if self.state.len() <= id.index() {
            self.state.resize(id.index() + 1, None);
        }
        &mut self.state[id.index()]
    }

    /// Apply one update to every parameter that has a gradient
    ///
    /// Gradients are read, not consumed; resetting them is the caller's job.
    ///
    /// # Errors
    ///
    /// [`Error::SparseGradient`] if any gradient is sparse. The check runs
    /// before any parameter is touched.
    pub fn step(&mut self, params: &mut ParamStore) -> Result<()> {
        if let Some((_, p)) = params
            .iter()
            .find(|(_, p)| p.grad.as_ref().is_some_and(Gradient::is_sparse))
        {
            return Err(Error::SparseGradient {
                param: p.name.clone(),
            });
        }

        let config = self.config;
        let (beta1, beta2) = config.betas;
        for (id, param) in params.iter_mut() {
            let grad = match &param.grad {
                Some(Gradient::Dense(g)) => g,
                Some(Gradient::Sparse { .. }) | None => continue,
            };

            let state = self
                .slot(id)
                .get_or_insert_with(|| ParamState::new(&param.value.shape));
            state.step += 1;
            let t = state.step as i32;

            let k = StepScalars {
                lr: config.lr,
                beta1,
                beta2,
                eps: config.eps,
                weight_decay: config.weight_decay,
                bias_correction1: 1.0 - beta1.powi(t),
                bias_correction2: 1.0 - beta2.powi(t),
            };

            let ParamState {
                exp_avg, exp_avg_sq, ..
            } = state;

            if param.value.len() > PARALLEL_ELEMENTS {
                param
                    .value
                    .data
                    .par_iter_mut()
                    .zip(grad.data.par_iter())
                    .zip(exp_avg.data.par_iter_mut().zip(exp_avg_sq.data.par_iter_mut()))
                    .for_each(|((p, &g), (m, v))| adamw_element(p, g, m, v, k));
            } else {
                for (((p, &g), m), v) in param
                    .value
                    .data
                    .iter_mut()
                    .zip(&grad.data)
                    .zip(exp_avg.data.iter_mut())
                    .zip(exp_avg_sq.data.iter_mut())
                {
                    adamw_element(p, g, m, v, k);
                }
            }
        }

        Ok(())
    }
}
