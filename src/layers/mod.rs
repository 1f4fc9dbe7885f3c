//! Neural Network Layers
//!
//! Building blocks shared by the encoder and the task heads. Each layer
//! provides both forward and backward passes.
//!
//! ## Layers
//!
//! - **activation**: ReLU, tanh, sigmoid and row-wise cosine similarity
//! - **linear**: Fully connected layer
//! - **dropout**: Dropout regularization
//!
//! ## Design Pattern
//!
//! Every layer follows the same shape:
//!
//! ```rust,ignore
//! impl Layer {
//!     pub fn forward(&self, params: &ParamStore, x: &Tensor) -> (Tensor, Cache);
//!     pub fn backward(&self, params: &mut ParamStore, grad: &Tensor, cache: &Cache) -> Tensor;
//! }
//! ```
//!
//! `forward` returns whatever `backward` needs in a cache; `backward`
//! accumulates parameter gradients into the [`ParamStore`](crate::params::ParamStore)
//! and returns the gradient for the previous layer.

pub mod activation;
pub mod dropout;
pub mod linear;

pub use activation::{
    cosine_similarity_backward, cosine_similarity_forward, relu_backward, relu_forward, sigmoid,
    tanh_backward, tanh_forward, CosineCache,
};
pub use dropout::{DropoutCache, TrainableDropout};
pub use linear::{LinearCache, TrainableLinear};
