//! Tritask: Multitask Fine-Tuning of a Shared Text Encoder
//!
//! One encoder, three task heads, trained jointly from scratch in Rust:
//!
//! - **Sentiment**: five-way classification of a sentence
//! - **Paraphrase**: binary detection over a sentence pair
//! - **Similarity**: graded similarity score of a sentence pair
//!
//! Every joint step draws one batch per task, sums the three gradients and
//! applies a single AdamW update. After each epoch the model is scored on
//! the dev splits and the best one is checkpointed.
//!
//! # Modules
//!
//! - [`tensor`], [`params`], [`layers`] - numeric core with hand-written backward passes
//! - [`encoder`], [`heads`], [`model`], [`loss`] - the multitask network
//! - [`optimizer`] - AdamW with decoupled weight decay
//! - [`tokenizer`], [`data`] - vocabulary, TSV corpora and batching
//! - [`train`], [`evaluation`], [`checkpoint`], [`predict`] - the training run
//! - [`config`], [`rng`], [`training_logger`], [`error`] - run plumbing
//!
//! # Example
//!
//! ```rust,no_run
//! use tritask::config::TrainArgs;
//! use tritask::rng::RngContext;
//! use tritask::{test_multitask, train_multitask};
//! use clap::Parser;
//!
//! let args = TrainArgs::parse_from(["multitask_classifier", "--option", "finetune"]);
//! let mut rngs = RngContext::seeded(args.seed);
//! let history = train_multitask(&args, &mut rngs)?;
//! println!("best dev mean: {:.3}", history.iter().map(|m| m.dev.mean()).fold(f64::MIN, f64::max));
//! test_multitask(&args, &mut rngs)?;
//! # Ok::<(), tritask::Error>(())
//! ```

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod encoder;
pub mod error;
pub mod evaluation;
pub mod heads;
pub mod layers;
pub mod loss;
pub mod model;
pub mod optimizer;
pub mod params;
pub mod predict;
pub mod rng;
pub mod tensor;
pub mod tokenizer;
pub mod train;
pub mod training_logger;

// Re-export main types for convenience
pub use error::{Error, Result};
pub use model::{MultitaskModel, TaskKind};
pub use optimizer::{AdamW, AdamWConfig};
pub use predict::test_multitask;
pub use tensor::Tensor;
pub use train::train_multitask;
