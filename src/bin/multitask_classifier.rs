//! Train the multitask model, then evaluate the best checkpoint
//!
//! ```bash
//! cargo run --release --bin multitask_classifier -- --option finetune --lr 1e-5
//!
//! # More detail from the library
//! RUST_LOG=tritask=debug cargo run --release --bin multitask_classifier
//! ```
//!
//! Datasets default to `data/*.csv`; predictions are written to
//! `predictions/`.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tritask::config::{select_device, TrainArgs};
use tritask::rng::RngContext;
use tritask::{test_multitask, train_multitask};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("tritask=info".parse()?),
        )
        .init();

    let args = TrainArgs::parse();
    let device = select_device(args.use_gpu)?;
    info!(?device, seed = args.seed, option = args.option.as_str(), "starting run");

    let mut rngs = RngContext::seeded(args.seed);
    let history = train_multitask(&args, &mut rngs).context("training failed")?;
    let saved = history.iter().filter(|m| m.checkpoint_saved).count();
    info!(epochs = history.len(), checkpoints_written = saved, "training complete");

    let checkpoint = args.checkpoint_path();
    test_multitask(&args, &mut rngs)
        .with_context(|| format!("evaluating checkpoint {}", checkpoint.display()))?;
    Ok(())
}
