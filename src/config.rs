//! Run and model configuration.
//!
//! [`TrainArgs`] is the full invocation surface of a run. It is parsed by
//! clap in the binary and stored verbatim (as JSON) in every checkpoint.
//! [`ModelConfig`] holds the architecture hyperparameters needed to rebuild
//! the model from a checkpoint.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Number of sentiment classes (negative .. positive)
pub const N_SENTIMENT_CLASSES: usize = 5;

/// Whether the encoder is trained alongside the heads
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TrainMode {
    /// Encoder parameters are frozen; only the heads learn
    Pretrain,
    /// Encoder parameters are updated too
    Finetune,
}

impl TrainMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TrainMode::Pretrain => "pretrain",
            TrainMode::Finetune => "finetune",
        }
    }
}

/// Compute device for a run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Device {
    Cpu,
}

/// Resolve the accelerator flag to a device
///
/// Kernels in this crate are CPU-only, so asking for an accelerator is fatal.
pub fn select_device(use_gpu: bool) -> Result<Device> {
    if use_gpu {
        return Err(Error::AcceleratorUnavailable);
    }
    Ok(Device::Cpu)
}

/// Architecture hyperparameters of the multitask model
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    /// Width of the encoder embedding
    pub hidden_size: usize,
    pub hidden_dropout_prob: f32,
    pub num_labels: usize,
    /// Hidden width of the paraphrase head
    pub paraphrase_hidden: usize,
    /// Width each sentence is projected to before the cosine
    pub similarity_proj: usize,
    /// Emit row-sparse gradients for the token embedding table
    pub sparse_embedding_grad: bool,
    pub option: TrainMode,
}

impl ModelConfig {
    pub fn new(vocab_size: usize, args: &TrainArgs) -> Self {
        Self {
            vocab_size,
            hidden_size: args.hidden_size,
            hidden_dropout_prob: args.hidden_dropout_prob,
            num_labels: N_SENTIMENT_CLASSES,
            paraphrase_hidden: 512,
            similarity_proj: 10,
            sparse_embedding_grad: args.sparse_embeddings,
            option: args.option,
        }
    }

    /// Small configuration for tests
    pub fn tiny(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            hidden_size: 8,
            hidden_dropout_prob: 0.0,
            num_labels: N_SENTIMENT_CLASSES,
            paraphrase_hidden: 6,
            similarity_proj: 4,
            sparse_embedding_grad: false,
            option: TrainMode::Finetune,
        }
    }
}

/// Invocation arguments of a training + prediction run
#[derive(Clone, Debug, Parser, Serialize, Deserialize)]
#[command(
    name = "multitask_classifier",
    about = "Fine-tune a shared encoder on sentiment, paraphrase and similarity"
)]
pub struct TrainArgs {
    #[arg(long, default_value = "data/ids-sst-train.csv")]
    pub sst_train: PathBuf,
    #[arg(long, default_value = "data/ids-sst-dev.csv")]
    pub sst_dev: PathBuf,
    #[arg(long, default_value = "data/ids-sst-test-student.csv")]
    pub sst_test: PathBuf,

    #[arg(long, default_value = "data/quora-train.csv")]
    pub para_train: PathBuf,
    #[arg(long, default_value = "data/quora-dev.csv")]
    pub para_dev: PathBuf,
    #[arg(long, default_value = "data/quora-test-student.csv")]
    pub para_test: PathBuf,

    #[arg(long, default_value = "data/sts-train.csv")]
    pub sts_train: PathBuf,
    #[arg(long, default_value = "data/sts-dev.csv")]
    pub sts_dev: PathBuf,
    #[arg(long, default_value = "data/sts-test-student.csv")]
    pub sts_test: PathBuf,

    #[arg(long, default_value_t = 11711)]
    pub seed: u64,
    #[arg(long, default_value_t = 10)]
    pub epochs: usize,
    /// pretrain: the encoder parameters are frozen; finetune: they are updated
    #[arg(long, value_enum, default_value_t = TrainMode::Pretrain)]
    pub option: TrainMode,
    #[arg(long)]
    pub use_gpu: bool,

    #[arg(long, default_value = "predictions/sst-dev-output.csv")]
    pub sst_dev_out: PathBuf,
    #[arg(long, default_value = "predictions/sst-test-output.csv")]
    pub sst_test_out: PathBuf,
    #[arg(long, default_value = "predictions/para-dev-output.csv")]
    pub para_dev_out: PathBuf,
    #[arg(long, default_value = "predictions/para-test-output.csv")]
    pub para_test_out: PathBuf,
    #[arg(long, default_value = "predictions/sts-dev-output.csv")]
    pub sts_dev_out: PathBuf,
    #[arg(long, default_value = "predictions/sts-test-output.csv")]
    pub sts_test_out: PathBuf,

    #[arg(long, default_value_t = 8, value_parser = parse_batch_size)]
    pub batch_size: usize,
    #[arg(long, default_value_t = 0.3, value_parser = parse_probability)]
    pub hidden_dropout_prob: f32,
    /// Learning rate
    #[arg(long, default_value_t = 1e-5)]
    pub lr: f32,
    #[arg(long, default_value_t = 0.0)]
    pub weight_decay: f32,

    /// Encoder embedding width
    #[arg(long, default_value_t = 768)]
    pub hidden_size: usize,
    /// Upper bound on the vocabulary built from the training splits
    #[arg(long, default_value_t = 30_522)]
    pub max_vocab: usize,
    /// Token sequences are truncated to this length
    #[arg(long, default_value_t = 128)]
    pub max_seq_len: usize,
    /// Emit row-sparse embedding gradients (rejected by AdamW)
    #[arg(long)]
    pub sparse_embeddings: bool,

    /// Checkpoint path; defaults to `{option}-{epochs}-{lr}-multitask.ckpt`
    #[arg(long)]
    pub filepath: Option<PathBuf>,
    /// Append per-epoch metrics to this CSV file
    #[arg(long)]
    pub metrics_log: Option<PathBuf>,
}

fn parse_batch_size(raw: &str) -> std::result::Result<usize, String> {
    match raw.parse::<usize>() {
        Ok(0) => Err("must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

fn parse_probability(raw: &str) -> std::result::Result<f32, String> {
    let p: f32 = raw.parse().map_err(|e: std::num::ParseFloatError| e.to_string())?;
    if !(0.0..=1.0).contains(&p) {
        return Err(format!("{p} is outside [0, 1]"));
    }
    Ok(p)
}

impl TrainArgs {
    /// Reject values that would otherwise panic deep inside a run
    ///
    /// clap already enforces these when parsing; this covers arguments
    /// built in code or deserialized from a checkpoint.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidArgument {
                name: "batch_size",
                message: "must be at least 1".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.hidden_dropout_prob) {
            return Err(Error::InvalidArgument {
                name: "hidden_dropout_prob",
                message: format!("{} is outside [0, 1]", self.hidden_dropout_prob),
            });
        }
        Ok(())
    }

    /// Where the best checkpoint of this run is written
    pub fn checkpoint_path(&self) -> PathBuf {
        self.filepath.clone().unwrap_or_else(|| {
            PathBuf::from(format!(
                "{}-{}-{}-multitask.ckpt",
                self.option.as_str(),
                self.epochs,
                self.lr
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_run() {
        let args = TrainArgs::parse_from(["multitask_classifier"]);
        assert_eq!(args.seed, 11711);
        assert_eq!(args.epochs, 10);
        assert_eq!(args.option, TrainMode::Pretrain);
        assert_eq!(args.batch_size, 8);
        assert!((args.lr - 1e-5).abs() < 1e-12);
        assert_eq!(
            args.checkpoint_path(),
            PathBuf::from("pretrain-10-0.00001-multitask.ckpt")
        );
    }

    #[test]
    fn test_option_parses_finetune() {
        let args = TrainArgs::parse_from(["multitask_classifier", "--option", "finetune"]);
        assert_eq!(args.option, TrainMode::Finetune);
    }

    #[test]
    fn test_out_of_range_values_rejected_at_parse_time() {
        assert!(TrainArgs::try_parse_from(["multitask_classifier", "--batch-size", "0"]).is_err());
        assert!(TrainArgs::try_parse_from(["multitask_classifier", "--hidden-dropout-prob", "1.5"]).is_err());
        assert!(TrainArgs::try_parse_from(["multitask_classifier", "--hidden-dropout-prob=-0.1"]).is_err());
        let args = TrainArgs::try_parse_from(["multitask_classifier", "--batch-size", "1", "--hidden-dropout-prob", "1"]).unwrap();
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_validate_catches_programmatic_values() {
        let mut args = TrainArgs::parse_from(["multitask_classifier"]);
        args.batch_size = 0;
        assert!(matches!(args.validate(), Err(Error::InvalidArgument { name: "batch_size", .. })));

        let mut args = TrainArgs::parse_from(["multitask_classifier"]);
        args.hidden_dropout_prob = 1.5;
        assert!(matches!(
            args.validate(),
            Err(Error::InvalidArgument { name: "hidden_dropout_prob", .. })
        ));
    }

    #[test]
    fn test_accelerator_unavailable() {
        assert!(matches!(
            select_device(true),
            Err(Error::AcceleratorUnavailable)
        ));
        assert_eq!(select_device(false).unwrap(), Device::Cpu);
    }

    #[test]
    fn test_args_survive_json() {
        let args = TrainArgs::parse_from(["multitask_classifier", "--epochs", "3"]);
        let json = serde_json::to_string(&args).unwrap();
        let back: TrainArgs = serde_json::from_str(&json).unwrap();
        assert_eq!(back.epochs, 3);
        assert_eq!(back.sst_train, args.sst_train);
    }
}
