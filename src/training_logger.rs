//! Training Logger
//!
//! Records one row of metrics per epoch, both to the `tracing` log and,
//! optionally, to a CSV file that can be analyzed after the run.
//!
//! ## Example
//!
//! ```rust,no_run
//! use tritask::evaluation::TaskScores;
//! use tritask::training_logger::{EpochMetrics, TrainingLogger};
//!
//! let mut logger = TrainingLogger::to_file("metrics.csv", 1e-5)?;
//! logger.log(&EpochMetrics {
//!     epoch: 0,
//!     train_loss: 1.25,
//!     train: TaskScores::default(),
//!     dev: TaskScores::default(),
//!     checkpoint_saved: true,
//! })?;
//! # Ok::<(), tritask::Error>(())
//! ```
//!
//! ## CSV Format
//!
//! - `epoch`: Zero-based epoch number
//! - `elapsed_seconds`: Time since the logger was created
//! - `learning_rate`: Optimizer learning rate
//! - `train_loss`: Mean per-task training loss of the epoch
//! - `sst_train_acc`, `para_train_acc`, `sts_train_corr`: Training split scores
//! - `sst_dev_acc`, `para_dev_acc`, `sts_dev_corr`: Dev split scores
//! - `dev_mean`: Mean of the three dev scores (model selection criterion)
//! - `checkpoint_saved`: Whether this epoch overwrote the best checkpoint

use std::fs::File;
use std::path::Path;
use std::time::Instant;

use serde::Serialize;
use tracing::info;

use crate::error::Result;
use crate::evaluation::TaskScores;

/// Outcome of one training epoch
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_loss: f32,
    pub train: TaskScores,
    pub dev: TaskScores,
    pub checkpoint_saved: bool,
}

#[derive(Serialize)]
struct EpochRow {
    epoch: usize,
    elapsed_seconds: f32,
    learning_rate: f32,
    train_loss: f32,
    sst_train_acc: f64,
    para_train_acc: f64,
    sts_train_corr: f64,
    sst_dev_acc: f64,
    para_dev_acc: f64,
    sts_dev_corr: f64,
    dev_mean: f64,
    checkpoint_saved: bool,
}

fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}

/// Per-epoch metrics sink
pub struct TrainingLogger {
    csv: Option<csv::Writer<File>>,
    learning_rate: f32,
    start_time: Instant,
}

impl TrainingLogger {
    /// Log to `tracing` only
    pub fn new(learning_rate: f32) -> Self {
        Self {
            csv: None,
            learning_rate,
            start_time: Instant::now(),
        }
    }

    /// Log to `tracing` and to a fresh CSV file at `path`
    pub fn to_file(path: impl AsRef<Path>, learning_rate: f32) -> Result<Self> {
        let file = File::create(path.as_ref())?;
        Ok(Self {
            csv: Some(csv::Writer::from_writer(file)),
            ..Self::new(learning_rate)
        })
    }

    pub fn log(&mut self, metrics: &EpochMetrics) -> Result<()> {
        let elapsed = self.start_time.elapsed().as_secs_f32();

        info!(
            epoch = metrics.epoch,
            train_loss = round3(metrics.train_loss as f64),
            sst_train_acc = round3(metrics.train.sentiment_accuracy),
            sst_dev_acc = round3(metrics.dev.sentiment_accuracy),
            para_train_acc = round3(metrics.train.paraphrase_accuracy),
            para_dev_acc = round3(metrics.dev.paraphrase_accuracy),
            sts_train_corr = round3(metrics.train.similarity_correlation),
            sts_dev_corr = round3(metrics.dev.similarity_correlation),
            saved = metrics.checkpoint_saved,
            "epoch finished in {:.1}s",
            elapsed
        );

        if let Some(csv) = &mut self.csv {
            csv.serialize(EpochRow {
                epoch: metrics.epoch,
                elapsed_seconds: elapsed,
                learning_rate: self.learning_rate,
                train_loss: metrics.train_loss,
                sst_train_acc: metrics.train.sentiment_accuracy,
                para_train_acc: metrics.train.paraphrase_accuracy,
                sts_train_corr: metrics.train.similarity_correlation,
                sst_dev_acc: metrics.dev.sentiment_accuracy,
                para_dev_acc: metrics.dev.paraphrase_accuracy,
                sts_dev_corr: metrics.dev.similarity_correlation,
                dev_mean: metrics.dev.mean(),
                checkpoint_saved: metrics.checkpoint_saved,
            })?;
            // Rows must survive an interrupted run
            csv.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_csv_has_header_and_one_row_per_epoch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.csv");
        let mut logger = TrainingLogger::to_file(&path, 0.001).unwrap();

        for epoch in 0..2 {
            logger
                .log(&EpochMetrics {
                    epoch,
                    train_loss: 0.5,
                    train: TaskScores::default(),
                    dev: TaskScores {
                        sentiment_accuracy: 0.3,
                        paraphrase_accuracy: 0.6,
                        similarity_correlation: 0.0,
                    },
                    checkpoint_saved: epoch == 0,
                })
                .unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("epoch,elapsed_seconds,learning_rate,train_loss,"));
        assert!(lines[0].ends_with("dev_mean,checkpoint_saved"));
        assert!(lines[1].starts_with("0,"));
        assert!(lines[1].ends_with(",true"));
        assert!(lines[2].ends_with(",false"));
    }

    #[test]
    fn test_tracing_only_logger_writes_nothing() {
        let mut logger = TrainingLogger::new(0.1);
        let metrics = EpochMetrics {
            epoch: 0,
            train_loss: 0.0,
            train: TaskScores::default(),
            dev: TaskScores::default(),
            checkpoint_saved: false,
        };
        assert!(logger.log(&metrics).is_ok());
    }
}
