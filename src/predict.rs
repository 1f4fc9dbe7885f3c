//! Test Harness
//!
//! Reloads the best checkpoint of a run, scores it on the dev splits and
//! writes dev and test predictions for all three tasks.
//!
//! Each output file has one header line and one row per example, in input
//! order:
//!
//! ```text
//! id , Predicted_Sentiment
//! 0a8f2c , 3
//! 7be41d , 1
//! ```
//!
//! The header names are `Predicted_Sentiment`, `Predicted_Is_Paraphrase`
//! and `Predicted_Similarity`.

use std::fmt::Display;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use tracing::info;

use crate::checkpoint::Checkpoint;
use crate::config::TrainArgs;
use crate::data::{load_paraphrase, load_sentiment, load_similarity, tokenize_pairs, tokenize_sentiment, DataLoader};
use crate::error::Result;
use crate::evaluation::{evaluate_multitask, predict_test, Predictions, TaskScores};
use crate::rng::RngContext;

/// Write one prediction file, creating parent directories as needed
pub fn write_predictions<T: Display>(path: &Path, task: &str, predictions: &Predictions<T>) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut w = BufWriter::new(File::create(path)?);
    writeln!(w, "id , Predicted_{task}")?;
    for (id, value) in predictions.iter() {
        writeln!(w, "{id} , {value}")?;
    }
    w.flush()?;
    Ok(())
}

/// Evaluate the saved best model and write the six prediction files
///
/// The checkpoint's own vocabulary and sequence length are used for
/// tokenization, so only the dataset and output paths of `args` matter.
/// Returns the dev scores.
pub fn test_multitask(args: &TrainArgs, rngs: &mut RngContext) -> Result<TaskScores> {
    args.validate()?;
    let checkpoint_path = args.checkpoint_path();
    let checkpoint = Checkpoint::load(&checkpoint_path)?;
    let mut model = checkpoint.restore_model()?;
    model.set_training(false);
    info!(path = %checkpoint_path.display(), "loaded best checkpoint");

    let vocab = &checkpoint.vocabulary;
    let len = checkpoint.args.max_seq_len;
    let bs = args.batch_size;

    let sst_dev = DataLoader::new(tokenize_sentiment(&load_sentiment(&args.sst_dev, true)?, vocab, len), bs, false);
    let para_dev = DataLoader::new(tokenize_pairs(&load_paraphrase(&args.para_dev, true)?, vocab, len), bs, false);
    let sts_dev = DataLoader::new(tokenize_pairs(&load_similarity(&args.sts_dev, true)?, vocab, len), bs, false);

    let sst_test = DataLoader::new(tokenize_sentiment(&load_sentiment(&args.sst_test, false)?, vocab, len), bs, false);
    let para_test = DataLoader::new(tokenize_pairs(&load_paraphrase(&args.para_test, false)?, vocab, len), bs, false);
    let sts_test = DataLoader::new(tokenize_pairs(&load_similarity(&args.sts_test, false)?, vocab, len), bs, false);

    let (scores, dev) = evaluate_multitask(&mut model, &sst_dev, &para_dev, &sts_dev, &mut rngs.tensor);
    info!(
        sst_dev_acc = scores.sentiment_accuracy,
        para_dev_acc = scores.paraphrase_accuracy,
        sts_dev_corr = scores.similarity_correlation,
        "dev evaluation"
    );
    let test = predict_test(&mut model, &sst_test, &para_test, &sts_test, &mut rngs.tensor);

    write_predictions(&args.sst_dev_out, "Sentiment", &dev.sentiment)?;
    write_predictions(&args.sst_test_out, "Sentiment", &test.sentiment)?;
    write_predictions(&args.para_dev_out, "Is_Paraphrase", &dev.paraphrase)?;
    write_predictions(&args.para_test_out, "Is_Paraphrase", &test.paraphrase)?;
    write_predictions(&args.sts_dev_out, "Similarity", &dev.similarity)?;
    write_predictions(&args.sts_test_out, "Similarity", &test.similarity)?;
    info!("wrote dev and test predictions");

    Ok(scores)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::train::train_multitask;
    use clap::Parser;

    #[test]
    fn test_prediction_file_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out/sst.csv");
        let predictions = Predictions {
            ids: vec!["a1".to_string(), "b2".to_string()],
            values: vec![3usize, 0],
        };

        write_predictions(&path, "Sentiment", &predictions).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "id , Predicted_Sentiment\na1 , 3\nb2 , 0\n");
    }

    #[test]
    fn test_missing_checkpoint_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = dir.path().join("absent.ckpt");
        let args = TrainArgs::parse_from(["multitask_classifier", "--filepath", ckpt.to_str().unwrap()]);

        let err = test_multitask(&args, &mut RngContext::seeded(0)).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_train_then_predict_writes_six_files() {
        let dir = tempfile::tempdir().unwrap();
        let file = |name: &str, contents: &str| {
            let path = dir.path().join(name);
            fs::write(&path, contents).unwrap();
            path.to_string_lossy().into_owned()
        };
        let sst = file("sst.tsv", "id\tsentence\tsentiment\na\tgood\t4\nb\tbad\t0\n");
        let sst_test = file("sst-test.tsv", "id\tsentence\nt1\tgood bad\n");
        let para = file(
            "para.tsv",
            "id\tsentence1\tsentence2\tis_duplicate\np\tgood\tgood\t1\nq\tgood\tbad\t0\n",
        );
        let para_test = file("para-test.tsv", "id\tsentence1\tsentence2\nt2\tbad\tgood\n");
        let sts = file(
            "sts.tsv",
            "id\tsentence1\tsentence2\tsimilarity\nx\tgood\tgood\t5\ny\tgood\tbad\t1\n",
        );
        let sts_test = file("sts-test.tsv", "id\tsentence1\tsentence2\nt3\tbad\tbad\n");
        let out = |name: &str| dir.path().join("predictions").join(name).to_string_lossy().into_owned();
        let ckpt = dir.path().join("model.ckpt").to_string_lossy().into_owned();

        let mut argv: Vec<String> = vec!["multitask_classifier".into()];
        for (flag, value) in [
            ("--sst-train", sst.clone()),
            ("--sst-dev", sst),
            ("--sst-test", sst_test),
            ("--para-train", para.clone()),
            ("--para-dev", para),
            ("--para-test", para_test),
            ("--sts-train", sts.clone()),
            ("--sts-dev", sts),
            ("--sts-test", sts_test),
            ("--sst-dev-out", out("sst-dev.csv")),
            ("--sst-test-out", out("sst-test.csv")),
            ("--para-dev-out", out("para-dev.csv")),
            ("--para-test-out", out("para-test.csv")),
            ("--sts-dev-out", out("sts-dev.csv")),
            ("--sts-test-out", out("sts-test.csv")),
            ("--epochs", "1".into()),
            ("--hidden-size", "8".into()),
            ("--filepath", ckpt),
        ] {
            argv.push(flag.into());
            argv.push(value);
        }
        let args = TrainArgs::parse_from(argv);

        let history = train_multitask(&args, &mut RngContext::seeded(args.seed)).unwrap();
        let scores = test_multitask(&args, &mut RngContext::seeded(args.seed)).unwrap();
        // Same model and data as the last training epoch's dev evaluation
        assert_eq!(scores, history[0].dev);

        let sst_test_out = fs::read_to_string(out("sst-test.csv")).unwrap();
        assert!(sst_test_out.starts_with("id , Predicted_Sentiment\nt1 , "));
        let para_dev_out = fs::read_to_string(out("para-dev.csv")).unwrap();
        assert_eq!(para_dev_out.lines().count(), 3);
        assert!(para_dev_out.lines().skip(1).all(|l| l.ends_with(" , 0") || l.ends_with(" , 1")));
        let sts_test_out = fs::read_to_string(out("sts-test.csv")).unwrap();
        assert!(sts_test_out.starts_with("id , Predicted_Similarity\nt3 , "));
        for name in ["sst-dev.csv", "para-test.csv", "sts-dev.csv"] {
            assert!(dir.path().join("predictions").join(name).exists());
        }
    }
}
