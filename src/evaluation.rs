//! Evaluation and Prediction
//!
//! Runs the model in eval mode over whole splits and scores it:
//!
//! | task       | prediction                 | metric              |
//! |------------|----------------------------|---------------------|
//! | sentiment  | argmax of the 5 logits     | accuracy            |
//! | paraphrase | `round(sigmoid(logit))`    | accuracy            |
//! | similarity | head score in `[0, 1]`     | Pearson correlation |
//!
//! Pearson correlation is invariant to the `×5` rescaling used in the
//! similarity loss, so raw head scores are both scored and written out.

use rand::Rng;

use crate::data::{DataLoader, PairRecord, SentimentRecord};
use crate::encoder::Encoder;
use crate::layers::sigmoid;
use crate::model::MultitaskModel;

/// Predictions for one split, in loader order
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Predictions<T> {
    pub ids: Vec<String>,
    pub values: Vec<T>,
}

impl<T> Predictions<T> {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.ids.iter().map(String::as_str).zip(&self.values)
    }
}

/// Predictions of all three tasks
#[derive(Clone, Debug, Default)]
pub struct MultitaskPredictions {
    pub sentiment: Predictions<usize>,
    pub paraphrase: Predictions<u8>,
    pub similarity: Predictions<f32>,
}

/// One score per task
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TaskScores {
    pub sentiment_accuracy: f64,
    pub paraphrase_accuracy: f64,
    pub similarity_correlation: f64,
}

impl TaskScores {
    /// Unweighted mean of the three scores
    pub fn mean(&self) -> f64 {
        (self.sentiment_accuracy + self.paraphrase_accuracy + self.similarity_correlation) / 3.0
    }
}

/// Fraction of matching positions; 0 for empty input
pub fn accuracy<T: PartialEq>(predicted: &[T], expected: &[T]) -> f64 {
    assert_eq!(predicted.len(), expected.len(), "prediction and label counts differ");
    if predicted.is_empty() {
        return 0.0;
    }
    let hits = predicted.iter().zip(expected).filter(|(p, e)| p == e).count();
    hits as f64 / predicted.len() as f64
}

/// Pearson correlation coefficient
///
/// Returns 0 when either side has no variance (including fewer than two
/// points), where the coefficient is undefined.
pub fn pearson(x: &[f32], y: &[f32]) -> f64 {
    assert_eq!(x.len(), y.len(), "pearson needs paired samples");
    let n = x.len() as f64;
    if x.len() < 2 {
        return 0.0;
    }
    let mean_x = x.iter().map(|&v| v as f64).sum::<f64>() / n;
    let mean_y = y.iter().map(|&v| v as f64).sum::<f64>() / n;

    let (mut cov, mut var_x, mut var_y) = (0.0, 0.0, 0.0);
    for (&a, &b) in x.iter().zip(y) {
        let (dx, dy) = (a as f64 - mean_x, b as f64 - mean_y);
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    if var_x == 0.0 || var_y == 0.0 {
        return 0.0;
    }
    cov / (var_x.sqrt() * var_y.sqrt())
}

fn argmax(row: &[f32]) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
        .0
}

/// Sentiment predictions and, where present, the gold labels
pub fn predict_sentiment<E: Encoder, R: Rng + ?Sized>(
    model: &MultitaskModel<E>,
    loader: &DataLoader<SentimentRecord>,
    rng: &mut R,
) -> (Predictions<usize>, Vec<usize>) {
    let mut predictions = Predictions::default();
    let mut labels = Vec::new();
    for batch in loader.sequential() {
        let logits = model.predict_sentiment(&batch.tokens, rng);
        predictions
            .values
            .extend((0..logits.rows()).map(|i| argmax(logits.row(i))));
        predictions.ids.extend(batch.ids);
        labels.extend(batch.labels.into_iter().flatten());
    }
    (predictions, labels)
}

pub fn predict_paraphrase<E: Encoder, R: Rng + ?Sized>(
    model: &MultitaskModel<E>,
    loader: &DataLoader<PairRecord>,
    rng: &mut R,
) -> (Predictions<u8>, Vec<u8>) {
    let mut predictions = Predictions::default();
    let mut labels = Vec::new();
    for batch in loader.sequential() {
        let logits = model.predict_paraphrase(&batch.tokens1, &batch.tokens2, rng);
        predictions
            .values
            .extend(logits.data.iter().map(|&x| sigmoid(x).round() as u8));
        predictions.ids.extend(batch.ids);
        labels.extend(batch.labels.into_iter().flatten().map(|y| y.round() as u8));
    }
    (predictions, labels)
}

pub fn predict_similarity<E: Encoder, R: Rng + ?Sized>(
    model: &MultitaskModel<E>,
    loader: &DataLoader<PairRecord>,
    rng: &mut R,
) -> (Predictions<f32>, Vec<f32>) {
    let mut predictions = Predictions::default();
    let mut labels = Vec::new();
    for batch in loader.sequential() {
        let scores = model.predict_similarity(&batch.tokens1, &batch.tokens2, rng);
        predictions.values.extend(scores.data);
        predictions.ids.extend(batch.ids);
        labels.extend(batch.labels.into_iter().flatten());
    }
    (predictions, labels)
}

/// Score the model on labelled splits of all three tasks
///
/// Puts the model in eval mode.
pub fn evaluate_multitask<E: Encoder, R: Rng + ?Sized>(
    model: &mut MultitaskModel<E>,
    sentiment: &DataLoader<SentimentRecord>,
    paraphrase: &DataLoader<PairRecord>,
    similarity: &DataLoader<PairRecord>,
    rng: &mut R,
) -> (TaskScores, MultitaskPredictions) {
    model.set_training(false);

    let (sst, sst_labels) = predict_sentiment(model, sentiment, rng);
    let (para, para_labels) = predict_paraphrase(model, paraphrase, rng);
    let (sts, sts_labels) = predict_similarity(model, similarity, rng);

    let scores = TaskScores {
        sentiment_accuracy: accuracy(&sst.values, &sst_labels),
        paraphrase_accuracy: accuracy(&para.values, &para_labels),
        similarity_correlation: pearson(&sts.values, &sts_labels),
    };
    let predictions = MultitaskPredictions {
        sentiment: sst,
        paraphrase: para,
        similarity: sts,
    };
    (scores, predictions)
}

/// Predict unlabelled splits of all three tasks
///
/// Puts the model in eval mode.
pub fn predict_test<E: Encoder, R: Rng + ?Sized>(
    model: &mut MultitaskModel<E>,
    sentiment: &DataLoader<SentimentRecord>,
    paraphrase: &DataLoader<PairRecord>,
    similarity: &DataLoader<PairRecord>,
    rng: &mut R,
) -> MultitaskPredictions {
    model.set_training(false);
    MultitaskPredictions {
        sentiment: predict_sentiment(model, sentiment, rng).0,
        paraphrase: predict_paraphrase(model, paraphrase, rng).0,
        similarity: predict_similarity(model, similarity, rng).0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_accuracy() {
        assert_eq!(accuracy(&[1, 2, 3, 4], &[1, 0, 3, 0]), 0.5);
        assert_eq!(accuracy::<u8>(&[], &[]), 0.0);
    }

    #[test]
    fn test_pearson_known_values() {
        let x = [1.0, 2.0, 3.0, 4.0];
        assert!((pearson(&x, &[2.0, 4.0, 6.0, 8.0]) - 1.0).abs() < 1e-12);
        assert!((pearson(&x, &[4.0, 3.0, 2.0, 1.0]) + 1.0).abs() < 1e-12);
        // Scale invariance
        let scaled: Vec<f32> = x.iter().map(|v| v * 5.0).collect();
        let y = [1.5, 0.5, 4.0, 3.0];
        assert!((pearson(&x, &y) - pearson(&scaled, &y)).abs() < 1e-9);
        // 6 / sqrt(10 * 6)
        assert!((pearson(&[1.0, 2.0, 3.0, 4.0, 5.0], &[2.0, 4.0, 5.0, 4.0, 5.0]) - 0.774_596_669).abs() < 1e-6);
    }

    #[test]
    fn test_pearson_degenerate_is_zero() {
        assert_eq!(pearson(&[0.0, 0.0, 0.0], &[1.0, 2.0, 3.0]), 0.0);
        assert_eq!(pearson(&[1.0], &[2.0]), 0.0);
    }

    #[test]
    fn test_argmax_first_maximum() {
        assert_eq!(argmax(&[0.1, 0.7, 0.7, -1.0]), 1);
    }

    #[test]
    fn test_evaluate_sets_eval_mode_and_keeps_order() {
        let mut config = ModelConfig::tiny(10);
        config.hidden_dropout_prob = 0.4;
        let mut model = MultitaskModel::new(config, &mut ChaCha8Rng::seed_from_u64(1));

        let sst = DataLoader::new(
            (0..5)
                .map(|i| SentimentRecord { id: format!("s{i}"), tokens: vec![2 + i], label: Some(i % 5) })
                .collect(),
            2,
            true,
        );
        let pairs = |n: usize, label: f32| {
            DataLoader::new(
                (0..n)
                    .map(|i| PairRecord {
                        id: format!("p{i}"),
                        tokens1: vec![2 + i],
                        tokens2: vec![3 + i, 4],
                        label: Some(label),
                    })
                    .collect(),
                2,
                false,
            )
        };
        let (para, sts) = (pairs(3, 1.0), pairs(4, 2.0));

        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let (first, preds) = evaluate_multitask(&mut model, &sst, &para, &sts, &mut rng);
        assert!(!model.is_training());
        let (second, _) = evaluate_multitask(&mut model, &sst, &para, &sts, &mut rng);
        assert_eq!(first, second);

        let ids: Vec<&str> = preds.sentiment.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["s0", "s1", "s2", "s3", "s4"]);
        assert!(preds.paraphrase.values.iter().all(|&v| v <= 1));
        // Constant labels have no variance
        assert_eq!(first.similarity_correlation, 0.0);
    }
}
