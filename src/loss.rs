//! Task Losses
//!
//! Each loss sums over the batch and divides by a caller-supplied
//! `normalizer` (the configured batch size during training, so a short final
//! batch contributes proportionally less). Every function returns the loss
//! together with its gradient with respect to the model output.
//!
//! ```text
//! sentiment    Σ -log softmax(logits)[y]        / n
//! paraphrase   Σ BCE(sigmoid(logit), y)         / n
//! similarity   Σ (scale · score - y)²           / n
//! ```

use crate::layers::sigmoid;
use crate::tensor::Tensor;

/// Summed cross-entropy over rows of `[batch, classes]` logits
pub fn cross_entropy(logits: &Tensor, labels: &[usize], normalizer: f32) -> (f32, Tensor) {
    assert_eq!(logits.rows(), labels.len(), "one label per row");
    let classes = logits.cols();
    let mut loss = 0.0;
    let mut grad = Vec::with_capacity(logits.len());

    for (i, &label) in labels.iter().enumerate() {
        let row = logits.row(i);
        // Subtract the max for numerical stability
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exp: Vec<f32> = row.iter().map(|&v| (v - max).exp()).collect();
        let sum: f32 = exp.iter().sum();

        loss += sum.ln() - (row[label] - max);
        for (c, &e) in exp.iter().enumerate() {
            let target = if c == label { 1.0 } else { 0.0 };
            grad.push((e / sum - target) / normalizer);
        }
    }

    (loss / normalizer, Tensor::new(grad, vec![labels.len(), classes]))
}

/// Summed binary cross-entropy on unnormalized logits
///
/// Uses `max(x, 0) - x·y + ln(1 + e^-|x|)`, stable for large `|x|`.
pub fn bce_with_logits(logits: &Tensor, labels: &[f32], normalizer: f32) -> (f32, Tensor) {
    assert_eq!(logits.len(), labels.len(), "one label per logit");
    let mut loss = 0.0;
    let grad = logits
        .data
        .iter()
        .zip(labels)
        .map(|(&x, &y)| {
            loss += x.max(0.0) - x * y + (-x.abs()).exp().ln_1p();
            (sigmoid(x) - y) / normalizer
        })
        .collect();

    (loss / normalizer, Tensor::new(grad, logits.shape.clone()))
}

/// Summed squared error of `scale · scores` against `labels`
pub fn scaled_squared_error(scores: &Tensor, labels: &[f32], scale: f32, normalizer: f32) -> (f32, Tensor) {
    assert_eq!(scores.len(), labels.len(), "one label per score");
    let mut loss = 0.0;
    let grad = scores
        .data
        .iter()
        .zip(labels)
        .map(|(&s, &y)| {
            let diff = scale * s - y;
            loss += diff * diff;
            2.0 * scale * diff / normalizer
        })
        .collect();

    (loss / normalizer, Tensor::new(grad, scores.shape.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_gradient<F: Fn(&Tensor) -> f32>(f: F, x: &Tensor, grad: &Tensor) {
        let h = 1e-2;
        for i in 0..x.len() {
            let mut plus = x.clone();
            let mut minus = x.clone();
            plus.data[i] += h;
            minus.data[i] -= h;
            let numeric = (f(&plus) - f(&minus)) / (2.0 * h);
            assert!((grad.data[i] - numeric).abs() < 1e-3, "element {}: {} vs {}", i, grad.data[i], numeric);
        }
    }

    #[test]
    fn test_cross_entropy_uniform_logits() {
        let logits = Tensor::zeros(vec![2, 5]);
        let (loss, grad) = cross_entropy(&logits, &[0, 3], 2.0);
        assert!((loss - 5.0f32.ln()).abs() < 1e-6);
        assert!((grad.data[0] - (0.2 - 1.0) / 2.0).abs() < 1e-6);
        assert!((grad.data[1] - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_cross_entropy_gradient() {
        let logits = Tensor::new(vec![0.5, -1.0, 2.0, 0.0, 1.5, 3.0], vec![2, 3]);
        let labels = [2, 0];
        let (loss, grad) = cross_entropy(&logits, &labels, 8.0);
        assert!(loss.is_finite());
        check_gradient(|x| cross_entropy(x, &labels, 8.0).0, &logits, &grad);
    }

    #[test]
    fn test_bce_matches_definition_and_is_stable() {
        let logits = Tensor::new(vec![0.3, -2.0], vec![2, 1]);
        let labels = [1.0, 0.0];
        let (loss, grad) = bce_with_logits(&logits, &labels, 1.0);
        let expected = -(sigmoid(0.3).ln()) - (1.0 - sigmoid(-2.0)).ln();
        assert!((loss - expected).abs() < 1e-5);
        check_gradient(|x| bce_with_logits(x, &labels, 1.0).0, &logits, &grad);

        let (extreme, _) = bce_with_logits(&Tensor::vector(vec![100.0, -100.0]), &[0.0, 1.0], 1.0);
        assert!((extreme - 200.0).abs() < 1e-3);
    }

    #[test]
    fn test_scaled_squared_error() {
        let scores = Tensor::vector(vec![0.5, 0.9]);
        let labels = [2.5, 3.0];
        let (loss, grad) = scaled_squared_error(&scores, &labels, 5.0, 4.0);
        // (2.5 - 2.5)² + (4.5 - 3.0)² = 2.25
        assert!((loss - 2.25 / 4.0).abs() < 1e-6);
        check_gradient(|x| scaled_squared_error(x, &labels, 5.0, 4.0).0, &scores, &grad);
    }
}
