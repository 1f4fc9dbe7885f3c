//! Multitask Model
//!
//! One shared [`Encoder`] feeding three task heads:
//!
//! ```text
//!                         ┌─► SentimentHead  ─► 5 logits
//! tokens ─► Encoder ─► e ─┼─► ParaphraseHead ─► 1 logit      (pairs)
//!                         └─► SimilarityHead ─► score [0,1]  (pairs)
//! ```
//!
//! Every parameter, encoder and heads alike, lives in the model's single
//! [`ParamStore`], so one optimizer sees the whole model.
//!
//! ## Training modes
//!
//! - `pretrain`: encoder parameters are frozen at construction and never
//!   record gradients; only the heads learn.
//! - `finetune`: everything learns.
//!
//! ## Training step
//!
//! [`MultitaskModel::train_step`] runs forward, loss and backward for one
//! task batch and *adds* the resulting gradients into the store. It never
//! zeroes gradients, so several tasks can contribute to one optimizer step.

use rand::Rng;

use crate::config::{ModelConfig, TrainMode};
use crate::data::{PairBatch, SentimentBatch, TokenBatch};
use crate::encoder::{EmbeddingBagEncoder, Encoder};
use crate::error::{Error, Result};
use crate::heads::{ParaphraseHead, SentimentHead, SimilarityHead};
use crate::loss;
use crate::params::ParamStore;
use crate::tensor::Tensor;

/// Similarity scores are compared against labels on a 0-5 scale
pub const SIMILARITY_SCALE: f32 = 5.0;

/// The three tasks trained jointly
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Sentiment,
    Paraphrase,
    Similarity,
}

impl TaskKind {
    pub fn name(self) -> &'static str {
        match self {
            TaskKind::Sentiment => "sentiment",
            TaskKind::Paraphrase => "paraphrase",
            TaskKind::Similarity => "similarity",
        }
    }
}

/// A batch tagged with the task it belongs to
#[derive(Clone, Copy, Debug)]
pub enum TaskBatch<'a> {
    Sentiment(&'a SentimentBatch),
    Paraphrase(&'a PairBatch),
    Similarity(&'a PairBatch),
}

impl TaskBatch<'_> {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskBatch::Sentiment(_) => TaskKind::Sentiment,
            TaskBatch::Paraphrase(_) => TaskKind::Paraphrase,
            TaskBatch::Similarity(_) => TaskKind::Similarity,
        }
    }
}

/// Shared encoder plus sentiment, paraphrase and similarity heads
#[derive(Clone, Debug)]
pub struct MultitaskModel<E: Encoder = EmbeddingBagEncoder> {
    pub config: ModelConfig,
    pub params: ParamStore,
    pub encoder: E,
    pub sentiment: SentimentHead,
    pub paraphrase: ParaphraseHead,
    pub similarity: SimilarityHead,
    training: bool,
}

impl MultitaskModel<EmbeddingBagEncoder> {
    /// Build a freshly initialized model with the embedding-bag encoder
    pub fn new<R: Rng + ?Sized>(config: ModelConfig, rng: &mut R) -> Self {
        let mut params = ParamStore::new();
        let encoder = EmbeddingBagEncoder::new(&mut params, &config, rng);
        Self::with_encoder(config, params, encoder, rng)
    }
}

impl<E: Encoder> MultitaskModel<E> {
    /// Add the task heads on top of an encoder already registered in `params`
    ///
    /// # Panics
    ///
    /// Panics if the encoder width differs from `config.hidden_size`.
    pub fn with_encoder<R: Rng + ?Sized>(config: ModelConfig, mut params: ParamStore, encoder: E, rng: &mut R) -> Self {
        assert_eq!(
            encoder.hidden_size(),
            config.hidden_size,
            "encoder width must match the configured hidden size"
        );

        let sentiment = SentimentHead::new(&mut params, &config, rng);
        let paraphrase = ParaphraseHead::new(&mut params, &config, rng);
        let similarity = SimilarityHead::new(&mut params, &config, rng);

        if config.option == TrainMode::Pretrain {
            params.set_requires_grad(&encoder.parameters(), false);
        }

        Self {
            config,
            params,
            encoder,
            sentiment,
            paraphrase,
            similarity,
            training: true,
        }
    }

    /// Switch dropout on (training) or off (evaluation)
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
        self.sentiment.set_training(training);
        self.paraphrase.set_training(training);
        self.similarity.set_training(training);
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Sentence embeddings `[batch, hidden]`
    pub fn embed(&self, tokens: &TokenBatch) -> Tensor {
        self.encoder.encode(&self.params, tokens).0
    }

    /// Sentiment logits `[batch, 5]`
    pub fn predict_sentiment<R: Rng + ?Sized>(&self, tokens: &TokenBatch, rng: &mut R) -> Tensor {
        let e = self.embed(tokens);
        self.sentiment.forward(&self.params, &e, rng).0
    }

    /// Unnormalized paraphrase logits `[batch, 1]`
    pub fn predict_paraphrase<R: Rng + ?Sized>(&self, first: &TokenBatch, second: &TokenBatch, rng: &mut R) -> Tensor {
        let (a, b) = (self.embed(first), self.embed(second));
        self.paraphrase.forward(&self.params, &a, &b, rng).0
    }

    /// Similarity scores `[batch]` in `[0, 1]`
    pub fn predict_similarity<R: Rng + ?Sized>(&self, first: &TokenBatch, second: &TokenBatch, rng: &mut R) -> Tensor {
        let (a, b) = (self.embed(first), self.embed(second));
        self.similarity.forward(&self.params, &a, &b, rng).0
    }

    fn encoder_trainable(&self) -> bool {
        self.encoder
            .parameters()
            .iter()
            .any(|&id| self.params.requires_grad(id))
    }

    /// Forward, loss and backward for one task batch
    ///
    /// Gradients are added to whatever the store already holds. Returns the
    /// batch loss divided by `normalizer`.
    ///
    /// # Errors
    ///
    /// [`Error::MissingLabels`] if the batch comes from an unlabelled split.
    pub fn train_step<R: Rng + ?Sized>(&mut self, batch: TaskBatch<'_>, normalizer: f32, rng: &mut R) -> Result<f32> {
        let missing = || Error::MissingLabels {
            task: batch.kind().name(),
        };
        let train_encoder = self.encoder_trainable();

        match batch {
            TaskBatch::Sentiment(b) => {
                let labels = b.labels.as_deref().ok_or_else(missing)?;
                let (e, enc_cache) = self.encoder.encode(&self.params, &b.tokens);
                let (logits, head_cache) = self.sentiment.forward(&self.params, &e, rng);
                let (loss, grad) = loss::cross_entropy(&logits, labels, normalizer);

                let grad_e = self.sentiment.backward(&mut self.params, &grad, &head_cache);
                if train_encoder {
                    self.encoder.backward(&mut self.params, &grad_e, &enc_cache);
                }
                Ok(loss)
            }
            TaskBatch::Paraphrase(b) => {
                let labels = b.labels.as_deref().ok_or_else(missing)?;
                let (a, cache_a) = self.encoder.encode(&self.params, &b.tokens1);
                let (c, cache_c) = self.encoder.encode(&self.params, &b.tokens2);
                let (logits, head_cache) = self.paraphrase.forward(&self.params, &a, &c, rng);
                let (loss, grad) = loss::bce_with_logits(&logits, labels, normalizer);

                let (grad_a, grad_c) = self.paraphrase.backward(&mut self.params, &grad, &head_cache);
                if train_encoder {
                    self.encoder.backward(&mut self.params, &grad_a, &cache_a);
                    self.encoder.backward(&mut self.params, &grad_c, &cache_c);
                }
                Ok(loss)
            }
            TaskBatch::Similarity(b) => {
                let labels = b.labels.as_deref().ok_or_else(missing)?;
                let (a, cache_a) = self.encoder.encode(&self.params, &b.tokens1);
                let (c, cache_c) = self.encoder.encode(&self.params, &b.tokens2);
                let (scores, head_cache) = self.similarity.forward(&self.params, &a, &c, rng);
                let (loss, grad) = loss::scaled_squared_error(&scores, labels, SIMILARITY_SCALE, normalizer);

                let (grad_a, grad_c) = self.similarity.backward(&mut self.params, &grad, &head_cache);
                if train_encoder {
                    self.encoder.backward(&mut self.params, &grad_a, &cache_a);
                    self.encoder.backward(&mut self.params, &grad_c, &cache_c);
                }
                Ok(loss)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Collate, PairRecord, SentimentRecord};
    use crate::params::Gradient;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn model(option: TrainMode) -> MultitaskModel {
        let mut config = ModelConfig::tiny(12);
        config.option = option;
        MultitaskModel::new(config, &mut ChaCha8Rng::seed_from_u64(3))
    }

    fn sentiment_batch() -> SentimentBatch {
        let records = [
            SentimentRecord { id: "a".into(), tokens: vec![2, 3, 4], label: Some(4) },
            SentimentRecord { id: "b".into(), tokens: vec![5], label: Some(0) },
        ];
        SentimentRecord::collate(&records.iter().collect::<Vec<_>>())
    }

    fn pair_batch(labels: [f32; 2]) -> PairBatch {
        let records = [
            PairRecord { id: "p".into(), tokens1: vec![2, 6], tokens2: vec![6, 7, 8], label: Some(labels[0]) },
            PairRecord { id: "q".into(), tokens1: vec![9], tokens2: vec![10, 11], label: Some(labels[1]) },
        ];
        PairRecord::collate(&records.iter().collect::<Vec<_>>())
    }

    #[test]
    fn test_pretrain_freezes_encoder() {
        let mut m = model(TrainMode::Pretrain);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        m.train_step(TaskBatch::Sentiment(&sentiment_batch()), 8.0, &mut rng).unwrap();

        assert!(m.encoder.parameters().iter().all(|&id| m.params.grad(id).is_none()));
        assert!(m.params.grad(m.sentiment.classifier.weight).is_some());
        // Heads that did not take part have no gradient
        assert!(m.params.grad(m.paraphrase.output.weight).is_none());
    }

    #[test]
    fn test_finetune_trains_encoder() {
        let mut m = model(TrainMode::Finetune);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        m.train_step(TaskBatch::Paraphrase(&pair_batch([1.0, 0.0])), 8.0, &mut rng).unwrap();
        assert!(m.encoder.parameters().iter().all(|&id| m.params.grad(id).is_some()));
    }

    #[test]
    fn test_unlabelled_batch_is_rejected() {
        let mut m = model(TrainMode::Finetune);
        let mut batch = sentiment_batch();
        batch.labels = None;
        let err = m
            .train_step(TaskBatch::Sentiment(&batch), 8.0, &mut ChaCha8Rng::seed_from_u64(0))
            .unwrap_err();
        assert!(matches!(err, Error::MissingLabels { task: "sentiment" }));
    }

    #[test]
    fn test_similarity_loss_uses_scaled_scores() {
        let mut m = model(TrainMode::Finetune);
        let batch = pair_batch([4.0, 1.5]);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let scores = m.predict_similarity(&batch.tokens1, &batch.tokens2, &mut rng);
        let expected: f32 = scores
            .data
            .iter()
            .zip([4.0, 1.5])
            .map(|(s, y)| (SIMILARITY_SCALE * s - y).powi(2))
            .sum::<f32>()
            / 8.0;
        let loss = m.train_step(TaskBatch::Similarity(&batch), 8.0, &mut rng).unwrap();
        assert!((loss - expected).abs() < 1e-5);
    }

    #[test]
    fn test_parameter_gradient_matches_finite_differences() {
        let sst = sentiment_batch();
        let para = pair_batch([1.0, 0.0]);
        let sts = pair_batch([3.0, 0.5]);
        let batches = [TaskBatch::Sentiment(&sst), TaskBatch::Paraphrase(&para), TaskBatch::Similarity(&sts)];

        for batch in batches {
            let mut m = model(TrainMode::Finetune);
            let mut rng = ChaCha8Rng::seed_from_u64(0);
            m.train_step(batch, 2.0, &mut rng).unwrap();

            let pooler = m.encoder.pooler.weight;
            let analytic = match m.params.grad(pooler) {
                Some(Gradient::Dense(g)) => g.data[1],
                other => panic!("expected dense gradient, got {:?}", other),
            };

            let h = 1e-2;
            let loss_at = |delta: f32| {
                let mut probe = m.clone();
                probe.params.get_mut(pooler).value.data[1] += delta;
                probe.train_step(batch, 2.0, &mut ChaCha8Rng::seed_from_u64(0)).unwrap()
            };
            let numeric = (loss_at(h) - loss_at(-h)) / (2.0 * h);
            assert!(
                (analytic - numeric).abs() < 2e-3,
                "{}: {} vs {}",
                batch.kind().name(),
                analytic,
                numeric
            );
        }
    }

    #[test]
    fn test_eval_mode_disables_dropout() {
        let mut config = ModelConfig::tiny(12);
        config.hidden_dropout_prob = 0.5;
        let mut m = MultitaskModel::new(config, &mut ChaCha8Rng::seed_from_u64(3));
        let batch = sentiment_batch();

        m.set_training(false);
        let a = m.predict_sentiment(&batch.tokens, &mut ChaCha8Rng::seed_from_u64(1));
        let b = m.predict_sentiment(&batch.tokens, &mut ChaCha8Rng::seed_from_u64(2));
        assert_eq!(a, b);

        m.set_training(true);
        let c = m.predict_sentiment(&batch.tokens, &mut ChaCha8Rng::seed_from_u64(1));
        assert_ne!(a, c);
    }
}
