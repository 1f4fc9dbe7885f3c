//! Task Heads
//!
//! Small networks on top of the shared encoder, one per task. Each consumes
//! sentence embeddings of width `H` and produces the task's raw output:
//!
//! ```text
//! SentimentHead   e ──► dropout ──► linear H→5 ──► logits [B, 5]
//!
//! ParaphraseHead  [a; b] ──► dropout ──► linear 2H→P ──► ReLU
//!                        ──► dropout ──► linear P→1  ──► logit [B, 1]
//!
//! SimilarityHead  a ──► dropout ──► linear H→S ─┐
//!                                               ├─► cosine ──► ReLU ──► score [B]
//!                 b ──► dropout ──► linear H→S ─┘
//! ```
//!
//! The paraphrase logit is unnormalized; the sigmoid belongs to the loss and
//! to prediction. The similarity score lies in `[0, 1]` and is rescaled to the
//! label range by the loss.
//!
//! Like the layers they are built from, heads return a cache from `forward`
//! and take it back in `backward`, which accumulates parameter gradients and
//! returns the gradient with respect to each input embedding.

use rand::Rng;

use crate::config::ModelConfig;
use crate::layers::{
    cosine_similarity_backward, cosine_similarity_forward, relu_backward, relu_forward, CosineCache,
    DropoutCache, LinearCache, TrainableDropout, TrainableLinear,
};
use crate::params::{ParamId, ParamStore};
use crate::tensor::Tensor;

/// Five-way sentiment classifier
#[derive(Clone, Debug)]
pub struct SentimentHead {
    pub dropout: TrainableDropout,
    pub classifier: TrainableLinear,
}

#[derive(Clone, Debug)]
pub struct SentimentHeadCache {
    dropout: DropoutCache,
    classifier: LinearCache,
}

impl SentimentHead {
    pub fn new<R: Rng + ?Sized>(params: &mut ParamStore, config: &ModelConfig, rng: &mut R) -> Self {
        Self {
            dropout: TrainableDropout::new(config.hidden_dropout_prob),
            classifier: TrainableLinear::new(
                params,
                "sentiment.classifier",
                config.hidden_size,
                config.num_labels,
                rng,
            ),
        }
    }

    pub fn forward<R: Rng + ?Sized>(
        &self,
        params: &ParamStore,
        embeddings: &Tensor,
        rng: &mut R,
    ) -> (Tensor, SentimentHeadCache) {
        let (x, dropout) = self.dropout.forward(embeddings, rng);
        let (logits, classifier) = self.classifier.forward(params, &x);
        (logits, SentimentHeadCache { dropout, classifier })
    }

    pub fn backward(&self, params: &mut ParamStore, grad_logits: &Tensor, cache: &SentimentHeadCache) -> Tensor {
        let grad_x = self.classifier.backward(params, grad_logits, &cache.classifier);
        self.dropout.backward(&grad_x, &cache.dropout)
    }

    pub fn set_training(&mut self, training: bool) {
        self.dropout.training = training;
    }

    pub fn parameters(&self) -> Vec<ParamId> {
        self.classifier.parameters().to_vec()
    }
}

/// Binary paraphrase classifier over a concatenated pair
#[derive(Clone, Debug)]
pub struct ParaphraseHead {
    pub dropout_in: TrainableDropout,
    pub hidden: TrainableLinear,
    pub dropout_hidden: TrainableDropout,
    pub output: TrainableLinear,
    hidden_size: usize,
}

#[derive(Clone, Debug)]
pub struct ParaphraseHeadCache {
    dropout_in: DropoutCache,
    hidden: LinearCache,
    pre_activation: Tensor,
    dropout_hidden: DropoutCache,
    output: LinearCache,
}

impl ParaphraseHead {
    pub fn new<R: Rng + ?Sized>(params: &mut ParamStore, config: &ModelConfig, rng: &mut R) -> Self {
        let h = config.hidden_size;
        Self {
            dropout_in: TrainableDropout::new(config.hidden_dropout_prob),
            hidden: TrainableLinear::new(params, "paraphrase.hidden", 2 * h, config.paraphrase_hidden, rng),
            dropout_hidden: TrainableDropout::new(config.hidden_dropout_prob),
            output: TrainableLinear::new(params, "paraphrase.output", config.paraphrase_hidden, 1, rng),
            hidden_size: h,
        }
    }

    /// Logits `[batch, 1]` for pairs `(a[i], b[i])`
    pub fn forward<R: Rng + ?Sized>(
        &self,
        params: &ParamStore,
        a: &Tensor,
        b: &Tensor,
        rng: &mut R,
    ) -> (Tensor, ParaphraseHeadCache) {
        let pair = a.concat_cols(b);
        let (x, dropout_in) = self.dropout_in.forward(&pair, rng);
        let (pre_activation, hidden) = self.hidden.forward(params, &x);
        let activated = relu_forward(&pre_activation);
        let (x, dropout_hidden) = self.dropout_hidden.forward(&activated, rng);
        let (logits, output) = self.output.forward(params, &x);

        let cache = ParaphraseHeadCache {
            dropout_in,
            hidden,
            pre_activation,
            dropout_hidden,
            output,
        };
        (logits, cache)
    }

    /// Gradients with respect to `a` and `b`
    pub fn backward(
        &self,
        params: &mut ParamStore,
        grad_logits: &Tensor,
        cache: &ParaphraseHeadCache,
    ) -> (Tensor, Tensor) {
        let grad = self.output.backward(params, grad_logits, &cache.output);
        let grad = self.dropout_hidden.backward(&grad, &cache.dropout_hidden);
        let grad = relu_backward(&grad, &cache.pre_activation);
        let grad = self.hidden.backward(params, &grad, &cache.hidden);
        let grad = self.dropout_in.backward(&grad, &cache.dropout_in);
        grad.split_cols(self.hidden_size)
    }

    pub fn set_training(&mut self, training: bool) {
        self.dropout_in.training = training;
        self.dropout_hidden.training = training;
    }

    pub fn parameters(&self) -> Vec<ParamId> {
        let mut ids = self.hidden.parameters().to_vec();
        ids.extend(self.output.parameters());
        ids
    }
}

/// Cosine similarity of two separately projected sentences
#[derive(Clone, Debug)]
pub struct SimilarityHead {
    pub dropout_a: TrainableDropout,
    pub proj_a: TrainableLinear,
    pub dropout_b: TrainableDropout,
    pub proj_b: TrainableLinear,
}

#[derive(Clone, Debug)]
pub struct SimilarityHeadCache {
    dropout_a: DropoutCache,
    proj_a: LinearCache,
    dropout_b: DropoutCache,
    proj_b: LinearCache,
    cosine: CosineCache,
    cos: Tensor,
}

impl SimilarityHead {
    pub fn new<R: Rng + ?Sized>(params: &mut ParamStore, config: &ModelConfig, rng: &mut R) -> Self {
        let (h, s) = (config.hidden_size, config.similarity_proj);
        Self {
            dropout_a: TrainableDropout::new(config.hidden_dropout_prob),
            proj_a: TrainableLinear::new(params, "similarity.proj_a", h, s, rng),
            dropout_b: TrainableDropout::new(config.hidden_dropout_prob),
            proj_b: TrainableLinear::new(params, "similarity.proj_b", h, s, rng),
        }
    }

    /// Scores `[batch]` in `[0, 1]`
    pub fn forward<R: Rng + ?Sized>(
        &self,
        params: &ParamStore,
        a: &Tensor,
        b: &Tensor,
        rng: &mut R,
    ) -> (Tensor, SimilarityHeadCache) {
        let (xa, dropout_a) = self.dropout_a.forward(a, rng);
        let (pa, proj_a) = self.proj_a.forward(params, &xa);
        let (xb, dropout_b) = self.dropout_b.forward(b, rng);
        let (pb, proj_b) = self.proj_b.forward(params, &xb);

        let (cos, cosine) = cosine_similarity_forward(&pa, &pb);
        let score = relu_forward(&cos);

        let cache = SimilarityHeadCache {
            dropout_a,
            proj_a,
            dropout_b,
            proj_b,
            cosine,
            cos,
        };
        (score, cache)
    }

    pub fn backward(
        &self,
        params: &mut ParamStore,
        grad_score: &Tensor,
        cache: &SimilarityHeadCache,
    ) -> (Tensor, Tensor) {
        let grad_cos = relu_backward(grad_score, &cache.cos);
        let (grad_pa, grad_pb) = cosine_similarity_backward(&grad_cos, &cache.cosine);

        let grad_a = self.proj_a.backward(params, &grad_pa, &cache.proj_a);
        let grad_a = self.dropout_a.backward(&grad_a, &cache.dropout_a);
        let grad_b = self.proj_b.backward(params, &grad_pb, &cache.proj_b);
        let grad_b = self.dropout_b.backward(&grad_b, &cache.dropout_b);
        (grad_a, grad_b)
    }

    pub fn set_training(&mut self, training: bool) {
        self.dropout_a.training = training;
        self.dropout_b.training = training;
    }

    pub fn parameters(&self) -> Vec<ParamId> {
        let mut ids = self.proj_a.parameters().to_vec();
        ids.extend(self.proj_b.parameters());
        ids
    }
}
