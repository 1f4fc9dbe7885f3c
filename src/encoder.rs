//! Sentence Encoder
//!
//! The shared trunk of the multitask model. An [`Encoder`] turns a padded
//! token batch into one fixed-width embedding per sentence; the task heads
//! only ever see these embeddings.
//!
//! ## EmbeddingBagEncoder
//!
//! ```text
//! ids [B, T] ──► token embedding [B, T, H]
//!            ──► masked mean over T       [B, H]
//!            ──► pooler: linear H → H, tanh
//! ```
//!
//! Padding positions (mask 0) contribute nothing; an all-padding row pools
//! to zeros.
//!
//! The embedding table can emit its gradient either densely (a full
//! `[vocab, H]` tensor) or as row-sparse updates touching only the tokens in
//! the batch. AdamW rejects the sparse form, so it is off by default.

use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::config::ModelConfig;
use crate::data::TokenBatch;
use crate::layers::{tanh_backward, tanh_forward, LinearCache, TrainableLinear};
use crate::params::{Gradient, ParamId, ParamStore};
use crate::tensor::Tensor;

/// Maps token batches to sentence embeddings
pub trait Encoder {
    /// Whatever the backward pass needs from the forward pass
    type Cache;

    /// Width of the produced embeddings
    fn hidden_size(&self) -> usize;

    /// Every parameter owned by the encoder
    fn parameters(&self) -> Vec<ParamId>;

    /// Encode a batch into `[batch_size, hidden_size]` embeddings
    fn encode(&self, params: &ParamStore, tokens: &TokenBatch) -> (Tensor, Self::Cache);

    /// Accumulate parameter gradients given the gradient of the embeddings
    fn backward(&self, params: &mut ParamStore, grad: &Tensor, cache: &Self::Cache);
}

/// Mean-of-embeddings encoder with a tanh pooler
#[derive(Clone, Debug)]
pub struct EmbeddingBagEncoder {
    pub embedding: ParamId,
    pub pooler: TrainableLinear,
    hidden_size: usize,
    sparse_grad: bool,
}

/// Forward state of [`EmbeddingBagEncoder`]
#[derive(Clone, Debug)]
pub struct EmbeddingBagCache {
    tokens: TokenBatch,
    /// Real-token count per row, at least 1
    counts: Vec<f32>,
    pooler: LinearCache,
    output: Tensor,
}

impl EmbeddingBagEncoder {
    /// Register the encoder parameters under `encoder.*`
    ///
    /// Embeddings are drawn from `N(0, 0.02)`; the `[PAD]` row starts at zero.
    pub fn new<R: Rng + ?Sized>(params: &mut ParamStore, config: &ModelConfig, rng: &mut R) -> Self {
        let (vocab, hidden) = (config.vocab_size, config.hidden_size);
        let normal = Normal::new(0.0f32, 0.02).expect("valid normal distribution");
        let mut table: Vec<f32> = (0..vocab * hidden).map(|_| normal.sample(&mut *rng)).collect();
        if vocab > 0 {
            table[..hidden].fill(0.0);
        }

        let embedding = params.register("encoder.embedding", Tensor::new(table, vec![vocab, hidden]));
        let pooler = TrainableLinear::new(params, "encoder.pooler", hidden, hidden, rng);

        Self {
            embedding,
            pooler,
            hidden_size: hidden,
            sparse_grad: config.sparse_embedding_grad,
        }
    }

    fn mean_pool(&self, table: &Tensor, tokens: &TokenBatch) -> (Tensor, Vec<f32>) {
        let h = self.hidden_size;
        let mut pooled = vec![0.0; tokens.batch_size * h];
        let mut counts = Vec::with_capacity(tokens.batch_size);

        for b in 0..tokens.batch_size {
            let (ids, mask) = tokens.row(b);
            let out = &mut pooled[b * h..(b + 1) * h];
            let mut count = 0.0;
            for (&id, &m) in ids.iter().zip(mask) {
                if m == 0.0 {
                    continue;
                }
                count += m;
                for (o, &e) in out.iter_mut().zip(table.row(id)) {
                    *o += m * e;
                }
            }
            let count = count.max(1.0);
            out.iter_mut().for_each(|o| *o /= count);
            counts.push(count);
        }

        (Tensor::new(pooled, vec![tokens.batch_size, h]), counts)
    }
}

impl Encoder for EmbeddingBagEncoder {
    type Cache = EmbeddingBagCache;

    fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    fn parameters(&self) -> Vec<ParamId> {
        let mut ids = vec![self.embedding];
        ids.extend(self.pooler.parameters());
        ids
    }

    fn encode(&self, params: &ParamStore, tokens: &TokenBatch) -> (Tensor, EmbeddingBagCache) {
        let (pooled, counts) = self.mean_pool(params.value(self.embedding), tokens);
        let (z, pooler) = self.pooler.forward(params, &pooled);
        let output = tanh_forward(&z);

        let cache = EmbeddingBagCache {
            tokens: tokens.clone(),
            counts,
            pooler,
            output: output.clone(),
        };
        (output, cache)
    }

    fn backward(&self, params: &mut ParamStore, grad: &Tensor, cache: &EmbeddingBagCache) {
        let grad_z = tanh_backward(grad, &cache.output);
        let grad_pooled = self.pooler.backward(params, &grad_z, &cache.pooler);

        if !params.requires_grad(self.embedding) {
            return;
        }

        let h = self.hidden_size;
        let tokens = &cache.tokens;
        let mut rows = Vec::new();
        let mut values = Vec::new();
        for b in 0..tokens.batch_size {
            let (ids, mask) = tokens.row(b);
            let g = grad_pooled.row(b);
            for (&id, &m) in ids.iter().zip(mask) {
                if m == 0.0 {
                    continue;
                }
                let w = m / cache.counts[b];
                rows.push(id);
                values.extend(g.iter().map(|v| v * w));
            }
        }
        if rows.is_empty() {
            return;
        }

        let n = rows.len();
        let sparse = Gradient::Sparse {
            rows,
            values: Tensor::new(values, vec![n, h]),
        };
        if self.sparse_grad {
            params.accumulate(self.embedding, sparse);
        } else {
            let shape = params.value(self.embedding).shape.clone();
            params.accumulate_grad(self.embedding, sparse.to_dense(&shape));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn encoder(sparse: bool) -> (ParamStore, EmbeddingBagEncoder) {
        let mut config = ModelConfig::tiny(6);
        config.hidden_size = 3;
        config.sparse_embedding_grad = sparse;
        let mut params = ParamStore::new();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let enc = EmbeddingBagEncoder::new(&mut params, &config, &mut rng);
        (params, enc)
    }

    fn batch() -> TokenBatch {
        TokenBatch::from_sequences(&[&[2, 3, 3], &[4]])
    }

    #[test]
    fn test_padding_does_not_change_embedding() {
        let (params, enc) = encoder(false);
        let (short, _) = enc.encode(&params, &TokenBatch::from_sequences(&[&[4]]));
        let (padded, _) = enc.encode(&params, &batch());
        assert_eq!(short.row(0), padded.row(1));
        assert_eq!(params.value(enc.embedding).row(0), &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_backward_matches_finite_differences() {
        let (mut params, enc) = encoder(false);
        let tokens = batch();
        // Loss = sum of embeddings weighted by a fixed upstream gradient
        let upstream = Tensor::new(vec![0.3, -0.2, 0.5, 1.0, 0.1, -0.7], vec![2, 3]);
        let loss = |params: &ParamStore| {
            let (out, _) = enc.encode(params, &tokens);
            out.data.iter().zip(&upstream.data).map(|(a, b)| a * b).sum::<f32>()
        };

        let (_, cache) = enc.encode(&params, &tokens);
        enc.backward(&mut params, &upstream, &cache);
        let analytic = match params.grad(enc.embedding) {
            Some(Gradient::Dense(g)) => g.clone(),
            other => panic!("expected dense gradient, got {:?}", other),
        };

        let h = 1e-2;
        for index in [2 * 3, 3 * 3 + 1, 4 * 3 + 2, 5 * 3] {
            let base = params.value(enc.embedding).data[index];
            params.get_mut(enc.embedding).value.data[index] = base + h;
            let plus = loss(&params);
            params.get_mut(enc.embedding).value.data[index] = base - h;
            let minus = loss(&params);
            params.get_mut(enc.embedding).value.data[index] = base;
            let numeric = (plus - minus) / (2.0 * h);
            assert!(
                (analytic.data[index] - numeric).abs() < 1e-3,
                "index {}: {} vs {}",
                index,
                analytic.data[index],
                numeric
            );
        }
        // Token 5 never appears
        assert_eq!(analytic.row(5), &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_sparse_gradient_touches_batch_rows_only() {
        let (mut params, enc) = encoder(true);
        let tokens = batch();
        let (out, cache) = enc.encode(&params, &tokens);
        enc.backward(&mut params, &out.map(|_| 1.0), &cache);

        match params.grad(enc.embedding) {
            Some(Gradient::Sparse { rows, values }) => {
                assert_eq!(rows, &vec![2, 3, 3, 4]);
                assert_eq!(values.shape, vec![4, 3]);
            }
            other => panic!("expected sparse gradient, got {:?}", other),
        }
        assert!(matches!(params.grad(enc.pooler.weight), Some(Gradient::Dense(_))));
    }

    #[test]
    fn test_frozen_encoder_records_no_gradients() {
        let (mut params, enc) = encoder(false);
        params.set_requires_grad(&enc.parameters(), false);
        let (out, cache) = enc.encode(&params, &batch());
        enc.backward(&mut params, &out, &cache);
        assert!(enc.parameters().iter().all(|&id| params.grad(id).is_none()));
    }
}
