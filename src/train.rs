//! Joint Multitask Training
//!
//! Trains the three heads (and, in `finetune` mode, the encoder) together.
//! Each epoch walks the sentiment, paraphrase and similarity training
//! loaders in lock step:
//!
//! ```text
//! for (sst, para, sts) in zip(sst_batches, para_batches, sts_batches):
//!     zero_grad()
//!     loss += sentiment_loss(sst)      # backward
//!     loss += paraphrase_loss(para)    # backward, gradients accumulate
//!     loss += similarity_loss(sts)     # backward, gradients accumulate
//!     optimizer.step()                 # exactly once
//! ```
//!
//! The epoch ends with the shortest loader; leftover batches of the longer
//! ones are not visited. Training loaders are reshuffled every epoch from
//! the `general` RNG stream; dropout masks come from the `tensor` stream.
//!
//! After every epoch the model is scored on the train and dev splits, the
//! mean of the three dev scores decides whether the single best checkpoint
//! is overwritten, and the epoch is logged.

use std::path::Path;

use rand::Rng;
use tracing::{debug, info};

use crate::checkpoint::{Checkpoint, CheckpointManager};
use crate::config::{ModelConfig, TrainArgs};
use crate::data::{
    load_paraphrase, load_sentiment, load_similarity, tokenize_pairs, tokenize_sentiment, DataLoader,
    PairBatch, PairExample, PairRecord, SentimentBatch, SentimentExample, SentimentRecord,
};
use crate::encoder::Encoder;
use crate::error::Result;
use crate::evaluation::{evaluate_multitask, TaskScores};
use crate::model::{MultitaskModel, TaskBatch};
use crate::optimizer::{AdamW, AdamWConfig};
use crate::rng::RngContext;
use crate::tokenizer::Vocabulary;
use crate::training_logger::{EpochMetrics, TrainingLogger};

/// Loaders of one split for all three tasks
#[derive(Clone, Debug)]
pub struct TaskLoaders {
    pub sentiment: DataLoader<SentimentRecord>,
    pub paraphrase: DataLoader<PairRecord>,
    pub similarity: DataLoader<PairRecord>,
}

impl TaskLoaders {
    /// Number of joint steps in one epoch
    pub fn joint_steps(&self) -> usize {
        self.sentiment
            .num_batches()
            .min(self.paraphrase.num_batches())
            .min(self.similarity.num_batches())
    }

    /// Score a model on these loaders (eval mode)
    pub fn evaluate<E: Encoder, R: Rng + ?Sized>(&self, model: &mut MultitaskModel<E>, rng: &mut R) -> TaskScores {
        evaluate_multitask(model, &self.sentiment, &self.paraphrase, &self.similarity, rng).0
    }
}

/// Tokenized training and dev data plus the vocabulary built from it
#[derive(Clone, Debug)]
pub struct TrainingData {
    pub vocabulary: Vocabulary,
    pub train: TaskLoaders,
    pub dev: TaskLoaders,
}

/// Load, tokenize and batch the training and dev splits
///
/// The vocabulary is built from every sentence of the three training splits.
pub fn prepare_training_data(args: &TrainArgs) -> Result<TrainingData> {
    let sst_train = load_sentiment(&args.sst_train, true)?;
    let para_train = load_paraphrase(&args.para_train, true)?;
    let sts_train = load_similarity(&args.sts_train, true)?;
    let sst_dev = load_sentiment(&args.sst_dev, true)?;
    let para_dev = load_paraphrase(&args.para_dev, true)?;
    let sts_dev = load_similarity(&args.sts_dev, true)?;

    let corpus: Vec<&str> = sst_train
        .iter()
        .map(|e| e.sentence.as_str())
        .chain(
            para_train
                .iter()
                .chain(&sts_train)
                .flat_map(|e| [e.sentence1.as_str(), e.sentence2.as_str()]),
        )
        .collect();
    let vocabulary = Vocabulary::build(&corpus, args.max_vocab);
    info!(
        vocab_size = vocabulary.len(),
        sentences = corpus.len(),
        "built vocabulary"
    );

    let train = task_loaders(&vocabulary, args, true, &sst_train, &para_train, &sts_train);
    let dev = task_loaders(&vocabulary, args, false, &sst_dev, &para_dev, &sts_dev);

    info!(
        sst = train.sentiment.num_examples(),
        para = train.paraphrase.num_examples(),
        sts = train.similarity.num_examples(),
        joint_steps = train.joint_steps(),
        "training splits ready"
    );

    Ok(TrainingData {
        vocabulary,
        train,
        dev,
    })
}

fn task_loaders(
    vocabulary: &Vocabulary,
    args: &TrainArgs,
    shuffle: bool,
    sentiment: &[SentimentExample],
    paraphrase: &[PairExample],
    similarity: &[PairExample],
) -> TaskLoaders {
    let (len, bs) = (args.max_seq_len, args.batch_size);
    TaskLoaders {
        sentiment: DataLoader::new(tokenize_sentiment(sentiment, vocabulary, len), bs, shuffle),
        paraphrase: DataLoader::new(tokenize_pairs(paraphrase, vocabulary, len), bs, shuffle),
        similarity: DataLoader::new(tokenize_pairs(similarity, vocabulary, len), bs, shuffle),
    }
}

/// Model plus optimizer, driven one joint step at a time
pub struct TrainingScheduler<E: Encoder> {
    pub model: MultitaskModel<E>,
    pub optimizer: AdamW,
    /// Loss normalizer: the configured batch size, also for short batches
    batch_size: usize,
}

impl<E: Encoder> TrainingScheduler<E> {
    pub fn new(model: MultitaskModel<E>, optimizer: AdamW, batch_size: usize) -> Self {
        Self {
            model,
            optimizer,
            batch_size,
        }
    }

    /// Run the three task passes, summing gradients without stepping
    ///
    /// Returns the sum of the three task losses.
    pub fn accumulate_gradients<R: Rng + ?Sized>(
        &mut self,
        sentiment: &SentimentBatch,
        paraphrase: &PairBatch,
        similarity: &PairBatch,
        rng: &mut R,
    ) -> Result<f32> {
        let normalizer = self.batch_size as f32;
        let mut total = 0.0;
        for batch in [
            TaskBatch::Sentiment(sentiment),
            TaskBatch::Paraphrase(paraphrase),
            TaskBatch::Similarity(similarity),
        ] {
            let loss = self.model.train_step(batch, normalizer, rng)?;
            debug!(task = batch.kind().name(), loss, "task pass");
            total += loss;
        }
        Ok(total)
    }

    /// One joint step: reset gradients, three task passes, one update
    pub fn joint_step<R: Rng + ?Sized>(
        &mut self,
        sentiment: &SentimentBatch,
        paraphrase: &PairBatch,
        similarity: &PairBatch,
        rng: &mut R,
    ) -> Result<f32> {
        self.model.params.zero_grad();
        let loss = self.accumulate_gradients(sentiment, paraphrase, similarity, rng)?;
        self.optimizer.step(&mut self.model.params)?;
        Ok(loss)
    }

    /// Train for one epoch and return the mean per-task loss
    pub fn train_epoch(&mut self, loaders: &TaskLoaders, rngs: &mut RngContext) -> Result<f32> {
        self.model.set_training(true);

        let sentiment = loaders.sentiment.epoch(&mut rngs.general);
        let paraphrase = loaders.paraphrase.epoch(&mut rngs.general);
        let similarity = loaders.similarity.epoch(&mut rngs.general);

        let mut total = 0.0;
        let mut steps = 0usize;
        for ((sst, para), sts) in sentiment.zip(paraphrase).zip(similarity) {
            total += self.joint_step(&sst, &para, &sts, &mut rngs.tensor)?;
            steps += 1;
        }

        if steps == 0 {
            return Ok(0.0);
        }
        // Three loss terms per joint step
        Ok(total / (3 * steps) as f32)
    }
}

/// Full training run: data, model, epochs, best-checkpoint selection
///
/// Returns the metrics of every epoch. The best checkpoint is written to
/// [`TrainArgs::checkpoint_path`].
pub fn train_multitask(args: &TrainArgs, rngs: &mut RngContext) -> Result<Vec<EpochMetrics>> {
    args.validate()?;
    let data = prepare_training_data(args)?;

    let config = ModelConfig::new(data.vocabulary.len(), args);
    let model = MultitaskModel::new(config, &mut rngs.numeric);
    info!(
        parameters = model.params.num_values(),
        trainable = model.params.num_trainable_values(),
        option = args.option.as_str(),
        "model initialized"
    );

    let optimizer = AdamW::new(AdamWConfig::new(args.lr).with_weight_decay(args.weight_decay))?;
    let mut scheduler = TrainingScheduler::new(model, optimizer, args.batch_size);

    let checkpoint_path = args.checkpoint_path();
    run_epochs(&mut scheduler, &data, args, &checkpoint_path, rngs)
}

fn run_epochs<E: Encoder>(
    scheduler: &mut TrainingScheduler<E>,
    data: &TrainingData,
    args: &TrainArgs,
    checkpoint_path: &Path,
    rngs: &mut RngContext,
) -> Result<Vec<EpochMetrics>> {
    let mut manager = CheckpointManager::new(checkpoint_path);
    let mut logger = match &args.metrics_log {
        Some(path) => TrainingLogger::to_file(path, args.lr)?,
        None => TrainingLogger::new(args.lr),
    };

    let mut history = Vec::with_capacity(args.epochs);
    for epoch in 0..args.epochs {
        let train_loss = scheduler.train_epoch(&data.train, rngs)?;

        let train = data.train.evaluate(&mut scheduler.model, &mut rngs.tensor);
        let dev = data.dev.evaluate(&mut scheduler.model, &mut rngs.tensor);

        let checkpoint_saved = manager.consider(dev.mean(), || {
            Checkpoint::capture(&scheduler.model, &scheduler.optimizer, args, &data.vocabulary, &*rngs)
        })?;

        let metrics = EpochMetrics {
            epoch,
            train_loss,
            train,
            dev,
            checkpoint_saved,
        };
        logger.log(&metrics)?;
        history.push(metrics);
    }

    info!(
        best_dev_mean = manager.best_score(),
        path = %manager.path().display(),
        "training finished"
    );
    Ok(history)
}
