//! Checkpointing
//!
//! A [`Checkpoint`] captures everything needed to resume training or to run
//! inference: parameters, optimizer moments, model configuration, invocation
//! arguments, vocabulary and the positions of all three RNG streams.
//!
//! ## File layout
//!
//! ```text
//! "TRITASK_CKPT"                     12-byte magic
//! version                            u8
//! model config                       JSON section
//! invocation args                    JSON section
//! vocabulary                         JSON section
//! RNG snapshots                      JSON section
//! optimizer config                   JSON section
//! parameter count                    u32
//!   name (u32 len + UTF-8), tensor   per parameter, registration order
//! optimizer state count              u32
//!   param index u32, step u64,
//!   first moment, second moment      per parameter with state
//! ```
//!
//! JSON sections are a `u32` byte length followed by the bytes. A tensor is
//! `ndim: u32`, each dim as `u32`, `len: u32`, then `len` little-endian
//! `f32`s, so values round-trip bit for bit.
//!
//! ## Best-model selection
//!
//! [`CheckpointManager`] keeps a single slot on disk and overwrites it
//! whenever a new score is at least as good as the best seen so far.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use crate::config::{ModelConfig, TrainArgs};
use crate::encoder::Encoder;
use crate::error::{Error, Result};
use crate::model::MultitaskModel;
use crate::optimizer::{AdamW, AdamWConfig, ParamState};
use crate::params::ParamId;
use crate::rng::{RngContext, RngSnapshots};
use crate::tensor::Tensor;
use crate::tokenizer::Vocabulary;

pub const CHECKPOINT_MAGIC: &[u8; 12] = b"TRITASK_CKPT";
pub const CHECKPOINT_VERSION: u8 = 1;

/// Saved optimizer moments of one parameter
#[derive(Clone, Debug, PartialEq)]
pub struct SavedState {
    pub param: usize,
    pub state: ParamState,
}

/// Complete training state
#[derive(Clone, Debug)]
pub struct Checkpoint {
    pub model_config: ModelConfig,
    pub args: TrainArgs,
    pub vocabulary: Vocabulary,
    pub rngs: RngSnapshots,
    pub optimizer_config: AdamWConfig,
    /// Parameter values in registration order
    pub params: Vec<(String, Tensor)>,
    pub optimizer_state: Vec<SavedState>,
}

impl Checkpoint {
    /// Snapshot a model, its optimizer and the run context
    pub fn capture<E: Encoder>(
        model: &MultitaskModel<E>,
        optimizer: &AdamW,
        args: &TrainArgs,
        vocabulary: &Vocabulary,
        rngs: &RngContext,
    ) -> Self {
        Self {
            model_config: model.config.clone(),
            args: args.clone(),
            vocabulary: vocabulary.clone(),
            rngs: rngs.snapshot(),
            optimizer_config: *optimizer.config(),
            params: model
                .params
                .iter()
                .map(|(_, p)| (p.name.clone(), p.value.clone()))
                .collect(),
            optimizer_state: optimizer
                .states()
                .map(|(id, state)| SavedState {
                    param: id.index(),
                    state: state.clone(),
                })
                .collect(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut w = BufWriter::new(File::create(path)?);

        w.write_all(CHECKPOINT_MAGIC)?;
        w.write_all(&[CHECKPOINT_VERSION])?;

        write_json(&mut w, &self.model_config)?;
        write_json(&mut w, &self.args)?;
        write_json(&mut w, &self.vocabulary)?;
        write_json(&mut w, &self.rngs)?;
        write_json(&mut w, &self.optimizer_config)?;

        write_u32(&mut w, self.params.len())?;
        for (name, tensor) in &self.params {
            write_bytes(&mut w, name.as_bytes())?;
            write_tensor(&mut w, tensor)?;
        }

        write_u32(&mut w, self.optimizer_state.len())?;
        for saved in &self.optimizer_state {
            write_u32(&mut w, saved.param)?;
            w.write_all(&saved.state.step.to_le_bytes())?;
            write_tensor(&mut w, &saved.state.exp_avg)?;
            write_tensor(&mut w, &saved.state.exp_avg_sq)?;
        }

        w.flush()?;
        info!(path = %path.display(), params = self.params.len(), "saved checkpoint");
        Ok(())
    }

    /// Read a checkpoint; a missing file is an I/O error
    pub fn load(path: &Path) -> Result<Self> {
        let mut r = BufReader::new(File::open(path)?);

        let mut magic = [0u8; 12];
        r.read_exact(&mut magic)?;
        if &magic != CHECKPOINT_MAGIC {
            return Err(Error::InvalidCheckpoint(format!(
                "{} does not start with {:?}",
                path.display(),
                String::from_utf8_lossy(CHECKPOINT_MAGIC)
            )));
        }
        let mut version = [0u8; 1];
        r.read_exact(&mut version)?;
        if version[0] != CHECKPOINT_VERSION {
            return Err(Error::InvalidCheckpoint(format!(
                "unsupported version {}",
                version[0]
            )));
        }

        let model_config = read_json(&mut r)?;
        let args = read_json(&mut r)?;
        let vocabulary = read_json(&mut r)?;
        let rngs = read_json(&mut r)?;
        let optimizer_config = read_json(&mut r)?;

        let n_params = read_u32(&mut r)?;
        let mut params = Vec::with_capacity(n_params);
        for _ in 0..n_params {
            let name = String::from_utf8(read_bytes(&mut r)?)
                .map_err(|e| Error::InvalidCheckpoint(format!("parameter name: {e}")))?;
            params.push((name, read_tensor(&mut r)?));
        }

        let n_states = read_u32(&mut r)?;
        let mut optimizer_state = Vec::with_capacity(n_states);
        for _ in 0..n_states {
            let param = read_u32(&mut r)?;
            let mut step = [0u8; 8];
            r.read_exact(&mut step)?;
            let exp_avg = read_tensor(&mut r)?;
            let exp_avg_sq = read_tensor(&mut r)?;
            optimizer_state.push(SavedState {
                param,
                state: ParamState {
                    step: u64::from_le_bytes(step),
                    exp_avg,
                    exp_avg_sq,
                },
            });
        }

        info!(path = %path.display(), params = params.len(), "loaded checkpoint");
        Ok(Self {
            model_config,
            args,
            vocabulary,
            rngs,
            optimizer_config,
            params,
            optimizer_state,
        })
    }

    /// Copy saved parameter values into a model with the same layout
    pub fn load_parameters<E: Encoder>(&self, model: &mut MultitaskModel<E>) -> Result<()> {
        if model.params.len() != self.params.len() {
            return Err(Error::InvalidCheckpoint(format!(
                "checkpoint has {} parameters, model has {}",
                self.params.len(),
                model.params.len()
            )));
        }
        for ((_, param), (name, value)) in model.params.iter_mut().zip(&self.params) {
            if &param.name != name || param.value.shape != value.shape {
                return Err(Error::InvalidCheckpoint(format!(
                    "parameter `{}` {:?} does not match saved `{}` {:?}",
                    param.name, param.value.shape, name, value.shape
                )));
            }
            param.value = value.clone();
        }
        Ok(())
    }

    /// Rebuild the model this checkpoint was taken from
    pub fn restore_model(&self) -> Result<MultitaskModel> {
        // Initial values are overwritten right away, so the init stream is irrelevant
        let mut model = MultitaskModel::new(self.model_config.clone(), &mut ChaCha8Rng::seed_from_u64(0));
        self.load_parameters(&mut model)?;
        Ok(model)
    }

    /// Rebuild the optimizer with its moment estimates
    pub fn restore_optimizer(&self) -> Result<AdamW> {
        for saved in &self.optimizer_state {
            let shape = self.params.get(saved.param).map(|(_, t)| &t.shape);
            if shape != Some(&saved.state.exp_avg.shape) || shape != Some(&saved.state.exp_avg_sq.shape) {
                return Err(Error::InvalidCheckpoint(format!(
                    "optimizer state for parameter {} does not match its shape",
                    saved.param
                )));
            }
        }
        AdamW::from_state(
            self.optimizer_config,
            self.optimizer_state
                .iter()
                .map(|saved| (ParamId(saved.param), saved.state.clone())),
        )
    }

    /// Rewind a run's RNG streams to where they were at capture time
    pub fn restore_rngs(&self, rngs: &mut RngContext) {
        rngs.restore(&self.rngs);
    }
}

fn write_u32<W: Write>(w: &mut W, value: usize) -> Result<()> {
    let value = u32::try_from(value)
        .map_err(|_| Error::InvalidCheckpoint(format!("{value} does not fit in u32")))?;
    w.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn write_bytes<W: Write>(w: &mut W, bytes: &[u8]) -> Result<()> {
    write_u32(w, bytes.len())?;
    w.write_all(bytes)?;
    Ok(())
}

fn write_json<W: Write, T: Serialize>(w: &mut W, value: &T) -> Result<()> {
    write_bytes(w, &serde_json::to_vec(value)?)
}

fn write_tensor<W: Write>(w: &mut W, tensor: &Tensor) -> Result<()> {
    write_u32(w, tensor.shape.len())?;
    for &dim in &tensor.shape {
        write_u32(w, dim)?;
    }
    write_u32(w, tensor.data.len())?;
    for &v in &tensor.data {
        w.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

fn read_u32<R: Read>(r: &mut R) -> Result<usize> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf) as usize)
}

/// Read exactly `len` bytes without trusting `len` for the allocation
///
/// A corrupt length prefix then fails as a truncated file instead of a
/// multi-gigabyte allocation.
fn read_payload<R: Read>(r: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    r.by_ref().take(len as u64).read_to_end(&mut bytes)?;
    if bytes.len() != len {
        return Err(Error::InvalidCheckpoint(format!(
            "section declares {len} bytes but only {} remain",
            bytes.len()
        )));
    }
    Ok(bytes)
}

fn read_bytes<R: Read>(r: &mut R) -> Result<Vec<u8>> {
    let len = read_u32(r)?;
    read_payload(r, len)
}

fn read_json<R: Read, T: DeserializeOwned>(r: &mut R) -> Result<T> {
    Ok(serde_json::from_slice(&read_bytes(r)?)?)
}

fn read_tensor<R: Read>(r: &mut R) -> Result<Tensor> {
    let ndim = read_u32(r)?;
    let shape = (0..ndim).map(|_| read_u32(r)).collect::<Result<Vec<_>>>()?;
    let len = read_u32(r)?;
    if Some(len) != shape.iter().try_fold(1usize, |n, &d| n.checked_mul(d)) {
        return Err(Error::InvalidCheckpoint(format!(
            "tensor of shape {shape:?} stored with {len} values"
        )));
    }
    let bytes = len
        .checked_mul(4)
        .ok_or_else(|| Error::InvalidCheckpoint(format!("tensor of {len} values is too large")))?;

    let raw = read_payload(r, bytes)?;
    let data = raw
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Ok(Tensor::new(data, shape))
}

/// Single-slot best-model checkpoint on disk
///
/// The best score starts at negative infinity rather than 0. The dev mean
/// includes a correlation in `[-1, 1]` and can be negative; a run whose
/// first epoch scores below 0 still writes a checkpoint, so prediction
/// always has a model to load.
#[derive(Clone, Debug)]
pub struct CheckpointManager {
    path: PathBuf,
    best: f64,
}

impl CheckpointManager {
    /// Starts with no best score, so the first candidate is always saved
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            best: f64::NEG_INFINITY,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn best_score(&self) -> f64 {
        self.best
    }

    /// Ties count as improvements
    pub fn is_improvement(&self, score: f64) -> bool {
        score >= self.best
    }

    /// Save the checkpoint built by `build` if `score` is at least the best so far
    ///
    /// Returns whether a checkpoint was written.
    pub fn consider(&mut self, score: f64, build: impl FnOnce() -> Checkpoint) -> Result<bool> {
        if !self.is_improvement(score) {
            return Ok(false);
        }
        build().save(&self.path)?;
        self.best = score;
        Ok(true)
    }
}
