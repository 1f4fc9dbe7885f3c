//! Datasets and Batching
//!
//! Loads the three task corpora from tab-separated files, tokenizes them and
//! serves padded batches.
//!
//! ## File formats
//!
//! ```text
//! sentiment   id  sentence               sentiment       label in 0..=4
//! paraphrase  id  sentence1  sentence2   is_duplicate    label 0 or 1
//! similarity  id  sentence1  sentence2   similarity      label in [0, 5]
//! ```
//!
//! The first row is the header; columns are found by name and any extra
//! columns are ignored. Unlabelled (test) files simply omit the label
//! column. Text is lower-cased and trimmed.
//!
//! Malformed paraphrase rows, including labels other than 0 or 1, are
//! skipped with a warning (the corpus is known to contain a few). A
//! malformed row in the other two corpora aborts loading.
//!
//! ## Batching
//!
//! A [`DataLoader`] owns tokenized examples and yields one epoch of batches
//! at a time. Training loaders reshuffle the example order at the start of
//! every epoch using the caller's RNG; evaluation loaders keep file order.

use std::fs::File;
use std::path::Path;

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::tokenizer::{Vocabulary, PAD_ID};

/// Highest sentiment class
const MAX_SENTIMENT: usize = 4;
/// Highest similarity score
const MAX_SIMILARITY: f32 = 5.0;

/// One single-sentence example
#[derive(Clone, Debug, PartialEq)]
pub struct SentimentExample {
    pub id: String,
    pub sentence: String,
    pub label: Option<usize>,
}

/// One sentence-pair example (paraphrase or similarity)
#[derive(Clone, Debug, PartialEq)]
pub struct PairExample {
    pub id: String,
    pub sentence1: String,
    pub sentence2: String,
    pub label: Option<f32>,
}

/// Header of a tab-separated file, for column lookup and error reporting
struct TsvFile {
    path: std::path::PathBuf,
    columns: Vec<String>,
}

impl TsvFile {
    fn open(path: &Path) -> Result<(Self, csv::Reader<File>)> {
        // Opened directly so a missing file is reported as a plain I/O error
        let file = File::open(path)?;
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .flexible(true)
            .from_reader(file);
        let columns = reader
            .headers()?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        let tsv = Self {
            path: path.to_path_buf(),
            columns,
        };
        Ok((tsv, reader))
    }

    fn column(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| self.invalid(0, format!("missing column `{name}`")))
    }

    fn invalid(&self, row: usize, message: String) -> Error {
        Error::InvalidRecord {
            path: self.path.clone(),
            row,
            message,
        }
    }
}

fn field<'r>(record: &'r csv::StringRecord, index: usize, name: &str) -> std::result::Result<&'r str, String> {
    record
        .get(index)
        .map(str::trim)
        .ok_or_else(|| format!("missing field `{name}`"))
}

fn clean_text(text: &str) -> String {
    text.trim().to_lowercase()
}

/// Load a sentiment corpus; `labelled` requires the `sentiment` column
pub fn load_sentiment(path: &Path, labelled: bool) -> Result<Vec<SentimentExample>> {
    let (tsv, mut reader) = TsvFile::open(path)?;
    let id_col = tsv.column("id")?;
    let sentence_col = tsv.column("sentence")?;
    let label_col = if labelled {
        Some(tsv.column("sentiment")?)
    } else {
        None
    };

    let mut examples = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let row = i + 1;
        let record = record?;
        let parse = || -> std::result::Result<SentimentExample, String> {
            let label = match label_col {
                Some(col) => {
                    let raw = field(&record, col, "sentiment")?;
                    let label: usize = raw
                        .parse()
                        .map_err(|_| format!("sentiment `{raw}` is not a class index"))?;
                    if label > MAX_SENTIMENT {
                        return Err(format!("sentiment {label} is outside 0..={MAX_SENTIMENT}"));
                    }
                    Some(label)
                }
                None => None,
            };
            Ok(SentimentExample {
                id: field(&record, id_col, "id")?.to_string(),
                sentence: clean_text(field(&record, sentence_col, "sentence")?),
                label,
            })
        };
        examples.push(parse().map_err(|message| tsv.invalid(row, message))?);
    }

    debug!(path = %path.display(), examples = examples.len(), "loaded sentiment split");
    Ok(examples)
}

fn parse_pair(
    record: &csv::StringRecord,
    cols: [usize; 3],
    label_col: Option<(usize, &str)>,
) -> std::result::Result<PairExample, String> {
    let label = match label_col {
        Some((col, name)) => {
            let raw = field(record, col, name)?;
            let label: f32 = raw
                .parse()
                .map_err(|_| format!("{name} `{raw}` is not a number"))?;
            Some(label)
        }
        None => None,
    };
    Ok(PairExample {
        id: field(record, cols[0], "id")?.to_string(),
        sentence1: clean_text(field(record, cols[1], "sentence1")?),
        sentence2: clean_text(field(record, cols[2], "sentence2")?),
        label,
    })
}

fn pair_columns(tsv: &TsvFile) -> Result<[usize; 3]> {
    Ok([
        tsv.column("id")?,
        tsv.column("sentence1")?,
        tsv.column("sentence2")?,
    ])
}

/// Load a paraphrase corpus, skipping rows that fail to parse
pub fn load_paraphrase(path: &Path, labelled: bool) -> Result<Vec<PairExample>> {
    let (tsv, mut reader) = TsvFile::open(path)?;
    let cols = pair_columns(&tsv)?;
    let label_col = if labelled {
        Some((tsv.column("is_duplicate")?, "is_duplicate"))
    } else {
        None
    };

    let mut examples = Vec::new();
    let mut skipped = 0usize;
    for (i, record) in reader.records().enumerate() {
        let row = i + 1;
        let parsed = record
            .map_err(|e| e.to_string())
            .and_then(|record| parse_pair(&record, cols, label_col))
            .and_then(|example| match example.label {
                Some(label) if label != 0.0 && label != 1.0 => {
                    Err(format!("is_duplicate {label} is neither 0 nor 1"))
                }
                _ => Ok(example),
            });
        match parsed {
            Ok(example) => examples.push(example),
            Err(message) => {
                skipped += 1;
                warn!(path = %path.display(), row, %message, "skipping paraphrase row");
            }
        }
    }

    debug!(path = %path.display(), examples = examples.len(), skipped, "loaded paraphrase split");
    Ok(examples)
}

/// Load a similarity corpus; labels must lie in `[0, 5]`
pub fn load_similarity(path: &Path, labelled: bool) -> Result<Vec<PairExample>> {
    let (tsv, mut reader) = TsvFile::open(path)?;
    let cols = pair_columns(&tsv)?;
    let label_col = if labelled {
        Some((tsv.column("similarity")?, "similarity"))
    } else {
        None
    };

    let mut examples = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let row = i + 1;
        let record = record?;
        let example = parse_pair(&record, cols, label_col)
            .and_then(|example| match example.label {
                Some(score) if !(0.0..=MAX_SIMILARITY).contains(&score) => Err(format!(
                    "similarity {score} is outside [0, {MAX_SIMILARITY}]"
                )),
                _ => Ok(example),
            })
            .map_err(|message| tsv.invalid(row, message))?;
        examples.push(example);
    }

    debug!(path = %path.display(), examples = examples.len(), "loaded similarity split");
    Ok(examples)
}

/// Padded token ids of a batch of sequences
///
/// Stored row-major as `[batch_size, seq_len]`. Rows are right-padded with
/// [`PAD_ID`] to the longest row; `mask` is 1.0 on real tokens.
#[derive(Clone, Debug, PartialEq)]
pub struct TokenBatch {
    pub ids: Vec<usize>,
    pub mask: Vec<f32>,
    pub batch_size: usize,
    pub seq_len: usize,
}

impl TokenBatch {
    pub fn from_sequences(sequences: &[&[usize]]) -> Self {
        let batch_size = sequences.len();
        let seq_len = sequences.iter().map(|s| s.len()).max().unwrap_or(0).max(1);

        let mut ids = vec![PAD_ID; batch_size * seq_len];
        let mut mask = vec![0.0; batch_size * seq_len];
        for (b, seq) in sequences.iter().enumerate() {
            let offset = b * seq_len;
            ids[offset..offset + seq.len()].copy_from_slice(seq);
            mask[offset..offset + seq.len()].fill(1.0);
        }

        Self {
            ids,
            mask,
            batch_size,
            seq_len,
        }
    }

    /// Token ids and mask of row `b`
    pub fn row(&self, b: usize) -> (&[usize], &[f32]) {
        let range = b * self.seq_len..(b + 1) * self.seq_len;
        (&self.ids[range.clone()], &self.mask[range])
    }
}

/// Tokenized sentiment example
#[derive(Clone, Debug)]
pub struct SentimentRecord {
    pub id: String,
    pub tokens: Vec<usize>,
    pub label: Option<usize>,
}

/// Tokenized sentence-pair example
#[derive(Clone, Debug)]
pub struct PairRecord {
    pub id: String,
    pub tokens1: Vec<usize>,
    pub tokens2: Vec<usize>,
    pub label: Option<f32>,
}

pub fn tokenize_sentiment(
    examples: &[SentimentExample],
    vocab: &Vocabulary,
    max_seq_len: usize,
) -> Vec<SentimentRecord> {
    examples
        .iter()
        .map(|e| SentimentRecord {
            id: e.id.clone(),
            tokens: vocab.encode(&e.sentence, max_seq_len),
            label: e.label,
        })
        .collect()
}

pub fn tokenize_pairs(examples: &[PairExample], vocab: &Vocabulary, max_seq_len: usize) -> Vec<PairRecord> {
    examples
        .iter()
        .map(|e| PairRecord {
            id: e.id.clone(),
            tokens1: vocab.encode(&e.sentence1, max_seq_len),
            tokens2: vocab.encode(&e.sentence2, max_seq_len),
            label: e.label,
        })
        .collect()
}

/// Batch of sentiment examples
#[derive(Clone, Debug)]
pub struct SentimentBatch {
    pub ids: Vec<String>,
    pub tokens: TokenBatch,
    /// `None` unless every example in the batch is labelled
    pub labels: Option<Vec<usize>>,
}

/// Batch of sentence pairs
#[derive(Clone, Debug)]
pub struct PairBatch {
    pub ids: Vec<String>,
    pub tokens1: TokenBatch,
    pub tokens2: TokenBatch,
    pub labels: Option<Vec<f32>>,
}

/// Examples that can be collated into a batch
pub trait Collate: Sized {
    type Batch;

    fn collate(examples: &[&Self]) -> Self::Batch;
}

impl Collate for SentimentRecord {
    type Batch = SentimentBatch;

    fn collate(examples: &[&Self]) -> SentimentBatch {
        let sequences: Vec<&[usize]> = examples.iter().map(|e| e.tokens.as_slice()).collect();
        SentimentBatch {
            ids: examples.iter().map(|e| e.id.clone()).collect(),
            tokens: TokenBatch::from_sequences(&sequences),
            labels: examples.iter().map(|e| e.label).collect(),
        }
    }
}

impl Collate for PairRecord {
    type Batch = PairBatch;

    fn collate(examples: &[&Self]) -> PairBatch {
        let first: Vec<&[usize]> = examples.iter().map(|e| e.tokens1.as_slice()).collect();
        let second: Vec<&[usize]> = examples.iter().map(|e| e.tokens2.as_slice()).collect();
        PairBatch {
            ids: examples.iter().map(|e| e.id.clone()).collect(),
            tokens1: TokenBatch::from_sequences(&first),
            tokens2: TokenBatch::from_sequences(&second),
            labels: examples.iter().map(|e| e.label).collect(),
        }
    }
}

/// Batch source over one split
#[derive(Clone, Debug)]
pub struct DataLoader<T> {
    examples: Vec<T>,
    batch_size: usize,
    shuffle: bool,
}

impl<T: Collate> DataLoader<T> {
    /// # Panics
    ///
    /// Panics if `batch_size` is zero.
    pub fn new(examples: Vec<T>, batch_size: usize, shuffle: bool) -> Self {
        assert!(batch_size > 0, "batch size must be positive");
        Self {
            examples,
            batch_size,
            shuffle,
        }
    }

    /// Number of batches per epoch (the last one may be short)
    pub fn num_batches(&self) -> usize {
        self.examples.len().div_ceil(self.batch_size)
    }

    pub fn num_examples(&self) -> usize {
        self.examples.len()
    }

    /// Batches of one epoch
    ///
    /// Draws a fresh permutation from `rng` if the loader shuffles; otherwise
    /// `rng` is left untouched.
    pub fn epoch<R: Rng + ?Sized>(&self, rng: &mut R) -> Epoch<'_, T> {
        let mut order: Vec<usize> = (0..self.examples.len()).collect();
        if self.shuffle {
            order.shuffle(rng);
        }
        Epoch {
            loader: self,
            order,
            position: 0,
        }
    }

    /// Batches in file order
    pub fn sequential(&self) -> Epoch<'_, T> {
        Epoch {
            loader: self,
            order: (0..self.examples.len()).collect(),
            position: 0,
        }
    }
}

/// Iterator over the batches of one epoch
pub struct Epoch<'a, T> {
    loader: &'a DataLoader<T>,
    order: Vec<usize>,
    position: usize,
}

impl<T: Collate> Iterator for Epoch<'_, T> {
    type Item = T::Batch;

    fn next(&mut self) -> Option<T::Batch> {
        if self.position >= self.order.len() {
            return None;
        }
        let end = (self.position + self.loader.batch_size).min(self.order.len());
        let members: Vec<&T> = self.order[self.position..end]
            .iter()
            .map(|&i| &self.loader.examples[i])
            .collect();
        self.position = end;
        Some(T::collate(&members))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.order.len() - self.position).div_ceil(self.loader.batch_size);
        (left, Some(left))
    }
}

impl<T: Collate> ExactSizeIterator for Epoch<'_, T> {}
