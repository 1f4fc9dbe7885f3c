//! Word-Level Tokenizer
//!
//! Maps sentences to integer token ids for the encoder. The vocabulary is
//! built once from the training splits and stored in every checkpoint, so a
//! model always decodes with the vocabulary it was trained with.
//!
//! ## Pre-tokenization
//!
//! Text is lower-cased and split on whitespace. Every character that is
//! neither alphanumeric nor whitespace becomes a token of its own:
//!
//! ```text
//! "It's great!"  ->  ["it", "'", "s", "great", "!"]
//! ```
//!
//! ## Vocabulary order
//!
//! ```text
//! 0      [PAD]
//! 1      [UNK]
//! 2..    words by descending frequency, ties broken alphabetically
//! ```
//!
//! Words that did not make the cut map to `[UNK]`.
//!
//! ## Example
//!
//! ```rust
//! use tritask::tokenizer::{Vocabulary, UNK_ID};
//!
//! let vocab = Vocabulary::build(&["the cat", "the dog"], 100);
//! assert_eq!(vocab.encode("the cat", 16), vec![2, 3]);
//! assert_eq!(vocab.encode("a bird", 16), vec![UNK_ID, UNK_ID]);
//! ```

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const PAD_TOKEN: &str = "[PAD]";
pub const UNK_TOKEN: &str = "[UNK]";
pub const PAD_ID: usize = 0;
pub const UNK_ID: usize = 1;

/// Split text into lower-cased word and punctuation pieces
pub fn pretokenize(text: &str) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();

    for c in text.chars() {
        if c.is_whitespace() {
            if !current.is_empty() {
                pieces.push(std::mem::take(&mut current));
            }
        } else if c.is_alphanumeric() {
            current.extend(c.to_lowercase());
        } else {
            if !current.is_empty() {
                pieces.push(std::mem::take(&mut current));
            }
            pieces.push(c.to_lowercase().collect());
        }
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

/// Fixed word vocabulary
///
/// Serialized as the plain list of tokens in id order; the lookup table is
/// rebuilt on deserialization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct Vocabulary {
    tokens: Vec<String>,
    index: HashMap<String, usize>,
}

impl From<Vec<String>> for Vocabulary {
    fn from(tokens: Vec<String>) -> Self {
        let index = tokens
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i))
            .collect();
        Self { tokens, index }
    }
}

impl From<Vocabulary> for Vec<String> {
    fn from(vocab: Vocabulary) -> Self {
        vocab.tokens
    }
}

impl Vocabulary {
    /// Build a vocabulary of at most `max_size` entries from a corpus
    ///
    /// `max_size` includes the two special tokens. Word counts are gathered
    /// in parallel across sentences.
    pub fn build<S: AsRef<str> + Sync>(texts: &[S], max_size: usize) -> Self {
        let counts = texts
            .par_iter()
            .fold(HashMap::new, |mut counts: HashMap<String, usize>, text| {
                for piece in pretokenize(text.as_ref()) {
                    *counts.entry(piece).or_insert(0) += 1;
                }
                counts
            })
            .reduce(HashMap::new, |mut a, b| {
                for (word, n) in b {
                    *a.entry(word).or_insert(0) += n;
                }
                a
            });

        let mut words: Vec<(String, usize)> = counts
            .into_iter()
            .filter(|(w, _)| w != PAD_TOKEN && w != UNK_TOKEN)
            .collect();
        words.sort_by(|(wa, ca), (wb, cb)| cb.cmp(ca).then_with(|| wa.cmp(wb)));

        let mut tokens = vec![PAD_TOKEN.to_string(), UNK_TOKEN.to_string()];
        let room = max_size.saturating_sub(tokens.len());
        tokens.extend(words.into_iter().take(room).map(|(w, _)| w));
        Self::from(tokens)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Id of a token, `None` if out of vocabulary
    pub fn id(&self, token: &str) -> Option<usize> {
        self.index.get(token).copied()
    }

    pub fn token(&self, id: usize) -> Option<&str> {
        self.tokens.get(id).map(String::as_str)
    }

    /// Encode text to at most `max_len` ids
    pub fn encode(&self, text: &str, max_len: usize) -> Vec<usize> {
        pretokenize(text)
            .iter()
            .take(max_len)
            .map(|piece| self.id(piece).unwrap_or(UNK_ID))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pretokenize_splits_punctuation() {
        assert_eq!(
            pretokenize("  It's GREAT!\tReally "),
            vec!["it", "'", "s", "great", "!", "really"]
        );
        assert!(pretokenize("   ").is_empty());
    }

    #[test]
    fn test_frequency_then_alphabetical_order() {
        let vocab = Vocabulary::build(&["b a c", "c b", "c"], 100);
        assert_eq!(vocab.token(PAD_ID), Some(PAD_TOKEN));
        assert_eq!(vocab.token(UNK_ID), Some(UNK_TOKEN));
        assert_eq!(vocab.token(2), Some("c"));
        assert_eq!(vocab.token(3), Some("b"));
        assert_eq!(vocab.token(4), Some("a"));

        let tied = Vocabulary::build(&["zeta alpha mid"], 100);
        assert_eq!(tied.token(2), Some("alpha"));
        assert_eq!(tied.token(3), Some("mid"));
        assert_eq!(tied.token(4), Some("zeta"));
    }

    #[test]
    fn test_cap_includes_special_tokens() {
        let vocab = Vocabulary::build(&["a a a b b c"], 3);
        assert_eq!(vocab.len(), 3);
        assert_eq!(vocab.id("a"), Some(2));
        assert_eq!(vocab.encode("b c", 8), vec![UNK_ID, UNK_ID]);
    }

    #[test]
    fn test_encode_truncates() {
        let vocab = Vocabulary::build(&["one two three four"], 100);
        assert_eq!(vocab.encode("one two three four", 2).len(), 2);
        assert!(vocab.encode("", 2).is_empty());
    }

    #[test]
    fn test_serde_rebuilds_lookup() {
        let vocab = Vocabulary::build(&["hello world hello"], 10);
        let json = serde_json::to_string(&vocab).unwrap();
        assert_eq!(json, r#"["[PAD]","[UNK]","hello","world"]"#);
        let back: Vocabulary = serde_json::from_str(&json).unwrap();
        assert_eq!(back, vocab);
        assert_eq!(back.id("world"), Some(3));
    }
}
