//! Turns a batch of conversational examples into left-padded token ids and
//! the response-region mask scored by the loss.
//!
//! Rows are left-padded so the final column always holds a real token. The
//! mask marks every position at or after the last occurrence of the response
//! delimiter and is shifted left by one column to line up with next-token
//! log-probabilities (which have `seq_len - 1` columns).

use crate::checkpoint::Persist;
use crate::data::{Example, Message};
use crate::{Result, RlftError};
use std::path::Path;

/// Renders a conversation into the single text string the model sees.
pub trait ChatFormatter {
    fn format(&self, messages: &[Message]) -> Result<String>;
}

/// Text to token ids. Also persisted next to the trained weights.
pub trait Tokenizer: Persist {
    /// Encode without adding special tokens.
    fn encode(&self, text: &str) -> Result<Vec<i64>>;

    /// Padding id, if the tokenizer defines one.
    fn pad_id(&self) -> Option<i64> {
        None
    }
}

/// Rectangular `(batch, seq_len)` token-id matrix, row-major.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenBatch {
    ids: Vec<i64>,
    batch: usize,
    seq_len: usize,
}

impl TokenBatch {
    /// Left-pad variable-length rows to the longest one.
    pub fn left_padded(rows: &[Vec<i64>], pad_id: i64) -> Self {
        let seq_len = rows.iter().map(Vec::len).max().unwrap_or(0);
        let mut ids = Vec::with_capacity(rows.len() * seq_len);
        for row in rows {
            ids.extend(std::iter::repeat(pad_id).take(seq_len - row.len()));
            ids.extend_from_slice(row);
        }
        Self {
            ids,
            batch: rows.len(),
            seq_len,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn row(&self, i: usize) -> &[i64] {
        &self.ids[i * self.seq_len..(i + 1) * self.seq_len]
    }

    pub fn as_slice(&self) -> &[i64] {
        &self.ids
    }

    #[cfg(feature = "torch")]
    pub fn to_tensor(&self, device: tch::Device) -> tch::Tensor {
        tch::Tensor::from_slice(&self.ids)
            .view([self.batch as i64, self.seq_len as i64])
            .to_device(device)
    }
}

/// Boolean `(batch, seq_len - 1)` matrix marking scored next-token positions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponseMask {
    values: Vec<bool>,
    batch: usize,
    width: usize,
}

impl ResponseMask {
    /// Build from explicit rows. All rows must have the same width.
    pub fn from_rows(rows: &[Vec<bool>]) -> Result<Self> {
        let width = rows.first().map(Vec::len).unwrap_or(0);
        if let Some(i) = rows.iter().position(|r| r.len() != width) {
            return Err(RlftError::row(
                i,
                format!("mask row has {} columns, expected {}", rows[i].len(), width),
            ));
        }
        Ok(Self {
            values: rows.concat(),
            batch: rows.len(),
            width,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn row(&self, i: usize) -> &[bool] {
        &self.values[i * self.width..(i + 1) * self.width]
    }

    /// Number of scored tokens per row.
    pub fn counts(&self) -> Vec<usize> {
        (0..self.batch)
            .map(|i| self.row(i).iter().filter(|&&m| m).count())
            .collect()
    }

    /// Fails on the first row with no scored token.
    pub fn ensure_non_empty(&self) -> Result<()> {
        match self.counts().iter().position(|&c| c == 0) {
            Some(i) => Err(RlftError::row(i, "response region is empty")),
            None => Ok(()),
        }
    }

    #[cfg(feature = "torch")]
    pub fn to_tensor(&self, device: tch::Device) -> tch::Tensor {
        tch::Tensor::from_slice(&self.values)
            .view([self.batch as i64, self.width as i64])
            .to_device(device)
    }
}

/// Output of [`SequencePreparer::prepare`].
#[derive(Clone, Debug)]
pub struct PreparedBatch {
    pub tokens: TokenBatch,
    pub mask: ResponseMask,
    pub advantages: Vec<f64>,
}

/// Formats, truncates, tokenizes and masks a batch.
#[derive(Clone, Debug)]
pub struct SequencePreparer {
    delimiter_ids: Vec<i64>,
    max_length: usize,
    pad_id: i64,
}

impl SequencePreparer {
    pub fn new(delimiter_ids: Vec<i64>, max_length: usize, pad_id: i64) -> Result<Self> {
        if delimiter_ids.is_empty() {
            return Err(RlftError::Configuration(
                "response delimiter encodes to zero tokens".into(),
            ));
        }
        Ok(Self {
            delimiter_ids,
            max_length,
            pad_id,
        })
    }

    /// Encode `delimiter` once with `tokenizer`; the tokenizer's padding id
    /// wins over `fallback_pad_id`.
    pub fn from_tokenizer(
        tokenizer: &dyn Tokenizer,
        delimiter: &str,
        max_length: usize,
        fallback_pad_id: i64,
    ) -> Result<Self> {
        let delimiter_ids = tokenizer.encode(delimiter)?;
        let pad_id = tokenizer.pad_id().unwrap_or(fallback_pad_id);
        Self::new(delimiter_ids, max_length, pad_id)
    }

    pub fn delimiter_ids(&self) -> &[i64] {
        &self.delimiter_ids
    }

    pub fn pad_id(&self) -> i64 {
        self.pad_id
    }

    pub fn prepare(
        &self,
        batch: &[Example],
        formatter: &dyn ChatFormatter,
        tokenizer: &dyn Tokenizer,
    ) -> Result<PreparedBatch> {
        if batch.is_empty() {
            return Err(RlftError::DataContract {
                row: None,
                reason: "batch is empty".into(),
            });
        }

        let mut rows = Vec::with_capacity(batch.len());
        let mut starts = Vec::with_capacity(batch.len());
        for (i, example) in batch.iter().enumerate() {
            let text = formatter.format(&example.completion)?;
            let text = truncate_chars(&text, self.max_length);
            let ids = tokenizer.encode(text)?;
            let start = find_last(&ids, &self.delimiter_ids).ok_or_else(|| {
                RlftError::row(i, "response delimiter not found in formatted example")
            })?;
            starts.push(start);
            rows.push(ids);
        }

        let tokens = TokenBatch::left_padded(&rows, self.pad_id);
        let seq_len = tokens.seq_len();
        let width = seq_len.saturating_sub(1);

        let mut values = Vec::with_capacity(rows.len() * width);
        for (row, start) in rows.iter().zip(&starts) {
            // Position of the delimiter once the row is left-padded.
            let first = seq_len - row.len() + start;
            // Column j scores token j + 1.
            values.extend((0..width).map(|j| j + 1 >= first));
        }
        let mask = ResponseMask {
            values,
            batch: rows.len(),
            width,
        };
        mask.ensure_non_empty()?;

        tracing::debug!(
            batch = rows.len(),
            seq_len,
            scored = mask.counts().iter().sum::<usize>(),
            "Prepared batch"
        );

        Ok(PreparedBatch {
            tokens,
            mask,
            advantages: batch.iter().map(|e| e.advantage).collect(),
        })
    }
}

/// Tokenizer over raw UTF-8 bytes: id = byte + 1, id 0 is padding.
#[derive(Clone, Copy, Debug, Default)]
pub struct ByteTokenizer;

impl ByteTokenizer {
    pub const VOCAB_SIZE: i64 = 257;
}

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<i64>> {
        Ok(text.bytes().map(|b| i64::from(b) + 1).collect())
    }

    fn pad_id(&self) -> Option<i64> {
        Some(0)
    }
}

impl Persist for ByteTokenizer {
    fn persist(&self, dir: &Path) -> std::io::Result<()> {
        let config = serde_json::json!({
            "tokenizer_class": "ByteTokenizer",
            "vocab_size": Self::VOCAB_SIZE,
            "pad_token_id": 0,
        });
        let file = std::fs::File::create(dir.join("tokenizer_config.json"))?;
        serde_json::to_writer_pretty(file, &config)?;
        Ok(())
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Start index of the last occurrence of `needle` in `haystack`.
fn find_last(haystack: &[i64], needle: &[i64]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).rposition(|w| w == needle)
}
