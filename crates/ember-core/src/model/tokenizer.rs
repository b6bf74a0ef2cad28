//! Unigram subword tokenizer.
//!
//! Encoding picks the minimum-cost segmentation of the whole input with a
//! best-path search over byte offsets. Each piece carries a cost (the
//! negated log-probability stored by the checkpoint loader) and the cost of
//! a segmentation is the sum of its pieces.
//!
//! Spaces are rewritten to [`WORD_BOUNDARY`] before segmentation and
//! restored on decode.

use crate::error::{EmberError, Result};
use std::collections::HashMap;

/// Sentinel standing in for a space inside vocabulary pieces (U+2581).
pub const WORD_BOUNDARY: &str = "\u{2581}";

/// Id returned for text with no valid segmentation.
pub const UNKNOWN_TOKEN: u32 = 0;

/// A single vocabulary record.
#[derive(Debug, Clone, PartialEq)]
pub struct VocabEntry {
    /// Piece text, with spaces encoded as [`WORD_BOUNDARY`].
    pub text: String,
    /// Dense id assigned in load order.
    pub id: u32,
    /// Segmentation cost; lower wins.
    pub score: f32,
}

/// Vocabulary plus the segmentation lookup.
#[derive(Debug, Clone, Default)]
pub struct Tokenizer {
    /// Piece text to (id, score).
    pieces: HashMap<String, (u32, f32)>,
    /// Piece text by id.
    id_to_piece: Vec<String>,
    /// Longest piece in bytes, bounds the inner search loop.
    max_piece_len: usize,
}

impl Tokenizer {
    /// Create an empty tokenizer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tokenizer from `(text, score)` pairs, assigning ids in order.
    pub fn from_pieces<I, S>(pieces: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, f32)>,
        S: Into<String>,
    {
        let mut tokenizer = Self::new();
        for (text, score) in pieces {
            tokenizer.push(text.into(), score)?;
        }
        Ok(tokenizer)
    }

    /// Append a piece with the next free id.
    ///
    /// Fails if the text is already in the vocabulary.
    pub fn push(&mut self, text: String, score: f32) -> Result<u32> {
        if self.pieces.contains_key(&text) {
            return Err(EmberError::InvalidVocab(format!(
                "duplicate piece {text:?}"
            )));
        }
        let id = u32::try_from(self.id_to_piece.len())
            .map_err(|_| EmberError::InvalidVocab("vocabulary exceeds u32 ids".into()))?;
        self.max_piece_len = self.max_piece_len.max(text.len());
        self.pieces.insert(text.clone(), (id, score));
        self.id_to_piece.push(text);
        Ok(id)
    }

    /// Number of pieces.
    pub fn vocab_size(&self) -> usize {
        self.id_to_piece.len()
    }

    /// Raw piece text for an id.
    pub fn piece(&self, id: u32) -> Option<&str> {
        self.id_to_piece.get(id as usize).map(String::as_str)
    }

    /// Piece text for an id with word boundaries rendered as spaces.
    pub fn render_piece(&self, id: u32) -> Option<String> {
        self.piece(id).map(|p| p.replace(WORD_BOUNDARY, " "))
    }

    /// Full record for a piece.
    pub fn entry(&self, text: &str) -> Option<VocabEntry> {
        self.pieces.get(text).map(|&(id, score)| VocabEntry {
            text: text.to_string(),
            id,
            score,
        })
    }

    /// Encode text to token ids.
    ///
    /// Empty input yields no ids. Input with no complete segmentation yields
    /// `[UNKNOWN_TOKEN]`.
    pub fn encode(&self, text: &str) -> Vec<u32> {
        if text.is_empty() {
            return Vec::new();
        }
        let normalized = text.replace(' ', WORD_BOUNDARY);
        self.segment(&normalized)
            .unwrap_or_else(|| vec![UNKNOWN_TOKEN])
    }

    /// Best-path segmentation of already normalized text.
    ///
    /// Returns `None` when the end of the string is unreachable.
    fn segment(&self, text: &str) -> Option<Vec<u32>> {
        let len = text.len();
        let mut best_score = vec![f32::INFINITY; len + 1];
        let mut best_start = vec![0usize; len + 1];
        best_score[0] = 0.0;

        for start in 0..len {
            let base = best_score[start];
            if !base.is_finite() {
                continue;
            }
            let limit = len.min(start + self.max_piece_len);
            for end in start + 1..=limit {
                // `get` is None off char boundaries.
                let Some(candidate) = text.get(start..end) else {
                    continue;
                };
                if let Some(&(_, score)) = self.pieces.get(candidate) {
                    let total = base + score;
                    if total < best_score[end] {
                        best_score[end] = total;
                        best_start[end] = start;
                    }
                }
            }
        }

        if !best_score[len].is_finite() {
            return None;
        }

        let mut ids = Vec::new();
        let mut end = len;
        while end > 0 {
            let start = best_start[end];
            let &(id, _) = self.pieces.get(&text[start..end])?;
            ids.push(id);
            end = start;
        }
        ids.reverse();
        Some(ids)
    }

    /// Decode ids to text.
    ///
    /// Ids outside the vocabulary are skipped.
    pub fn decode(&self, ids: &[u32]) -> String {
        let joined: String = ids.iter().filter_map(|&id| self.piece(id)).collect();
        joined.replace(WORD_BOUNDARY, " ")
    }

    /// Iterate over every entry in id order.
    pub fn entries(&self) -> impl Iterator<Item = VocabEntry> + '_ {
        self.id_to_piece.iter().map(|text| {
            let (id, score) = self.pieces[text];
            VocabEntry {
                text: text.clone(),
                id,
                score,
            }
        })
    }
}
