//! Wake phrase detection on recognized text
//!
//! Matching is a case-insensitive substring search over the transcript.
//! Phrases are normalized (trimmed, lowercased) once at construction.

use crate::{Error, Result};

/// Detects configured wake phrases in transcripts
#[derive(Debug, Clone)]
pub struct WakeDetector {
    wake_words: Vec<String>,
}

impl WakeDetector {
    /// Create a detector
    ///
    /// # Arguments
    ///
    /// * `wake_words` - Phrases to detect (e.g. "小车小车")
    ///
    /// # Errors
    ///
    /// Returns error if no non-empty phrase is given
    pub fn new(wake_words: Vec<String>) -> Result<Self> {
        let normalized: Vec<String> = wake_words
            .into_iter()
            .map(|w| w.trim().to_lowercase())
            .filter(|w| !w.is_empty())
            .collect();

        if normalized.is_empty() {
            return Err(Error::Config("at least one wake phrase is required".to_string()));
        }

        tracing::debug!(wake_words = ?normalized, "wake detector initialized");

        Ok(Self {
            wake_words: normalized,
        })
    }

    /// Check if a transcript contains any wake phrase
    #[must_use]
    pub fn contains(&self, transcript: &str) -> bool {
        let normalized = transcript.to_lowercase();
        self.wake_words.iter().any(|w| normalized.contains(w))
    }

    /// Find the last wake phrase in `transcript`
    ///
    /// Returns the original text that follows it, or `None` when no phrase
    /// occurs.
    #[must_use]
    pub fn find<'a>(&self, transcript: &'a str) -> Option<&'a str> {
        let folded = Folded::new(transcript);

        let end = self
            .wake_words
            .iter()
            .filter_map(|w| folded.lower.rfind(w.as_str()).map(|pos| pos + w.len()))
            .max()?;

        let original_end = folded.original_offset(end);
        tracing::debug!(transcript, "wake phrase detected");
        Some(&transcript[original_end..])
    }

    /// Configured phrases, normalized
    #[must_use]
    pub fn wake_words(&self) -> &[String] {
        &self.wake_words
    }
}

/// Lowercased text with a map back to byte offsets in the original
struct Folded {
    lower: String,
    /// `(lower_offset, original_offset)` at each original char boundary
    boundaries: Vec<(usize, usize)>,
    original_len: usize,
}

impl Folded {
    fn new(text: &str) -> Self {
        let mut lower = String::with_capacity(text.len());
        let mut boundaries = Vec::with_capacity(text.len());
        for (offset, ch) in text.char_indices() {
            boundaries.push((lower.len(), offset));
            lower.extend(ch.to_lowercase());
        }
        Self {
            lower,
            boundaries,
            original_len: text.len(),
        }
    }

    /// Original offset of the first char starting at or after `lower_offset`
    fn original_offset(&self, lower_offset: usize) -> usize {
        let idx = self
            .boundaries
            .partition_point(|&(lower, _)| lower < lower_offset);
        self.boundaries
            .get(idx)
            .map_or(self.original_len, |&(_, original)| original)
    }
}
