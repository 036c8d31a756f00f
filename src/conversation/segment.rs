//! Text shaping between recognition, generation and synthesis

/// Characters that end a synthesis segment
const SENTENCE_TERMINATORS: &[char] = &['。', '！', '？', '.', '!', '?', '；', ';', '\n'];

/// Punctuation stripped from the start of a command transcript
const LEADING_PUNCTUATION: &[char] = &['，', ',', '。', '.', '！', '!', '？', '?', '、', '：', ':'];

/// Command text spoken after the wake phrase, without leading punctuation
#[must_use]
pub fn clean_command(text: &str) -> &str {
    text.trim_start_matches(|c: char| c.is_whitespace() || LEADING_PUNCTUATION.contains(&c))
        .trim_end()
}

/// Groups streamed reply text into sentence-sized synthesis segments
#[derive(Debug, Clone)]
pub struct SentenceSplitter {
    buffer: String,
    chars: usize,
    max_chars: usize,
}

impl SentenceSplitter {
    #[must_use]
    pub const fn new(max_chars: usize) -> Self {
        Self {
            buffer: String::new(),
            chars: 0,
            max_chars: if max_chars == 0 { 1 } else { max_chars },
        }
    }

    /// Append text; returns every segment completed by it
    pub fn push(&mut self, text: &str) -> Vec<String> {
        let mut segments = Vec::new();

        for c in text.chars() {
            self.buffer.push(c);
            self.chars += 1;

            if SENTENCE_TERMINATORS.contains(&c) || self.chars >= self.max_chars {
                if let Some(segment) = self.take() {
                    segments.push(segment);
                }
            }
        }

        segments
    }

    /// Remaining text at end of generation
    pub fn flush(&mut self) -> Option<String> {
        self.take()
    }

    fn take(&mut self) -> Option<String> {
        self.chars = 0;
        let segment = std::mem::take(&mut self.buffer);
        if segment.trim().is_empty() {
            None
        } else {
            Some(segment)
        }
    }
}
