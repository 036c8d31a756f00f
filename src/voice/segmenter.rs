//! Energy-based utterance segmentation
//!
//! Turns a continuous 16 kHz PCM stream into complete speech segments for
//! batch transcription backends.

/// Minimum RMS energy (normalized to 0..1) to consider speech
pub const ENERGY_THRESHOLD: f32 = 0.03;

/// Minimum duration of speech to keep a segment (in samples at 16kHz)
pub const MIN_SPEECH_SAMPLES: usize = 4800; // 0.3 seconds

/// Silence duration to consider end of utterance (in samples)
pub const SILENCE_SAMPLES: usize = 8000; // 0.5 seconds

/// Hard cap on one segment (in samples)
pub const MAX_SEGMENT_SAMPLES: usize = 16_000 * 15;

/// State of the segmenter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmenterState {
    /// Waiting for speech
    Idle,
    /// Speech detected, accumulating
    Speaking,
}

/// Splits PCM into utterances separated by silence
#[derive(Debug)]
pub struct SpeechSegmenter {
    state: SegmenterState,
    threshold: f32,
    speech_buffer: Vec<i16>,
    voiced: usize,
    silence_counter: usize,
}

impl Default for SpeechSegmenter {
    fn default() -> Self {
        Self::new(ENERGY_THRESHOLD)
    }
}

impl SpeechSegmenter {
    #[must_use]
    pub const fn new(threshold: f32) -> Self {
        Self {
            state: SegmenterState::Idle,
            threshold,
            speech_buffer: Vec::new(),
            voiced: 0,
            silence_counter: 0,
        }
    }

    /// Process samples; returns a finished segment when speech is followed by
    /// enough silence or the segment reaches its cap
    pub fn push(&mut self, samples: &[i16]) -> Option<Vec<i16>> {
        let energy = calculate_energy(samples);
        let is_speech = energy > self.threshold;

        match self.state {
            SegmenterState::Idle => {
                if is_speech {
                    self.state = SegmenterState::Speaking;
                    self.speech_buffer.clear();
                    self.speech_buffer.extend_from_slice(samples);
                    self.voiced = samples.len();
                    self.silence_counter = 0;
                    tracing::trace!(energy, "speech detected");
                }
                None
            }
            SegmenterState::Speaking => {
                self.speech_buffer.extend_from_slice(samples);

                if is_speech {
                    self.voiced += samples.len();
                    self.silence_counter = 0;
                } else {
                    self.silence_counter += samples.len();
                }

                let ended = self.silence_counter > SILENCE_SAMPLES;
                let capped = self.speech_buffer.len() >= MAX_SEGMENT_SAMPLES;

                if (ended || capped) && self.voiced > MIN_SPEECH_SAMPLES {
                    tracing::debug!(
                        samples = self.speech_buffer.len(),
                        capped,
                        "speech segment complete"
                    );
                    let segment = std::mem::take(&mut self.speech_buffer);
                    self.reset();
                    return Some(segment);
                }

                // Too much silence without enough speech
                if self.silence_counter > SILENCE_SAMPLES * 2 {
                    tracing::trace!("segment too short, discarding");
                    self.reset();
                }
                None
            }
        }
    }

    /// Whether a segment is being accumulated
    #[must_use]
    pub const fn is_speaking(&self) -> bool {
        matches!(self.state, SegmenterState::Speaking)
    }

    #[must_use]
    pub const fn state(&self) -> SegmenterState {
        self.state
    }

    /// Drop any partial segment
    pub fn reset(&mut self) {
        self.state = SegmenterState::Idle;
        self.speech_buffer.clear();
        self.voiced = 0;
        self.silence_counter = 0;
    }
}

/// RMS energy of PCM samples, normalized to 0..1
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn calculate_energy(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples
        .iter()
        .map(|&s| {
            let v = f32::from(s) / 32768.0;
            v * v
        })
        .sum();
    (sum_squares / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(len: usize) -> Vec<i16> {
        (0..len)
            .map(|i| if i % 2 == 0 { 8000 } else { -8000 })
            .collect()
    }

    #[test]
    fn test_energy_calculation() {
        assert!(calculate_energy(&[0; 100]) < 0.001);
        assert!(calculate_energy(&[16_384; 100]) > 0.4);
        assert!(calculate_energy(&[]) < f32::EPSILON);
    }

    #[test]
    fn test_segment_after_silence() {
        let mut seg = SpeechSegmenter::default();
        assert!(seg.push(&[0; 1600]).is_none());
        assert!(seg.push(&tone(6400)).is_none());
        assert!(seg.is_speaking());

        assert!(seg.push(&[0; 4000]).is_none());
        let segment = seg.push(&[0; 4800]).unwrap();
        assert_eq!(segment.len(), 6400 + 4000 + 4800);
        assert_eq!(seg.state(), SegmenterState::Idle);
    }

    #[test]
    fn test_short_blip_is_discarded() {
        let mut seg = SpeechSegmenter::default();
        seg.push(&tone(160));
        for _ in 0..12 {
            assert!(seg.push(&[0; 1600]).is_none());
        }
        assert_eq!(seg.state(), SegmenterState::Idle);
    }
}
