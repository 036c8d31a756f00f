//! Voice processing helpers
//!
//! Wake phrase matching on transcripts, energy-based segmentation of the
//! inbound PCM stream, and PCM/WAV conversion.

mod pcm;
mod segmenter;
mod wake_word;

pub use pcm::{
    INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE, pcm_duration, pcm_to_samples, read_wav,
    samples_to_pcm, samples_to_wav,
};
pub use segmenter::{SegmenterState, SpeechSegmenter, calculate_energy};
pub use wake_word::WakeDetector;
