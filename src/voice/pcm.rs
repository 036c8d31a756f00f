//! PCM and WAV helpers
//!
//! Wire audio is mono 16-bit little-endian PCM: 16 kHz from the terminal,
//! 24 kHz back to it.

use std::path::Path;
use std::time::Duration;

use crate::{Error, Result};

/// Terminal microphone sample rate
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Synthesized speech sample rate
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Decode little-endian PCM bytes; a trailing odd byte is ignored
#[must_use]
pub fn pcm_to_samples(pcm: &[u8]) -> Vec<i16> {
    pcm.chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

/// Encode samples as little-endian PCM bytes
#[must_use]
pub fn samples_to_pcm(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Playback duration of a PCM buffer
#[must_use]
pub fn pcm_duration(pcm_len: usize, sample_rate: u32) -> Duration {
    let samples = (pcm_len / 2) as u64;
    Duration::from_micros(samples * 1_000_000 / u64::from(sample_rate.max(1)))
}

/// Convert samples to WAV bytes for transcription APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &sample in samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
    }

    Ok(cursor.into_inner())
}

/// Read a WAV file as mono 16-bit samples
///
/// Multi-channel files keep only the first channel; float files are
/// converted. Returns the samples and the file's sample rate.
///
/// # Errors
///
/// Returns error if the file cannot be read or uses an unsupported format
pub fn read_wav(path: &Path) -> Result<(Vec<i16>, u32)> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let samples: Vec<i16> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Int, 16) => reader
            .samples::<i16>()
            .step_by(channels)
            .collect::<std::result::Result<_, _>>()?,
        (hound::SampleFormat::Float, 32) => reader
            .samples::<f32>()
            .step_by(channels)
            .map(|s| s.map(float_to_i16))
            .collect::<std::result::Result<_, _>>()?,
        (format, bits) => {
            return Err(Error::Audio(format!(
                "unsupported wav format {format:?} at {bits} bits"
            )));
        }
    };

    tracing::debug!(
        path = %path.display(),
        samples = samples.len(),
        sample_rate = spec.sample_rate,
        "wav loaded"
    );

    Ok((samples, spec.sample_rate))
}

#[allow(clippy::cast_possible_truncation)]
fn float_to_i16(sample: f32) -> i16 {
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}
