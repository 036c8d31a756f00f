//! Terminal audio I/O
//!
//! The terminal's microphone and speaker sit behind [`AudioSource`] and
//! [`AudioSink`]. Sources pace themselves like a live microphone; sinks must
//! drop buffered playback on [`AudioSink::reset`].

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::voice::{INPUT_SAMPLE_RATE, pcm_duration, read_wav, samples_to_pcm};
use crate::{Error, Result};

/// Silence appended after a WAV file so the far end sees the utterance end
const TRAILING_SILENCE: Duration = Duration::from_secs(1);

/// Characters per chunk when a script line is streamed
const SCRIPT_CHARS_PER_CHUNK: usize = 4;

/// Microphone stand-in
#[async_trait]
pub trait AudioSource: Send {
    /// Next PCM chunk; `None` once the source is exhausted
    ///
    /// Implementations must not lose data when the returned future is
    /// dropped before completion.
    async fn next_chunk(&mut self) -> Option<Vec<u8>>;
}

/// Speaker stand-in
pub trait AudioSink: Send {
    /// Queue PCM for playback
    fn play(&mut self, pcm: &[u8]);

    /// Discard everything not yet played
    fn reset(&mut self);
}

/// Waits for the next due time without losing progress on cancellation
#[derive(Debug)]
struct Pacer {
    interval: Duration,
    next_due: Option<Instant>,
}

impl Pacer {
    const fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_due: None,
        }
    }

    async fn wait(&mut self) {
        let due = *self.next_due.get_or_insert_with(Instant::now);
        tokio::time::sleep_until(due).await;
    }

    fn advance(&mut self) {
        let due = self.next_due.unwrap_or_else(Instant::now);
        self.next_due = Some(due + self.interval);
    }
}

/// Streams a 16 kHz mono WAV file in real time
#[derive(Debug)]
pub struct WavFileSource {
    pcm: Vec<u8>,
    offset: usize,
    chunk_bytes: usize,
    pacer: Pacer,
}

impl WavFileSource {
    /// Load `path`, adding a second of trailing silence
    ///
    /// # Errors
    ///
    /// Returns error if the file is unreadable or not 16 kHz
    pub fn open(path: &Path, chunk_bytes: usize) -> Result<Self> {
        let (mut samples, sample_rate) = read_wav(path)?;
        if sample_rate != INPUT_SAMPLE_RATE {
            return Err(Error::Audio(format!(
                "{} is {sample_rate} Hz, expected {INPUT_SAMPLE_RATE} Hz",
                path.display()
            )));
        }

        let silence = INPUT_SAMPLE_RATE as usize * TRAILING_SILENCE.as_millis() as usize / 1000;
        samples.resize(samples.len() + silence, 0);

        tracing::info!(path = %path.display(), samples = samples.len(), "loaded audio source");
        Ok(Self::from_pcm(samples_to_pcm(&samples), chunk_bytes))
    }

    /// Stream raw 16 kHz PCM
    #[must_use]
    pub fn from_pcm(pcm: Vec<u8>, chunk_bytes: usize) -> Self {
        let chunk_bytes = chunk_bytes.max(2) & !1;
        Self {
            pcm,
            offset: 0,
            chunk_bytes,
            pacer: Pacer::new(pcm_duration(chunk_bytes, INPUT_SAMPLE_RATE)),
        }
    }
}

#[async_trait]
impl AudioSource for WavFileSource {
    async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        if self.offset >= self.pcm.len() {
            return None;
        }

        self.pacer.wait().await;

        let end = (self.offset + self.chunk_bytes).min(self.pcm.len());
        let chunk = self.pcm[self.offset..end].to_vec();
        self.offset = end;
        self.pacer.advance();
        Some(chunk)
    }
}

/// Streams lines of text for the text recognizer
///
/// Each line is sent a few characters at a time; its last chunk ends with a
/// newline, which marks the end of the utterance.
#[derive(Debug)]
pub struct ScriptSource {
    chunks: std::collections::VecDeque<Vec<u8>>,
    pacer: Pacer,
}

impl ScriptSource {
    #[must_use]
    pub fn new<I, S>(lines: I, chunk_delay: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut chunks = std::collections::VecDeque::new();

        for line in lines {
            let line = line.as_ref().trim();
            if line.is_empty() {
                continue;
            }

            let chars: Vec<char> = line.chars().collect();
            let pieces: Vec<String> = chars
                .chunks(SCRIPT_CHARS_PER_CHUNK)
                .map(|c| c.iter().collect())
                .collect();
            let last = pieces.len() - 1;
            for (i, mut piece) in pieces.into_iter().enumerate() {
                if i == last {
                    piece.push('\n');
                }
                chunks.push_back(piece.into_bytes());
            }
        }

        Self {
            chunks,
            pacer: Pacer::new(chunk_delay),
        }
    }

    /// Read one utterance per line from `path`
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read
    pub fn from_file(path: &Path, chunk_delay: Duration) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::new(content.lines(), chunk_delay))
    }

    /// Chunks not yet sent
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.chunks.len()
    }
}

#[async_trait]
impl AudioSource for ScriptSource {
    async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        if self.chunks.is_empty() {
            return None;
        }

        self.pacer.wait().await;
        self.pacer.advance();
        self.chunks.pop_front()
    }
}

#[derive(Debug, Default)]
struct Recording {
    buffered: Vec<u8>,
    received: Vec<u8>,
    chunks: u64,
    resets: u64,
}

/// Sink that keeps played audio in memory
///
/// A reset drops the playback buffer but not the record of everything
/// received. Clones share the same recording, so a caller can keep one clone
/// while the terminal owns another.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    recording: Arc<Mutex<Recording>>,
}

impl RecordingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Recording> {
        self.recording
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Audio buffered since the last reset
    #[must_use]
    pub fn pcm(&self) -> Vec<u8> {
        self.lock().buffered.clone()
    }

    /// Every byte received, across resets
    #[must_use]
    pub fn received(&self) -> Vec<u8> {
        self.lock().received.clone()
    }

    /// Chunks played in total
    #[must_use]
    pub fn chunks(&self) -> u64 {
        self.lock().chunks
    }

    /// Number of resets
    #[must_use]
    pub fn resets(&self) -> u64 {
        self.lock().resets
    }
}

impl AudioSink for RecordingSink {
    fn play(&mut self, pcm: &[u8]) {
        let mut recording = self.lock();
        recording.buffered.extend_from_slice(pcm);
        recording.received.extend_from_slice(pcm);
        recording.chunks += 1;
        tracing::trace!(bytes = pcm.len(), total = recording.received.len(), "playing audio");
    }

    fn reset(&mut self) {
        let mut recording = self.lock();
        if !recording.buffered.is_empty() {
            tracing::debug!(bytes = recording.buffered.len(), "discarding buffered playback");
        }
        recording.buffered.clear();
        recording.resets += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::samples_to_wav;

    #[tokio::test(start_paused = true)]
    async fn script_source_streams_lines() {
        let mut source = ScriptSource::new(["小车小车向前走", "", "hi"], Duration::from_millis(50));
        assert_eq!(source.remaining(), 3);

        let started = Instant::now();
        let mut chunks = Vec::new();
        while let Some(chunk) = source.next_chunk().await {
            chunks.push(String::from_utf8(chunk).unwrap());
        }

        assert_eq!(chunks, vec!["小车小车", "向前走\n", "hi\n"]);
        assert_eq!(started.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn wav_source_chunks_and_pads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.wav");
        std::fs::write(&path, samples_to_wav(&[1i16; 100], INPUT_SAMPLE_RATE).unwrap()).unwrap();

        let mut source = WavFileSource::open(&path, 1024).unwrap();
        let mut total = 0;
        let mut first = None;
        while let Some(chunk) = source.next_chunk().await {
            first.get_or_insert_with(|| chunk.clone());
            total += chunk.len();
        }

        assert_eq!(total, (100 + 16_000) * 2);
        assert_eq!(&first.unwrap()[..2], &[1, 0]);
    }

    #[test]
    fn wav_source_rejects_other_rates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.wav");
        std::fs::write(&path, samples_to_wav(&[0i16; 10], 8000).unwrap()).unwrap();

        assert!(matches!(WavFileSource::open(&path, 1024), Err(Error::Audio(_))));
    }

    #[test]
    fn recording_sink_reset_discards_playback() {
        let sink = RecordingSink::new();
        let mut owned = sink.clone();

        owned.play(&[1, 2, 3]);
        assert_eq!(sink.pcm(), vec![1, 2, 3]);

        owned.reset();
        assert!(sink.pcm().is_empty());
        assert_eq!(sink.received(), vec![1, 2, 3]);
        assert_eq!(sink.resets(), 1);
        assert_eq!(sink.chunks(), 1);
    }
}
