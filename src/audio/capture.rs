//! Capture format requirements and a WAV file capture source
//!
//! The service only accepts 16kHz mono 16-bit audio. A live recorder should
//! be configured with [`CaptureFormat::recommended`]; a [`WavSource`] replays
//! a file already in that format as 40ms chunks.

use std::path::Path;

use serde::Serialize;
use thiserror::Error;

use crate::streaming::{pcm16_to_bytes, AudioEncoding};

pub const SAMPLE_RATE: u32 = 16_000;
pub const CHANNELS: u16 = 1;
pub const BITS_PER_SAMPLE: u16 = 16;

/// Recorder frame size
pub const FRAME_SIZE_BYTES: usize = 1024;

/// Longest recording the service accepts (10 minutes)
pub const MAX_DURATION_MS: u64 = 600_000;

/// 40ms of 16kHz mono PCM16: 640 samples × 2 bytes
pub const CHUNK_BYTES: usize = 1280;

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("failed to open WAV {path}: {message}")]
    Open { path: String, message: String },

    #[error("unsupported WAV format: {0}")]
    UnsupportedFormat(String),

    #[error("failed to read samples: {0}")]
    Read(String),
}

/// Recorder options for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CaptureFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub frame_size_bytes: usize,
    /// `pcm` for raw audio, `mp3` when the recorder encodes
    pub format: &'static str,
    pub duration_ms: u64,
}

impl CaptureFormat {
    /// Options matching what the service accepts for `encoding`.
    /// `duration_ms` is capped at [`MAX_DURATION_MS`].
    pub fn recommended(duration_ms: u64, encoding: AudioEncoding) -> Self {
        let format = if encoding.is_compressed() { "mp3" } else { "pcm" };
        Self {
            sample_rate: SAMPLE_RATE,
            channels: CHANNELS,
            bits_per_sample: BITS_PER_SAMPLE,
            frame_size_bytes: FRAME_SIZE_BYTES,
            format,
            duration_ms: duration_ms.min(MAX_DURATION_MS),
        }
    }
}

/// PCM16 audio loaded from a WAV file, handed out in 40ms chunks
#[derive(Debug, Clone)]
pub struct WavSource {
    bytes: Vec<u8>,
    position: usize,
}

impl WavSource {
    /// Open a 16kHz mono 16-bit integer WAV file.
    pub fn open(path: &Path) -> Result<Self, AudioError> {
        let reader = hound::WavReader::open(path).map_err(|e| AudioError::Open {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let spec = reader.spec();

        log::debug!(
            "WAV spec channels={}, sample_rate={}Hz, bits_per_sample={}",
            spec.channels,
            spec.sample_rate,
            spec.bits_per_sample
        );

        if spec.sample_rate != SAMPLE_RATE {
            return Err(AudioError::UnsupportedFormat(format!(
                "sample rate {}Hz (expected {}Hz)",
                spec.sample_rate, SAMPLE_RATE
            )));
        }
        if spec.channels != CHANNELS {
            return Err(AudioError::UnsupportedFormat(format!(
                "{} channels (expected {})",
                spec.channels, CHANNELS
            )));
        }
        if spec.bits_per_sample != BITS_PER_SAMPLE
            || spec.sample_format != hound::SampleFormat::Int
        {
            return Err(AudioError::UnsupportedFormat(format!(
                "{}-bit {:?} samples (expected 16-bit integer)",
                spec.bits_per_sample, spec.sample_format
            )));
        }

        let samples = reader
            .into_samples::<i16>()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AudioError::Read(e.to_string()))?;

        Ok(Self::from_pcm16(&samples))
    }

    pub fn from_pcm16(samples: &[i16]) -> Self {
        Self {
            bytes: pcm16_to_bytes(samples),
            position: 0,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        let samples = (self.bytes.len() / 2) as u64;
        samples * 1000 / SAMPLE_RATE as u64
    }

    pub fn remaining_chunks(&self) -> usize {
        (self.bytes.len() - self.position).div_ceil(CHUNK_BYTES)
    }
}

impl Iterator for WavSource {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        if self.position >= self.bytes.len() {
            return None;
        }
        let end = (self.position + CHUNK_BYTES).min(self.bytes.len());
        let chunk = self.bytes[self.position..end].to_vec();
        self.position = end;
        Some(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::{SampleFormat, WavSpec, WavWriter};

    fn write_wav(path: &Path, spec: WavSpec, samples: usize) {
        let mut writer = WavWriter::create(path, spec).unwrap();
        for i in 0..samples {
            writer.write_sample((i % 100) as i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    fn spec(sample_rate: u32, channels: u16) -> WavSpec {
        WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        }
    }

    #[test]
    fn test_recommended_format() {
        let format = CaptureFormat::recommended(30_000, AudioEncoding::Raw);
        assert_eq!(format.sample_rate, 16_000);
        assert_eq!(format.channels, 1);
        assert_eq!(format.bits_per_sample, 16);
        assert_eq!(format.frame_size_bytes, 1024);
        assert_eq!(format.format, "pcm");
        assert_eq!(format.duration_ms, 30_000);

        let format = CaptureFormat::recommended(3_600_000, AudioEncoding::Lame);
        assert_eq!(format.format, "mp3");
        assert_eq!(format.duration_ms, MAX_DURATION_MS);
    }

    #[test]
    fn test_wav_source_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("speech.wav");
        // 100ms: two full chunks and a half chunk
        write_wav(&path, spec(16_000, 1), 1600);

        let source = WavSource::open(&path).unwrap();
        assert_eq!(source.duration_ms(), 100);
        assert_eq!(source.remaining_chunks(), 3);

        let sizes: Vec<usize> = source.map(|c| c.len()).collect();
        assert_eq!(sizes, vec![1280, 1280, 640]);
    }

    #[test]
    fn test_wav_source_rejects_wrong_rate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cd.wav");
        write_wav(&path, spec(44_100, 1), 441);

        assert!(matches!(
            WavSource::open(&path),
            Err(AudioError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_wav_source_rejects_stereo() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        write_wav(&path, spec(16_000, 2), 320);

        assert!(matches!(
            WavSource::open(&path),
            Err(AudioError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let err = WavSource::open(Path::new("/nonexistent/speech.wav")).unwrap_err();
        assert!(matches!(err, AudioError::Open { .. }));
    }

    #[test]
    fn test_pcm16_source_is_little_endian() {
        let mut source = WavSource::from_pcm16(&[0x0102]);
        assert_eq!(source.next(), Some(vec![0x02, 0x01]));
        assert_eq!(source.next(), None);
    }
}
