//! Audio capture helpers
//!
//! Live capture is left to the host application; this module describes the
//! format it must produce and replays WAV files through a session.

mod capture;

pub use capture::{
    AudioError, CaptureFormat, WavSource, BITS_PER_SAMPLE, CHANNELS, CHUNK_BYTES,
    FRAME_SIZE_BYTES, MAX_DURATION_MS, SAMPLE_RATE,
};
