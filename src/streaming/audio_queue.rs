//! FIFO queue for captured audio chunks
//!
//! Capture pushes chunks at its own pace; the frame scheduler drains one chunk
//! per tick. Pushes are only accepted while the session is running, so audio
//! captured after `stop()` never reaches the wire.
//!
//! # Memory Budget
//!
//! At 16kHz mono PCM16 with 40ms chunks:
//! - Chunk size: 640 samples × 2 bytes = 1,280 bytes
//! - 60 seconds: 1,500 chunks × 1,280 bytes ≈ 1.9 MB

use std::collections::VecDeque;

/// An opaque chunk of encoded or raw audio
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub data: Vec<u8>,
    /// Arrival order within the session (assigned by the queue)
    pub sequence: u64,
}

/// Convert PCM16 samples to the little-endian byte layout the service expects
pub fn pcm16_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|&s| s.to_le_bytes()).collect()
}

/// Whether capture is still feeding the queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunState {
    pub running: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Session not running (not yet open, or already stopped)
    NotRunning,
    /// Queue cap reached
    Full,
}

/// Ordered buffer of audio chunks, drained one at a time
///
/// Not internally synchronized: owned by the session's event loop.
#[derive(Debug, Default)]
pub struct AudioFrameQueue {
    chunks: VecDeque<AudioChunk>,
    max_chunks: Option<usize>,
    next_sequence: u64,
    dropped: u64,
}

impl AudioFrameQueue {
    /// Unbounded queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue that rejects pushes once `max_chunks` are waiting
    pub fn with_capacity_limit(max_chunks: Option<usize>) -> Self {
        Self {
            max_chunks,
            ..Self::default()
        }
    }

    /// Append a chunk if the session is running and the cap allows it.
    pub fn push(&mut self, data: Vec<u8>, run_state: RunState) -> PushOutcome {
        if !run_state.running {
            self.dropped += 1;
            return PushOutcome::NotRunning;
        }
        if let Some(max) = self.max_chunks {
            if self.chunks.len() >= max {
                self.dropped += 1;
                return PushOutcome::Full;
            }
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.chunks.push_back(AudioChunk { data, sequence });
        PushOutcome::Queued
    }

    /// Pop the oldest chunk
    pub fn drain_one(&mut self) -> Option<AudioChunk> {
        self.chunks.pop_front()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
    }

    /// Pushes rejected so far
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Audio bytes currently waiting
    pub fn memory_bytes(&self) -> usize {
        self.chunks.iter().map(|c| c.data.len()).sum()
    }
}
