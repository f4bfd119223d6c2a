//! Streaming pipeline for speech evaluation
//!
//! Captured audio flows through a queue and a fixed-cadence scheduler onto a
//! duplex text transport; service messages flow back through the decoder.
//!
//! # Architecture
//!
//! ```text
//! push_audio ──▶ AudioFrameQueue ──▶ FrameScheduler (40ms ticks)
//!                                          │
//!                                          ▼
//!                                   ProtocolFrame JSON
//!                                     (Transport)
//!                                          │
//!                                          ▼
//!                             decode() ──▶ EvaluationResult
//! ```
//!
//! # Frame Phases
//!
//! - First frame: session parameters, reference text and the first chunk
//! - Middle frames: one chunk each
//! - Last frame: no audio; tells the service to finish scoring

mod audio_queue;
mod decoder;
mod protocol;
mod result;
mod scheduler;
mod transport;

pub use audio_queue::{pcm16_to_bytes, AudioChunk, AudioFrameQueue, PushOutcome, RunState};
pub use decoder::{decode, DecodedResponse, FINAL_STATUS};
pub use protocol::{
    AudioEncoding, Business, Common, FrameData, FrameStatus, ProtocolFrame, SessionParams,
    AUDIO_FORMAT,
};
pub use result::{parse_document, EvaluationResult, XmlNode};
pub use scheduler::{FrameScheduler, TickOutcome};
pub use transport::{Connector, Transport, TransportEvent, TransportEventSender, WsConnector};
