//! Streaming pronunciation evaluation client
//!
//! Streams captured speech to a remote speech-evaluation service over a
//! signed WebSocket and reports per-utterance scores.
//!
//! ```no_run
//! use ise_stream::{ChannelCallback, EvaluationSession, IseConfig, SessionEvent};
//!
//! # async fn demo(chunks: Vec<Vec<u8>>) -> Result<(), ise_stream::IseError> {
//! let config = IseConfig::from_env();
//! let session = EvaluationSession::from_config(&config, "今天天气怎么样")?;
//! let (callback, mut events) = ChannelCallback::new();
//! let handle = session.start(callback);
//!
//! for chunk in chunks {
//!     handle.push_audio(chunk);
//! }
//! handle.stop();
//!
//! while let Some(event) = events.recv().await {
//!     if let SessionEvent::Result(result) = event {
//!         println!("score: {:?}", result.total_score());
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod auth;
pub mod config;
mod error;
mod session;
pub mod state_machine;
pub mod streaming;

pub use auth::{BackendUrlProvider, FixedUrl, LocalSigner, UrlProvider};
pub use config::{load_config, save_config, IseConfig};
pub use error::IseError;
pub use session::{
    ChannelCallback, EvaluationCallback, EvaluationSession, SessionEvent, SessionHandle,
    SessionOptions, SessionOutcome,
};
pub use state_machine::State;
pub use streaming::{
    AudioEncoding, Connector, EvaluationResult, SessionParams, Transport, TransportEvent,
    TransportEventSender, WsConnector, XmlNode,
};
