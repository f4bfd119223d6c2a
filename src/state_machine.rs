//! Protocol state machine for an evaluation session
//!
//! All transitions go through the `reduce()` function, which returns the next
//! state and a list of effects for the session runtime to execute. The reducer
//! itself never touches the transport, the queue or the callback.

use crate::error::IseError;
use crate::streaming::{DecodedResponse, EvaluationResult};

/// Connection lifecycle of one session
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    Idle,
    /// Resolving the URL / waiting for the transport to open.
    /// `stop_requested` remembers a `stop()` that arrived before the socket opened.
    Connecting {
        stop_requested: bool,
    },
    /// Capturing and streaming
    Open,
    /// Capture stopped; remaining audio is still being flushed
    Finishing,
    Closed,
    Errored,
}

impl State {
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Closed | State::Errored)
    }

    fn is_active(&self) -> bool {
        matches!(
            self,
            State::Connecting { .. } | State::Open | State::Finishing
        )
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone)]
pub enum Event {
    /// Caller started the session
    Start,
    UrlResolved {
        url: String,
    },
    UrlFailed {
        err: IseError,
    },
    TransportOpen,
    /// Caller stopped capturing
    Stop,
    /// Caller tore the session down
    Disconnect,
    /// A decoded service message. `first_frame_sent` is the scheduler's flag at arrival.
    Response {
        response: DecodedResponse,
        first_frame_sent: bool,
    },
    TransportError {
        message: String,
    },
    TransportClosed,
}

/// Work for the session runtime
#[derive(Debug, Clone)]
pub enum Effect {
    ResolveUrl,
    OpenTransport { url: String },
    SetRunning(bool),
    ArmScheduler,
    CancelScheduler,
    CloseTransport,
    NotifyOpen,
    NotifyResult(EvaluationResult),
    NotifyError(IseError),
    NotifyClose,
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Terminal states ignore every event
/// - Every path into `Closed`/`Errored` from an active state halts the
///   scheduler and closes the transport
/// - Results are delivered before the message's terminal/error handling
pub fn reduce(state: &State, event: Event) -> (State, Vec<Effect>) {
    use Effect::*;
    use Event::*;
    use State::*;

    match (state, event) {
        // -----------------
        // Idle
        // -----------------
        (Idle, Start) => (
            Connecting {
                stop_requested: false,
            },
            vec![ResolveUrl],
        ),
        (Idle, Disconnect) => (Closed, vec![]),

        // -----------------
        // Connecting
        // -----------------
        (Connecting { .. }, UrlResolved { url }) => (state.clone(), vec![OpenTransport { url }]),
        (Connecting { .. }, UrlFailed { err }) => (Errored, vec![NotifyError(err)]),
        (
            Connecting {
                stop_requested: false,
            },
            TransportOpen,
        ) => (Open, vec![SetRunning(true), NotifyOpen, ArmScheduler]),
        // Capture already ended: flush straight away without accepting audio
        (
            Connecting {
                stop_requested: true,
            },
            TransportOpen,
        ) => (Finishing, vec![NotifyOpen, ArmScheduler]),
        (Connecting { .. }, Stop) => (
            Connecting {
                stop_requested: true,
            },
            vec![],
        ),

        // -----------------
        // Open / Finishing
        // -----------------
        (Open, Stop) => (Finishing, vec![SetRunning(false)]),
        (
            Open | Finishing,
            Response {
                response,
                first_frame_sent,
            },
        ) => on_response(state, response, first_frame_sent),

        // -----------------
        // Any active state
        // -----------------
        (s, TransportError { message }) if s.is_active() => (
            Errored,
            vec![
                SetRunning(false),
                CancelScheduler,
                CloseTransport,
                NotifyError(IseError::Transport(message)),
            ],
        ),
        (s, TransportClosed) if s.is_active() => (
            Closed,
            vec![SetRunning(false), CancelScheduler, CloseTransport, NotifyClose],
        ),
        (s, Disconnect) if s.is_active() => (
            Closed,
            vec![SetRunning(false), CancelScheduler, CloseTransport, NotifyClose],
        ),

        // -----------------
        // Unhandled: no transition
        // -----------------
        _ => (state.clone(), vec![]),
    }
}

fn on_response(
    state: &State,
    mut response: DecodedResponse,
    first_frame_sent: bool,
) -> (State, Vec<Effect>) {
    let mut effects = Vec::new();
    if let Some(result) = response.result.take() {
        effects.push(Effect::NotifyResult(result));
    }

    let failure = if let Some(err) = response.error() {
        Some(err)
    } else if response.terminal && !first_frame_sent {
        Some(IseError::Protocol(
            "service finished before any audio frame was sent".to_string(),
        ))
    } else {
        None
    };

    if let Some(err) = failure {
        effects.extend([
            Effect::SetRunning(false),
            Effect::CancelScheduler,
            Effect::CloseTransport,
            Effect::NotifyError(err),
        ]);
        return (State::Errored, effects);
    }

    if response.terminal {
        effects.extend([
            Effect::SetRunning(false),
            Effect::CancelScheduler,
            Effect::CloseTransport,
            Effect::NotifyClose,
        ]);
        return (State::Closed, effects);
    }

    (state.clone(), effects)
}
