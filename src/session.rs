//! Evaluation session runtime
//!
//! A session owns one event loop task. Caller commands, URL resolution,
//! transport events and scheduler ticks all funnel into that task, so the
//! queue, the scheduler and the state machine are never touched concurrently.
//!
//! ```text
//! SessionHandle ──commands──▶ ┌────────────────────┐ ──frames──▶ Transport
//!                             │   session task     │
//! UrlProvider ───events─────▶ │ reduce() / effects │ ◀──events── Transport
//!                             │ FrameScheduler     │
//!                             └────────────────────┘ ──▶ EvaluationCallback
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::auth::{LocalSigner, UrlProvider};
use crate::config::IseConfig;
use crate::error::IseError;
use crate::state_machine::{reduce, Effect, Event, State};
use crate::streaming::{
    decode, AudioFrameQueue, Connector, EvaluationResult, FrameScheduler, PushOutcome, RunState,
    SessionParams, TickOutcome, Transport, TransportEvent, TransportEventSender, WsConnector,
};

/// Receives the outcome of a session. Called from the session task, in order.
pub trait EvaluationCallback: Send + 'static {
    fn on_open(&mut self) {}
    fn on_result(&mut self, result: EvaluationResult);
    fn on_error(&mut self, error: IseError);
    fn on_close(&mut self) {}
}

/// Callback notifications as values
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Opened,
    Result(EvaluationResult),
    Error(IseError),
    Closed,
}

/// Forwards every notification into a channel
#[derive(Debug, Clone)]
pub struct ChannelCallback {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelCallback {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: SessionEvent) {
        // Receiver gone means nobody is listening any more
        let _ = self.tx.send(event);
    }
}

impl EvaluationCallback for ChannelCallback {
    fn on_open(&mut self) {
        self.forward(SessionEvent::Opened);
    }

    fn on_result(&mut self, result: EvaluationResult) {
        self.forward(SessionEvent::Result(result));
    }

    fn on_error(&mut self, error: IseError) {
        self.forward(SessionEvent::Error(error));
    }

    fn on_close(&mut self) {
        self.forward(SessionEvent::Closed);
    }
}

/// Timing and buffering knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub tick_interval: Duration,
    /// Delay between the transport opening and the first tick
    pub settle_delay: Duration,
    /// `None` keeps every chunk
    pub max_queued_chunks: Option<usize>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(40),
            settle_delay: Duration::from_millis(500),
            max_queued_chunks: None,
        }
    }
}

impl SessionOptions {
    pub fn from_config(config: &IseConfig) -> Self {
        Self {
            tick_interval: config.tick_interval(),
            settle_delay: config.settle_delay(),
            max_queued_chunks: config.max_queued_chunks,
        }
    }

    fn validate(&self) -> Result<(), IseError> {
        if self.tick_interval.is_zero() {
            return Err(IseError::Config(
                "tick interval must be greater than zero".to_string(),
            ));
        }
        if self.max_queued_chunks == Some(0) {
            return Err(IseError::Config(
                "max queued chunks must be greater than zero when set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Summary returned once the session task has ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    /// `Closed` or `Errored`
    pub final_state: State,
    pub frames_sent: u64,
    /// Pushes rejected because the session was not running or the queue was full
    pub chunks_dropped: u64,
}

/// A configured, not yet started evaluation
pub struct EvaluationSession {
    id: String,
    params: SessionParams,
    options: SessionOptions,
    url_provider: Arc<dyn UrlProvider>,
    connector: Arc<dyn Connector>,
}

impl std::fmt::Debug for EvaluationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvaluationSession")
            .field("id", &self.id)
            .field("params", &self.params)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl EvaluationSession {
    pub fn new(
        params: SessionParams,
        url_provider: Arc<dyn UrlProvider>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let id = Uuid::new_v4().simple().to_string()[..8].to_string();
        Self {
            id,
            params,
            options: SessionOptions::default(),
            url_provider,
            connector,
        }
    }

    pub fn with_options(mut self, options: SessionOptions) -> Result<Self, IseError> {
        options.validate()?;
        self.options = options;
        Ok(self)
    }

    /// Session signed locally from `config` and connected over a WebSocket.
    pub fn from_config(config: &IseConfig, text: impl Into<String>) -> Result<Self, IseError> {
        config.validate()?;
        let params = SessionParams::from_config(config, text)?;
        let signer = LocalSigner::from_config(config)?;
        Self::new(params, Arc::new(signer), Arc::new(WsConnector::new()))
            .with_options(SessionOptions::from_config(config))
    }

    /// Short id used to prefix this session's log lines
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    /// Spawn the session task and begin connecting.
    ///
    /// Must be called from within a tokio runtime. Consumes the session, so a
    /// session can only ever be started once.
    pub fn start<C: EvaluationCallback>(self, callback: C) -> SessionHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();

        let id = self.id.clone();
        let runtime = SessionRuntime {
            queue: AudioFrameQueue::with_capacity_limit(self.options.max_queued_chunks),
            scheduler: FrameScheduler::new(self.options.tick_interval, self.options.settle_delay),
            id: self.id,
            params: self.params,
            url_provider: self.url_provider,
            connector: self.connector,
            callback,
            state: State::default(),
            run_state: RunState::default(),
            transport: None,
            event_tx,
            transport_tx,
            warned_full: false,
        };

        let task = tokio::spawn(runtime.run(command_rx, event_rx, transport_rx));

        SessionHandle {
            id,
            commands: command_tx,
            task,
        }
    }
}

#[derive(Debug)]
enum Command {
    Audio(Vec<u8>),
    Stop,
    Disconnect,
}

/// Control surface of a running session
///
/// Dropping the handle without calling [`SessionHandle::wait`] disconnects
/// the session.
#[derive(Debug)]
pub struct SessionHandle {
    id: String,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<SessionOutcome>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue a captured chunk. Ignored unless the session is open and capturing.
    pub fn push_audio(&self, chunk: impl Into<Vec<u8>>) {
        let _ = self.commands.send(Command::Audio(chunk.into()));
    }

    /// Stop capturing. Queued audio is still sent, followed by the last frame.
    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }

    /// Tear the session down immediately
    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the session to reach `Closed` or `Errored`.
    pub async fn wait(self) -> Result<SessionOutcome, IseError> {
        let SessionHandle { commands, task, .. } = self;
        let outcome = task
            .await
            .map_err(|e| IseError::Transport(format!("session task failed: {}", e)));
        drop(commands);
        outcome
    }
}

struct SessionRuntime<C> {
    id: String,
    params: SessionParams,
    url_provider: Arc<dyn UrlProvider>,
    connector: Arc<dyn Connector>,
    callback: C,
    state: State,
    queue: AudioFrameQueue,
    run_state: RunState,
    scheduler: FrameScheduler,
    transport: Option<Box<dyn Transport>>,
    event_tx: mpsc::UnboundedSender<Event>,
    transport_tx: TransportEventSender,
    warned_full: bool,
}

impl<C: EvaluationCallback> SessionRuntime<C> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<Event>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> SessionOutcome {
        log::info!("[{}] Session started", self.id);
        self.dispatch(Event::Start);

        while !self.state.is_terminal() {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Audio(data)) => self.push_audio(data),
                    Some(Command::Stop) => self.dispatch(Event::Stop),
                    // Handle dropped counts as a disconnect
                    Some(Command::Disconnect) | None => self.dispatch(Event::Disconnect),
                },
                Some(event) = events.recv() => self.dispatch(event),
                Some(event) = transport_events.recv() => self.on_transport_event(event),
                _ = self.scheduler.next_tick() => self.on_tick(),
            }
        }

        let outcome = SessionOutcome {
            final_state: self.state.clone(),
            frames_sent: self.scheduler.frames_sent(),
            chunks_dropped: self.queue.dropped(),
        };
        log::info!(
            "[{}] Session ended: {:?} ({} frames sent, {} chunks dropped)",
            self.id,
            outcome.final_state,
            outcome.frames_sent,
            outcome.chunks_dropped
        );
        outcome
    }

    fn dispatch(&mut self, event: Event) {
        log::debug!("[{}] Event: {:?}", self.id, event);

        let old_discriminant = std::mem::discriminant(&self.state);
        let (next, effects) = reduce(&self.state, event);
        if old_discriminant != std::mem::discriminant(&next) {
            log::info!("[{}] State transition: {:?} -> {:?}", self.id, self.state, next);
        }
        self.state = next;

        for effect in effects {
            self.apply(effect);
        }
    }

    fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::ResolveUrl => {
                let provider = Arc::clone(&self.url_provider);
                let tx = self.event_tx.clone();
                tokio::spawn(async move {
                    let event = match provider.connection_url().await {
                        Ok(url) => Event::UrlResolved { url },
                        Err(err) => Event::UrlFailed { err },
                    };
                    let _ = tx.send(event);
                });
            }
            Effect::OpenTransport { url } => {
                // The query string carries the signature
                let endpoint = url.split('?').next().unwrap_or_default();
                log::info!("[{}] Opening transport to {}", self.id, endpoint);
                self.transport = Some(self.connector.open(&url, self.transport_tx.clone()));
            }
            Effect::SetRunning(running) => self.run_state.running = running,
            Effect::ArmScheduler => self.scheduler.arm(),
            Effect::CancelScheduler => self.scheduler.cancel(),
            Effect::CloseTransport => {
                if let Some(mut transport) = self.transport.take() {
                    transport.close();
                }
            }
            Effect::NotifyOpen => self.callback.on_open(),
            Effect::NotifyResult(result) => self.callback.on_result(result),
            Effect::NotifyError(err) => {
                match &err {
                    IseError::Service { code, message, .. } => {
                        log::error!("[{}] Evaluation failed {}:{}", self.id, code, message)
                    }
                    other => log::error!("[{}] Evaluation failed: {}", self.id, other),
                }
                self.callback.on_error(err);
            }
            Effect::NotifyClose => self.callback.on_close(),
        }
    }

    fn push_audio(&mut self, data: Vec<u8>) {
        match self.queue.push(data, self.run_state) {
            PushOutcome::Queued => {}
            PushOutcome::NotRunning => {
                log::debug!("[{}] Session not running, chunk dropped", self.id)
            }
            PushOutcome::Full => {
                if !self.warned_full {
                    self.warned_full = true;
                    log::warn!(
                        "[{}] Audio queue full ({} chunks, {} bytes), dropping new audio",
                        self.id,
                        self.queue.len(),
                        self.queue.memory_bytes()
                    );
                }
            }
        }
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Open => self.dispatch(Event::TransportOpen),
            TransportEvent::Message(text) => match decode(&text) {
                Ok(response) => {
                    if let Some(sid) = response.sid.as_deref() {
                        log::debug!("[{}] Response for sid {} (code {})", self.id, sid, response.code);
                    }
                    if let Some(e) = &response.result_error {
                        log::warn!("[{}] Dropping undecodable result: {}", self.id, e);
                    }
                    let first_frame_sent = self.scheduler.first_frame_sent();
                    self.dispatch(Event::Response {
                        response,
                        first_frame_sent,
                    });
                }
                Err(e) => log::warn!("[{}] Ignoring malformed message: {}", self.id, e),
            },
            TransportEvent::Error(message) => self.dispatch(Event::TransportError { message }),
            TransportEvent::Close => self.dispatch(Event::TransportClosed),
        }
    }

    fn on_tick(&mut self) {
        let outcome = self.scheduler.on_tick(
            self.transport.is_some(),
            &mut self.queue,
            self.run_state,
            &self.params,
        );

        match outcome {
            TickOutcome::Cancelled => {
                log::debug!("[{}] Transport gone, scheduler cancelled", self.id)
            }
            TickOutcome::Starved => log::trace!("[{}] Waiting for encoded audio", self.id),
            TickOutcome::Send { frames, finished } => {
                for frame in frames {
                    let text = match frame.to_json() {
                        Ok(text) => text,
                        Err(e) => {
                            log::error!("[{}] Failed to encode frame: {}", self.id, e);
                            continue;
                        }
                    };
                    if let Some(transport) = self.transport.as_mut() {
                        log::debug!(
                            "[{}] Sending frame status={} ({} bytes)",
                            self.id,
                            frame.status().code(),
                            text.len()
                        );
                        transport.send(text);
                    }
                }
                if finished {
                    log::info!(
                        "[{}] Last frame sent ({} frames total)",
                        self.id,
                        self.scheduler.frames_sent()
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_validation() {
        assert!(SessionOptions::default().validate().is_ok());

        let zero_tick = SessionOptions {
            tick_interval: Duration::ZERO,
            ..SessionOptions::default()
        };
        assert!(matches!(zero_tick.validate(), Err(IseError::Config(_))));

        let zero_cap = SessionOptions {
            max_queued_chunks: Some(0),
            ..SessionOptions::default()
        };
        assert!(matches!(zero_cap.validate(), Err(IseError::Config(_))));
    }

    #[test]
    fn test_from_config_requires_credentials() {
        let config = IseConfig {
            app_id: "app".to_string(),
            ..IseConfig::default()
        };
        assert!(matches!(
            EvaluationSession::from_config(&config, "hello"),
            Err(IseError::Config(_))
        ));
    }

    #[test]
    fn test_from_config_requires_text() {
        let config = IseConfig {
            app_id: "app".to_string(),
            api_key: "key".to_string(),
            api_secret: "secret".to_string(),
            ..IseConfig::default()
        };
        assert!(matches!(
            EvaluationSession::from_config(&config, ""),
            Err(IseError::Config(_))
        ));
    }

    #[test]
    fn test_options_from_config() {
        let config = IseConfig {
            tick_interval_ms: 20,
            settle_delay_ms: 0,
            max_queued_chunks: Some(64),
            ..IseConfig::default()
        };
        let options = SessionOptions::from_config(&config);
        assert_eq!(options.tick_interval, Duration::from_millis(20));
        assert_eq!(options.settle_delay, Duration::ZERO);
        assert_eq!(options.max_queued_chunks, Some(64));
    }

    #[tokio::test]
    async fn test_channel_callback_forwards_in_order() {
        let (mut callback, mut rx) = ChannelCallback::new();
        callback.on_open();
        callback.on_error(IseError::Protocol("x".to_string()));
        callback.on_close();

        assert!(matches!(rx.recv().await, Some(SessionEvent::Opened)));
        assert!(matches!(rx.recv().await, Some(SessionEvent::Error(_))));
        assert!(matches!(rx.recv().await, Some(SessionEvent::Closed)));
    }
}
