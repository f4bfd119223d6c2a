//! Integration tests for evaluation sessions
//!
//! A scripted in-memory connector stands in for the WebSocket: it records
//! every outgoing frame with the (paused) tokio clock and lets each test play
//! the service's side of the conversation.
//!
//! ## Running Tests
//!
//! ### Scripted tests (no credentials needed):
//! ```bash
//! cargo test --test session_integration
//! ```
//!
//! ### Live service test (requires XFYUN_APP_ID, XFYUN_API_KEY, XFYUN_API_SECRET):
//! ```bash
//! cargo test --test session_integration integration_
//! ```
//!
//! Without credentials the live test prints a notice and passes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;

use ise_stream::{
    AudioEncoding, ChannelCallback, Connector, EvaluationSession, FixedUrl, IseError,
    SessionEvent, SessionHandle, SessionOptions, SessionParams, State, Transport,
    TransportEvent, TransportEventSender, UrlProvider,
};

const TEST_URL: &str = "wss://ise.test/v2/open-ise?authorization=abc";

const RESULT_XML: &str = r#"<?xml version="1.0" ?>
<xml_result>
  <read_sentence lan="cn" type="study" version="7,0,0,1024">
    <rec_paper>
      <read_chapter content="你好" except_info="0" is_rejected="false" total_score="82.5" word_count="2">
        <sentence beg_pos="0" content="你好" end_pos="120" total_score="82.5" />
      </read_chapter>
    </rec_paper>
  </read_sentence>
</xml_result>"#;

// ============================================================================
// Scripted transport
// ============================================================================

#[derive(Debug)]
struct SentFrame {
    at: Instant,
    json: Value,
}

impl SentFrame {
    fn status(&self) -> u64 {
        self.json["data"]["status"].as_u64().unwrap()
    }

    fn audio(&self) -> &str {
        self.json["data"]["data"].as_str().unwrap()
    }
}

#[derive(Clone)]
struct ScriptedConnector {
    open_immediately: bool,
    events: Arc<Mutex<Option<TransportEventSender>>>,
    frames: mpsc::UnboundedSender<SentFrame>,
    closes: Arc<AtomicUsize>,
    urls: Arc<Mutex<Vec<String>>>,
}

impl ScriptedConnector {
    fn new(open_immediately: bool) -> (Self, mpsc::UnboundedReceiver<SentFrame>) {
        let (frames, frames_rx) = mpsc::unbounded_channel();
        let connector = Self {
            open_immediately,
            events: Arc::new(Mutex::new(None)),
            frames,
            closes: Arc::new(AtomicUsize::new(0)),
            urls: Arc::new(Mutex::new(Vec::new())),
        };
        (connector, frames_rx)
    }

    /// Wait until the session has asked for a transport
    async fn opened(&self) {
        loop {
            if self.events.lock().unwrap().is_some() {
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    fn emit(&self, event: TransportEvent) {
        let events = self.events.lock().unwrap();
        events
            .as_ref()
            .expect("transport not opened")
            .send(event)
            .unwrap();
    }

    fn respond(&self, body: Value) {
        self.emit(TransportEvent::Message(body.to_string()));
    }

    fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

impl Connector for ScriptedConnector {
    fn open(&self, url: &str, events: TransportEventSender) -> Box<dyn Transport> {
        self.urls.lock().unwrap().push(url.to_string());
        if self.open_immediately {
            events.send(TransportEvent::Open).unwrap();
        }
        *self.events.lock().unwrap() = Some(events);
        Box::new(ScriptedTransport {
            frames: self.frames.clone(),
            closes: Arc::clone(&self.closes),
        })
    }
}

struct ScriptedTransport {
    frames: mpsc::UnboundedSender<SentFrame>,
    closes: Arc<AtomicUsize>,
}

impl Transport for ScriptedTransport {
    fn send(&mut self, text: String) {
        let json = serde_json::from_str(&text).expect("frames are JSON");
        let _ = self.frames.send(SentFrame {
            at: Instant::now(),
            json,
        });
    }

    fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

struct FailingProvider;

#[async_trait]
impl UrlProvider for FailingProvider {
    async fn connection_url(&self) -> Result<String, IseError> {
        Err(IseError::Transport("backend unavailable".to_string()))
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn params(encoding: AudioEncoding) -> SessionParams {
    SessionParams::new("你好", "read_sentence", "test-app")
        .unwrap()
        .with_encoding(encoding)
}

fn session(connector: &ScriptedConnector, encoding: AudioEncoding) -> EvaluationSession {
    EvaluationSession::new(
        params(encoding),
        Arc::new(FixedUrl(TEST_URL.to_string())),
        Arc::new(connector.clone()),
    )
}

fn start(
    connector: &ScriptedConnector,
    encoding: AudioEncoding,
) -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
    let (callback, events) = ChannelCallback::new();
    (session(connector, encoding).start(callback), events)
}

fn result_message(status: i64, xml: &str) -> Value {
    json!({
        "code": 0,
        "message": "success",
        "sid": "ise00001",
        "data": { "status": status, "data": STANDARD.encode(xml) }
    })
}

fn final_message() -> Value {
    json!({ "code": 0, "message": "success", "sid": "ise00001", "data": { "status": 2 } })
}

fn chunk(byte: u8) -> Vec<u8> {
    vec![byte; 1280]
}

async fn expect_opened(events: &mut mpsc::UnboundedReceiver<SessionEvent>) {
    match events.recv().await {
        Some(SessionEvent::Opened) => {}
        other => panic!("Expected Opened, got {:?}", other),
    }
}

async fn recv_frames(frames: &mut mpsc::UnboundedReceiver<SentFrame>, n: usize) -> Vec<SentFrame> {
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(frames.recv().await.expect("frame"));
    }
    out
}

// ============================================================================
// Frame sequencing
// ============================================================================

#[tokio::test(start_paused = true)]
async fn raw_stream_sends_first_middle_last_on_tick_cadence() {
    let (connector, mut frames) = ScriptedConnector::new(true);
    let (handle, mut events) = start(&connector, AudioEncoding::Raw);

    expect_opened(&mut events).await;
    let opened_at = Instant::now();

    handle.push_audio(chunk(1));
    handle.push_audio(chunk(2));
    handle.push_audio(chunk(3));
    handle.stop();

    let sent = recv_frames(&mut frames, 4).await;
    let statuses: Vec<u64> = sent.iter().map(SentFrame::status).collect();
    assert_eq!(statuses, vec![0, 1, 1, 2]);

    // First frame: envelope, BOM-prefixed text, first chunk
    let first = &sent[0].json;
    assert_eq!(first["common"]["app_id"], "test-app");
    assert_eq!(first["business"]["cmd"], "ssb");
    assert_eq!(first["business"]["aus"], 1);
    assert_eq!(first["business"]["text"], "\u{FEFF}你好");
    assert_eq!(first["business"]["category"], "read_sentence");
    assert_eq!(sent[0].audio(), STANDARD.encode(chunk(1)));

    // Middle frames: audio only
    for (frame, byte) in sent[1..3].iter().zip([2u8, 3]) {
        assert!(frame.json.get("common").is_none());
        assert!(frame.json["business"].get("text").is_none());
        assert_eq!(frame.json["business"]["cmd"], "auw");
        assert_eq!(frame.json["business"]["aus"], 2);
        assert_eq!(frame.audio(), STANDARD.encode(chunk(byte)));
    }

    // Last frame: no audio
    assert_eq!(sent[3].json["business"]["aus"], 4);
    assert_eq!(sent[3].audio(), "");

    // Settle delay, then one frame per tick
    assert_eq!(sent[0].at - opened_at, Duration::from_millis(500));
    for pair in sent.windows(2) {
        assert_eq!(pair[1].at - pair[0].at, Duration::from_millis(40));
    }

    connector.respond(result_message(2, RESULT_XML));
    match events.recv().await {
        Some(SessionEvent::Result(result)) => {
            assert_eq!(result.total_score(), Some(82.5));
            assert_eq!(result.content(), Some("你好"));
            assert!(!result.is_rejected());
        }
        other => panic!("Expected Result, got {:?}", other),
    }
    assert!(matches!(events.recv().await, Some(SessionEvent::Closed)));
    assert!(events.recv().await.is_none());

    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.final_state, State::Closed);
    assert_eq!(outcome.frames_sent, 4);
    assert_eq!(outcome.chunks_dropped, 0);
    assert_eq!(connector.close_count(), 1);
    assert_eq!(connector.urls(), vec![TEST_URL.to_string()]);
}

#[tokio::test(start_paused = true)]
async fn compressed_audio_waits_through_starvation() {
    let (connector, mut frames) = ScriptedConnector::new(true);
    let (handle, mut events) = start(&connector, AudioEncoding::Lame);
    expect_opened(&mut events).await;

    // Several ticks with nothing encoded yet
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(frames.try_recv().is_err());

    handle.push_audio(chunk(7));
    handle.push_audio(chunk(8));
    let sent = recv_frames(&mut frames, 2).await;
    assert_eq!(sent[0].status(), 0);
    assert_eq!(sent[1].status(), 1);
    assert_eq!(sent[0].json["business"]["aue"], "lame");
    assert_eq!(sent[0].json["data"]["encoding"], "lame");

    // Starved again while capture keeps running
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(frames.try_recv().is_err());

    handle.stop();
    let last = frames.recv().await.unwrap();
    assert_eq!(last.status(), 2);

    connector.respond(final_message());
    assert!(matches!(events.recv().await, Some(SessionEvent::Closed)));
    assert_eq!(handle.wait().await.unwrap().frames_sent, 3);
}

#[tokio::test(start_paused = true)]
async fn raw_stream_ends_when_queue_runs_dry() {
    let (connector, mut frames) = ScriptedConnector::new(true);
    let (handle, mut events) = start(&connector, AudioEncoding::Raw);
    expect_opened(&mut events).await;

    handle.push_audio(chunk(1));
    let sent = recv_frames(&mut frames, 2).await;
    assert_eq!(sent[0].status(), 0);
    assert_eq!(sent[1].status(), 2);

    // Capture is still running but the stream is over
    handle.push_audio(chunk(2));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(frames.try_recv().is_err());

    handle.disconnect();
    assert!(matches!(events.recv().await, Some(SessionEvent::Closed)));
    handle.wait().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn stop_before_open_sends_first_and_last_only() {
    let (connector, mut frames) = ScriptedConnector::new(false);
    let (handle, mut events) = start(&connector, AudioEncoding::Raw);

    handle.stop();
    handle.push_audio(chunk(1));

    connector.opened().await;
    connector.emit(TransportEvent::Open);
    expect_opened(&mut events).await;

    let sent = recv_frames(&mut frames, 2).await;
    assert_eq!(sent[0].status(), 0);
    assert_eq!(sent[1].status(), 2);
    assert_eq!(sent[0].audio(), "");
    assert_eq!(sent[0].json["business"]["text"], "\u{FEFF}你好");
    assert_eq!(sent[0].at, sent[1].at);

    connector.respond(final_message());
    assert!(matches!(events.recv().await, Some(SessionEvent::Closed)));

    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.frames_sent, 2);
    assert_eq!(outcome.chunks_dropped, 1);
}

#[tokio::test(start_paused = true)]
async fn audio_pushed_before_open_is_dropped() {
    let (connector, mut frames) = ScriptedConnector::new(false);
    let (handle, mut events) = start(&connector, AudioEncoding::Raw);

    handle.push_audio(chunk(1));

    connector.opened().await;
    connector.emit(TransportEvent::Open);
    expect_opened(&mut events).await;

    handle.push_audio(chunk(2));
    handle.stop();

    let sent = recv_frames(&mut frames, 2).await;
    assert_eq!(sent[0].audio(), STANDARD.encode(chunk(2)));
    assert_eq!(sent[1].status(), 2);

    handle.disconnect();
    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.chunks_dropped, 1);
}

#[tokio::test(start_paused = true)]
async fn queue_cap_drops_excess_chunks() {
    let (connector, mut frames) = ScriptedConnector::new(true);
    let options = SessionOptions {
        max_queued_chunks: Some(2),
        ..SessionOptions::default()
    };
    let (callback, mut events) = ChannelCallback::new();
    let handle = session(&connector, AudioEncoding::Raw)
        .with_options(options)
        .unwrap()
        .start(callback);
    expect_opened(&mut events).await;

    for byte in 1..=4 {
        handle.push_audio(chunk(byte));
    }
    handle.stop();

    let sent = recv_frames(&mut frames, 3).await;
    let statuses: Vec<u64> = sent.iter().map(SentFrame::status).collect();
    assert_eq!(statuses, vec![0, 1, 2]);
    assert_eq!(sent[1].audio(), STANDARD.encode(chunk(2)));

    connector.respond(final_message());
    assert!(matches!(events.recv().await, Some(SessionEvent::Closed)));
    assert_eq!(handle.wait().await.unwrap().chunks_dropped, 2);
}

// ============================================================================
// Responses and teardown
// ============================================================================

#[tokio::test(start_paused = true)]
async fn results_arrive_before_close_and_nothing_is_sent_after() {
    let (connector, mut frames) = ScriptedConnector::new(true);
    let (handle, mut events) = start(&connector, AudioEncoding::Raw);
    expect_opened(&mut events).await;

    for byte in 0..10 {
        handle.push_audio(chunk(byte));
    }
    recv_frames(&mut frames, 2).await;

    connector.respond(result_message(1, RESULT_XML));
    connector.respond(result_message(2, RESULT_XML));

    assert!(matches!(events.recv().await, Some(SessionEvent::Result(_))));
    assert!(matches!(events.recv().await, Some(SessionEvent::Result(_))));
    assert!(matches!(events.recv().await, Some(SessionEvent::Closed)));
    assert!(events.recv().await.is_none());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(frames.try_recv().is_err());
    assert_eq!(connector.close_count(), 1);
    assert_eq!(handle.wait().await.unwrap().final_state, State::Closed);
}

#[tokio::test(start_paused = true)]
async fn service_error_carries_raw_payload() {
    let (connector, mut frames) = ScriptedConnector::new(true);
    let (handle, mut events) = start(&connector, AudioEncoding::Raw);
    expect_opened(&mut events).await;

    handle.push_audio(chunk(1));
    handle.push_audio(chunk(2));
    frames.recv().await.unwrap();

    let body = json!({ "code": 10163, "message": "param validate error", "sid": "ise00002" });
    connector.respond(body.clone());

    match events.recv().await {
        Some(SessionEvent::Error(IseError::Service { code, message, raw })) => {
            assert_eq!(code, 10163);
            assert_eq!(message, "param validate error");
            assert_eq!(raw, body);
        }
        other => panic!("Expected Service error, got {:?}", other),
    }
    // No close notification after an error
    assert!(events.recv().await.is_none());

    assert_eq!(connector.close_count(), 1);
    assert_eq!(handle.wait().await.unwrap().final_state, State::Errored);
}

#[tokio::test(start_paused = true)]
async fn intermediate_result_then_bare_final_status() {
    let (connector, mut frames) = ScriptedConnector::new(true);
    let (handle, mut events) = start(&connector, AudioEncoding::Raw);
    expect_opened(&mut events).await;

    handle.push_audio(chunk(1));
    handle.stop();
    recv_frames(&mut frames, 2).await;

    connector.respond(result_message(1, RESULT_XML));
    connector.respond(final_message());

    match events.recv().await {
        Some(SessionEvent::Result(result)) => assert_eq!(result.total_score(), Some(82.5)),
        other => panic!("Expected Result, got {:?}", other),
    }
    assert!(matches!(events.recv().await, Some(SessionEvent::Closed)));
    // Exactly one result, no error
    assert!(events.recv().await.is_none());

    assert_eq!(connector.close_count(), 1);
    assert_eq!(handle.wait().await.unwrap().final_state, State::Closed);
}

#[tokio::test(start_paused = true)]
async fn error_code_with_undecodable_payload_still_errors() {
    let (connector, mut frames) = ScriptedConnector::new(true);
    let (handle, mut events) = start(&connector, AudioEncoding::Raw);
    expect_opened(&mut events).await;

    handle.push_audio(chunk(1));
    handle.push_audio(chunk(2));
    frames.recv().await.unwrap();

    let body = json!({
        "code": 10163,
        "message": "param validate error",
        "data": { "status": 2, "data": "not-base64!!" }
    });
    connector.respond(body.clone());

    match events.recv().await {
        Some(SessionEvent::Error(IseError::Service { code, raw, .. })) => {
            assert_eq!(code, 10163);
            assert_eq!(raw, body);
        }
        other => panic!("Expected Service error, got {:?}", other),
    }
    assert!(events.recv().await.is_none());
    assert_eq!(connector.close_count(), 1);
    assert_eq!(handle.wait().await.unwrap().final_state, State::Errored);
}

#[tokio::test(start_paused = true)]
async fn final_status_with_undecodable_payload_still_closes() {
    let (connector, mut frames) = ScriptedConnector::new(true);
    let (handle, mut events) = start(&connector, AudioEncoding::Raw);
    expect_opened(&mut events).await;

    handle.stop();
    recv_frames(&mut frames, 2).await;

    connector.respond(result_message(2, "<other/>"));

    assert!(matches!(events.recv().await, Some(SessionEvent::Closed)));
    assert!(events.recv().await.is_none());
    assert_eq!(connector.close_count(), 1);
    assert_eq!(handle.wait().await.unwrap().final_state, State::Closed);
}

#[tokio::test(start_paused = true)]
async fn malformed_messages_are_ignored() {
    let (connector, mut frames) = ScriptedConnector::new(true);
    let (handle, mut events) = start(&connector, AudioEncoding::Raw);
    expect_opened(&mut events).await;

    handle.stop();
    recv_frames(&mut frames, 2).await;

    connector.emit(TransportEvent::Message("not json".to_string()));
    connector.respond(final_message());

    assert!(matches!(events.recv().await, Some(SessionEvent::Closed)));
    assert_eq!(handle.wait().await.unwrap().final_state, State::Closed);
}

#[tokio::test(start_paused = true)]
async fn terminal_response_before_first_frame_is_a_protocol_error() {
    let (connector, mut frames) = ScriptedConnector::new(true);
    let (handle, mut events) = start(&connector, AudioEncoding::Raw);
    expect_opened(&mut events).await;

    connector.respond(final_message());

    assert!(matches!(
        events.recv().await,
        Some(SessionEvent::Error(IseError::Protocol(_)))
    ));
    assert!(events.recv().await.is_none());
    assert!(frames.try_recv().is_err());
    assert_eq!(connector.close_count(), 1);
    assert_eq!(handle.wait().await.unwrap().final_state, State::Errored);
}

#[tokio::test(start_paused = true)]
async fn transport_error_ends_session() {
    let (connector, _frames) = ScriptedConnector::new(true);
    let (handle, mut events) = start(&connector, AudioEncoding::Raw);
    expect_opened(&mut events).await;

    connector.emit(TransportEvent::Error("connection reset".to_string()));

    match events.recv().await {
        Some(SessionEvent::Error(IseError::Transport(msg))) => {
            assert!(msg.contains("connection reset"))
        }
        other => panic!("Expected Transport error, got {:?}", other),
    }
    assert!(events.recv().await.is_none());
    assert_eq!(connector.close_count(), 1);
    assert_eq!(handle.wait().await.unwrap().final_state, State::Errored);
}

#[tokio::test(start_paused = true)]
async fn remote_close_ends_session() {
    let (connector, _frames) = ScriptedConnector::new(true);
    let (handle, mut events) = start(&connector, AudioEncoding::Raw);
    expect_opened(&mut events).await;

    connector.emit(TransportEvent::Close);

    assert!(matches!(events.recv().await, Some(SessionEvent::Closed)));
    assert_eq!(handle.wait().await.unwrap().final_state, State::Closed);
}

#[tokio::test(start_paused = true)]
async fn disconnect_closes_transport() {
    let (connector, mut frames) = ScriptedConnector::new(true);
    let (handle, mut events) = start(&connector, AudioEncoding::Raw);
    expect_opened(&mut events).await;

    handle.push_audio(chunk(1));
    handle.disconnect();

    assert!(matches!(events.recv().await, Some(SessionEvent::Closed)));
    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.final_state, State::Closed);
    assert_eq!(outcome.frames_sent, 0);
    assert!(frames.try_recv().is_err());
    assert_eq!(connector.close_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn dropping_the_handle_disconnects() {
    let (connector, _frames) = ScriptedConnector::new(true);
    let (handle, mut events) = start(&connector, AudioEncoding::Raw);
    expect_opened(&mut events).await;

    drop(handle);

    assert!(matches!(events.recv().await, Some(SessionEvent::Closed)));
    assert!(events.recv().await.is_none());
    assert_eq!(connector.close_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn url_provider_failure_never_opens_transport() {
    let (connector, _frames) = ScriptedConnector::new(true);
    let (callback, mut events) = ChannelCallback::new();
    let handle = EvaluationSession::new(
        params(AudioEncoding::Raw),
        Arc::new(FailingProvider),
        Arc::new(connector.clone()),
    )
    .start(callback);

    match events.recv().await {
        Some(SessionEvent::Error(IseError::Transport(msg))) => {
            assert!(msg.contains("backend unavailable"))
        }
        other => panic!("Expected Transport error, got {:?}", other),
    }
    assert!(connector.urls().is_empty());
    assert_eq!(connector.close_count(), 0);
    assert_eq!(handle.wait().await.unwrap().final_state, State::Errored);
}

// ============================================================================
// Live service
// ============================================================================

/// Live tests need credentials; skip (not fail) without them
fn check_prerequisites(config: &ise_stream::IseConfig) -> bool {
    if config.app_id.is_empty() || config.api_key.is_empty() || config.api_secret.is_empty() {
        eprintln!("Skipping: XFYUN_APP_ID / XFYUN_API_KEY / XFYUN_API_SECRET not set");
        return false;
    }
    true
}

#[tokio::test]
async fn integration_live_silence_is_scored_or_rejected() {
    let _ = dotenvy::dotenv();
    let config = ise_stream::IseConfig::from_env();
    if !check_prerequisites(&config) {
        return;
    }
    let session = EvaluationSession::from_config(&config, "你好").unwrap();
    let (callback, mut events) = ChannelCallback::new();
    let handle = session.start(callback);

    let mut pushed = false;
    let mut saw_outcome = false;
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Opened if !pushed => {
                pushed = true;
                // One second of silence
                for _ in 0..25 {
                    handle.push_audio(chunk(0));
                }
                handle.stop();
            }
            SessionEvent::Result(_) | SessionEvent::Error(_) => saw_outcome = true,
            _ => {}
        }
    }

    assert!(saw_outcome);
    assert!(handle.wait().await.unwrap().final_state.is_terminal());
}
