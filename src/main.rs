use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use ise_stream::audio::WavSource;
use ise_stream::{
    load_config, BackendUrlProvider, ChannelCallback, EvaluationSession, IseConfig,
    SessionEvent, SessionOptions, SessionParams, WsConnector,
};

#[derive(Parser)]
#[command(name = "ise-stream", about = "Stream a WAV file to the speech evaluation service")]
struct Cli {
    /// 16kHz mono 16-bit WAV file
    wav: PathBuf,

    /// Reference text the speaker was reading
    text: String,

    /// JSON config file (defaults to XFYUN_* environment variables)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Fetch the signed URL from this endpoint instead of signing locally
    #[arg(long)]
    backend: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for development convenience)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path),
        None => IseConfig::from_env(),
    };

    let source = WavSource::open(&cli.wav)
        .with_context(|| format!("failed to load audio from {:?}", cli.wav))?;
    log::info!(
        "Loaded {:?}: {}ms, {} chunks",
        cli.wav,
        source.duration_ms(),
        source.remaining_chunks()
    );

    let session = match &cli.backend {
        Some(endpoint) => {
            let params = SessionParams::from_config(&config, cli.text.clone())?;
            EvaluationSession::new(
                params,
                Arc::new(BackendUrlProvider::new(endpoint.clone())?),
                Arc::new(WsConnector::new()),
            )
            .with_options(SessionOptions::from_config(&config))?
        }
        None => EvaluationSession::from_config(&config, cli.text.clone())?,
    };

    let (callback, mut events) = ChannelCallback::new();
    let handle = session.start(callback);

    // Feed the file at capture pace once the session is open
    let mut source = Some(source);
    let mut open = false;
    let mut pacer = tokio::time::interval(config.tick_interval());

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SessionEvent::Opened) => {
                    log::info!("Session {} open", handle.id());
                    open = true;
                }
                Some(SessionEvent::Result(result)) => match result.total_score() {
                    Some(score) => println!("total_score: {:.2}", score),
                    None => println!("result without total score"),
                },
                Some(SessionEvent::Error(err)) => {
                    eprintln!("evaluation failed: {}", err);
                    if let Some(raw) = err.raw_payload() {
                        eprintln!("{}", raw);
                    }
                }
                Some(SessionEvent::Closed) | None => break,
            },
            _ = pacer.tick(), if open && source.is_some() => {
                match source.as_mut().and_then(Iterator::next) {
                    Some(chunk) => handle.push_audio(chunk),
                    None => {
                        source = None;
                        handle.stop();
                    }
                }
            }
        }
    }

    let outcome = handle.wait().await?;
    println!(
        "session ended: {:?} ({} frames sent, {} chunks dropped)",
        outcome.final_state, outcome.frames_sent, outcome.chunks_dropped
    );
    Ok(())
}
