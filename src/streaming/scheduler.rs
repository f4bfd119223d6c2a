//! Fixed-cadence frame scheduler
//!
//! Turns queued chunks into the three-phase frame protocol. Capture and the
//! network run at different rates, so the scheduler never sends more than one
//! chunk per tick and decides on every tick whether an empty queue means
//! "not yet" or "done".
//!
//! # Timeline
//!
//! ```text
//! open ──settle (500ms)──▶ tick ─40ms─▶ tick ─40ms─▶ tick ─40ms─▶ tick
//!                          first        middle       middle       last
//! ```
//!
//! Raw PCM is captured at the same rate it is sent, so an empty queue is the
//! end of the stream. Compressed audio comes out of the encoder in bursts: an
//! empty queue while capture is still running is only starvation, and the tick
//! is skipped.

use std::time::Duration;

use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use super::audio_queue::{AudioFrameQueue, RunState};
use super::protocol::{ProtocolFrame, SessionParams};

/// What a single tick produced
#[derive(Debug)]
pub enum TickOutcome {
    /// Transport is gone; the timer has been cancelled
    Cancelled,
    /// Compressed audio is not ready yet; try again next tick
    Starved,
    /// Frames to send in order. `finished` means the last frame is among them
    /// and the timer has been cancelled.
    Send {
        frames: Vec<ProtocolFrame>,
        finished: bool,
    },
}

/// Drains the audio queue into protocol frames on a fixed period
#[derive(Debug)]
pub struct FrameScheduler {
    tick_interval: Duration,
    settle_delay: Duration,
    timer: Option<Interval>,
    first_frame_sent: bool,
    finished: bool,
    frames_sent: u64,
}

impl FrameScheduler {
    pub fn new(tick_interval: Duration, settle_delay: Duration) -> Self {
        Self {
            tick_interval,
            settle_delay,
            timer: None,
            first_frame_sent: false,
            finished: false,
            frames_sent: 0,
        }
    }

    /// Start ticking after the settle delay. Must be called inside a tokio runtime.
    pub fn arm(&mut self) {
        if self.finished || self.timer.is_some() {
            return;
        }
        let mut timer = interval_at(Instant::now() + self.settle_delay, self.tick_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.timer = Some(timer);
    }

    pub fn cancel(&mut self) {
        self.timer = None;
    }

    pub fn is_armed(&self) -> bool {
        self.timer.is_some()
    }

    pub fn first_frame_sent(&self) -> bool {
        self.first_frame_sent
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    /// Resolves on the next tick; never resolves while the scheduler is not armed.
    pub async fn next_tick(&mut self) {
        match self.timer.as_mut() {
            Some(timer) => {
                timer.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }

    /// Run one tick against the queue.
    pub fn on_tick(
        &mut self,
        transport_alive: bool,
        queue: &mut AudioFrameQueue,
        run_state: RunState,
        params: &SessionParams,
    ) -> TickOutcome {
        if !transport_alive {
            self.cancel();
            return TickOutcome::Cancelled;
        }

        let frames = match queue.drain_one() {
            Some(chunk) => {
                let frame = if self.first_frame_sent {
                    ProtocolFrame::middle(params.encoding, &chunk.data)
                } else {
                    self.first_frame_sent = true;
                    ProtocolFrame::first(params, &chunk.data)
                };
                vec![frame]
            }
            None if run_state.running && params.encoding.is_compressed() => {
                return TickOutcome::Starved;
            }
            None => {
                let mut frames = Vec::with_capacity(2);
                // Nothing was ever sent: the envelope still has to go first.
                if !self.first_frame_sent {
                    self.first_frame_sent = true;
                    frames.push(ProtocolFrame::first(params, &[]));
                }
                frames.push(ProtocolFrame::last(params.encoding));
                queue.clear();
                self.cancel();
                self.finished = true;
                frames
            }
        };

        self.frames_sent += frames.len() as u64;
        TickOutcome::Send {
            frames,
            finished: self.finished,
        }
    }
}
