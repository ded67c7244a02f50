//! One live conversation with the assistant
//!
//! Wires the microphone into the session and the session's audio into the
//! playback scheduler. Tool-call batches and the end of the session are
//! reported to the controller, tagged with the session's generation.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::protocol::{AssistantConnector, AssistantSession, SessionEvent, SessionSetup};
use crate::Result;
use crate::config::VoiceConfig;
use crate::tools::{ToolCall, ToolResult};
use crate::voice::{
    CaptureStream, EncodedAudio, Microphone, PlaybackScheduler, Speaker, VoiceActivity, codec,
};

/// Encoded frames buffered between the audio thread and the uplink
const FRAME_BUFFER: usize = 32;

/// Why a live session ended on its own
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// The assistant closed the session
    Closed,
    /// The transport failed
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum LiveEventKind {
    ToolCalls(Vec<ToolCall>),
    Ended(EndReason),
}

/// Something a live session reports to its owner
#[derive(Debug, Clone, PartialEq)]
pub struct LiveEvent {
    pub generation: u64,
    pub kind: LiveEventKind,
}

/// Devices and transport a live session is built from
#[derive(Clone)]
pub struct LiveDeps {
    pub connector: Arc<dyn AssistantConnector>,
    pub microphone: Arc<dyn Microphone>,
    pub speaker: Arc<dyn Speaker>,
}

/// An open assistant session with its microphone and speaker
pub struct LiveSession {
    generation: u64,
    session: Arc<dyn AssistantSession>,
    capture: CaptureStream,
    playback: Arc<PlaybackScheduler>,
    activity: Arc<VoiceActivity>,
    uplink: JoinHandle<()>,
    downlink: JoinHandle<()>,
}

impl LiveSession {
    /// Connect, then acquire the speaker and microphone
    ///
    /// Anything acquired before a failure is released again.
    ///
    /// # Errors
    ///
    /// Returns error if the assistant or either device is unavailable
    pub async fn open(
        generation: u64,
        deps: &LiveDeps,
        setup: SessionSetup,
        voice: &VoiceConfig,
        events: mpsc::UnboundedSender<LiveEvent>,
    ) -> Result<Self> {
        let output_rate = setup.output_sample_rate;
        let connection = deps.connector.connect(setup).await?;
        let session = connection.session;

        let output = match deps.speaker.open() {
            Ok(output) => output,
            Err(e) => {
                session.close().await;
                return Err(e);
            }
        };
        let playback = Arc::new(PlaybackScheduler::new(output));

        let activity = Arc::new(VoiceActivity::new(Instant::now()));
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_BUFFER);
        let capture = match CaptureStream::open(
            deps.microphone.as_ref(),
            voice.frame_size,
            voice.voiced_threshold,
            Arc::clone(&activity),
            frames_tx,
        ) {
            Ok(capture) => capture,
            Err(e) => {
                playback.close();
                session.close().await;
                return Err(e);
            }
        };

        let uplink = tokio::spawn(uplink(
            generation,
            Arc::clone(&session),
            frames_rx,
            events.clone(),
        ));
        let downlink = tokio::spawn(downlink(
            generation,
            connection.events,
            Arc::clone(&playback),
            output_rate,
            events,
        ));

        tracing::info!(generation, "live session started");

        Ok(Self {
            generation,
            session,
            capture,
            playback,
            activity,
            uplink,
            downlink,
        })
    }

    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Time since the last voiced microphone frame
    #[must_use]
    pub fn silent_for(&self, now: Instant) -> Duration {
        self.activity.silent_for(now)
    }

    /// Answer a tool-call batch
    ///
    /// # Errors
    ///
    /// Returns error if the session is gone
    pub async fn send_tool_results(&self, results: &[ToolResult]) -> Result<()> {
        self.session.send_tool_results(results).await
    }

    /// Release the microphone, the session, and the speaker
    pub async fn close(mut self) {
        self.capture.close();
        self.uplink.abort();
        self.session.close().await;
        self.downlink.abort();
        self.playback.close();
        tracing::info!(generation = self.generation, "live session released");
    }
}

async fn uplink(
    generation: u64,
    session: Arc<dyn AssistantSession>,
    mut frames: mpsc::Receiver<EncodedAudio>,
    events: mpsc::UnboundedSender<LiveEvent>,
) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = session.send_audio(&frame).await {
            tracing::warn!(generation, error = %e, "failed to stream audio");
            let _ = events.send(LiveEvent {
                generation,
                kind: LiveEventKind::Ended(EndReason::Error(e.to_string())),
            });
            return;
        }
    }
}

async fn downlink(
    generation: u64,
    mut incoming: mpsc::Receiver<SessionEvent>,
    playback: Arc<PlaybackScheduler>,
    output_rate: u32,
    events: mpsc::UnboundedSender<LiveEvent>,
) {
    let reason = loop {
        let Some(event) = incoming.recv().await else {
            break EndReason::Closed;
        };
        match event {
            SessionEvent::Audio(data) => match codec::decode(&data, output_rate, 1) {
                Ok(samples) => {
                    playback.enqueue(samples);
                }
                Err(e) => tracing::debug!(generation, error = %e, "dropping audio chunk"),
            },
            SessionEvent::ToolCalls(calls) => {
                tracing::debug!(generation, count = calls.len(), "tool-call batch received");
                let event = LiveEvent {
                    generation,
                    kind: LiveEventKind::ToolCalls(calls),
                };
                if events.send(event).is_err() {
                    return;
                }
            }
            SessionEvent::Interrupted => playback.hard_stop(),
            SessionEvent::Closed => break EndReason::Closed,
            SessionEvent::Error(message) => break EndReason::Error(message),
        }
    };

    tracing::debug!(generation, ?reason, "assistant session ended");
    let _ = events.send(LiveEvent {
        generation,
        kind: LiveEventKind::Ended(reason),
    });
}
