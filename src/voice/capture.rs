//! Audio capture from microphone
//!
//! Raw device samples are cut into fixed-size frames. Each frame is measured,
//! stamped as voiced when loud enough, encoded, and pushed to the bound sink.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use super::codec::{self, EncodedAudio};
use crate::Result;

/// Receives raw device samples on the audio thread
pub type SampleCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// Where encoded frames go while a session is bound
pub type FrameSink = mpsc::Sender<EncodedAudio>;

/// An open input device
pub trait InputStream: Send + Sync {
    /// Release the device; no samples are delivered after this returns
    fn close(&mut self);
}

/// Source of microphone samples at [`super::CAPTURE_SAMPLE_RATE`], mono
pub trait Microphone: Send + Sync {
    /// Open the input device and start delivering samples to `on_samples`
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::PermissionDenied`] when access is refused,
    /// otherwise [`crate::Error::Audio`]
    fn open(&self, on_samples: SampleCallback) -> Result<Box<dyn InputStream>>;
}

/// A fixed-length block of captured samples
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub captured_at: Instant,
    pub rms: f32,
    pub voiced: bool,
}

/// Calculate RMS energy of audio samples
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Cuts a continuous sample stream into frames of `frame_size`
#[derive(Debug)]
pub struct Framer {
    frame_size: usize,
    voiced_threshold: f32,
    pending: Vec<f32>,
}

impl Framer {
    #[must_use]
    pub fn new(frame_size: usize, voiced_threshold: f32) -> Self {
        Self {
            frame_size: frame_size.max(1),
            voiced_threshold,
            pending: Vec::with_capacity(frame_size),
        }
    }

    /// Feed samples and collect every frame they complete
    pub fn push(&mut self, samples: &[f32]) -> Vec<AudioFrame> {
        let mut frames = Vec::new();
        let mut rest = samples;

        while !rest.is_empty() {
            let take = (self.frame_size - self.pending.len()).min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if self.pending.len() == self.frame_size {
                let samples = std::mem::replace(
                    &mut self.pending,
                    Vec::with_capacity(self.frame_size),
                );
                let level = rms(&samples);
                frames.push(AudioFrame {
                    samples,
                    captured_at: Instant::now(),
                    rms: level,
                    voiced: level > self.voiced_threshold,
                });
            }
        }

        frames
    }
}

/// Time of the most recent voiced frame, shared with the silence supervisor
#[derive(Debug)]
pub struct VoiceActivity {
    last_voiced: Mutex<Instant>,
}

impl VoiceActivity {
    /// Start tracking as if a voiced frame arrived at `now`
    #[must_use]
    pub fn new(now: Instant) -> Self {
        Self {
            last_voiced: Mutex::new(now),
        }
    }

    /// Record a voiced frame
    pub fn mark_voiced(&self, at: Instant) {
        if let Ok(mut last) = self.last_voiced.lock() {
            if at > *last {
                *last = at;
            }
        }
    }

    /// How long since the last voiced frame
    #[must_use]
    pub fn silent_for(&self, now: Instant) -> Duration {
        self.last_voiced
            .lock()
            .map(|last| now.saturating_duration_since(*last))
            .unwrap_or_default()
    }
}

/// Microphone bound to a frame sink
pub struct CaptureStream {
    input: Option<Box<dyn InputStream>>,
    sink: Arc<Mutex<Option<FrameSink>>>,
}

impl CaptureStream {
    /// Open the microphone and start forwarding encoded frames to `sink`
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot be opened
    pub fn open(
        microphone: &dyn Microphone,
        frame_size: usize,
        voiced_threshold: f32,
        activity: Arc<VoiceActivity>,
        sink: FrameSink,
    ) -> Result<Self> {
        let sink = Arc::new(Mutex::new(Some(sink)));
        let callback_sink = Arc::clone(&sink);
        let mut framer = Framer::new(frame_size, voiced_threshold);

        let input = microphone.open(Box::new(move |data: &[f32]| {
            // Held for the whole delivery so close() cannot interleave
            let Ok(guard) = callback_sink.lock() else {
                return;
            };
            let Some(sink) = guard.as_ref() else {
                return;
            };

            for frame in framer.push(data) {
                if frame.voiced {
                    activity.mark_voiced(frame.captured_at);
                }
                tracing::trace!(rms = frame.rms, voiced = frame.voiced, "frame captured");
                if sink.try_send(codec::encode(&frame.samples)).is_err() {
                    tracing::trace!("frame sink full or closed, dropping frame");
                }
            }
        }))?;

        tracing::debug!(frame_size, "capture stream opened");

        Ok(Self {
            input: Some(input),
            sink,
        })
    }

    /// Release the microphone; no frames are delivered after this returns
    pub fn close(&mut self) {
        if let Ok(mut sink) = self.sink.lock() {
            sink.take();
        }
        if let Some(mut input) = self.input.take() {
            input.close();
            tracing::debug!("capture stream closed");
        }
    }

    /// Check if the device is still held
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.input.is_some()
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        self.close();
    }
}
