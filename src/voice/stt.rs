//! Speech-to-text for wake phrase recognition
//!
//! [`TranscribingRecognizer`] segments microphone audio by energy and sends
//! each finished utterance to an OpenAI-compatible transcription endpoint.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::CAPTURE_SAMPLE_RATE;
use super::capture::{InputStream, Microphone, rms};
use super::device::samples_to_wav;
use super::wake_word::{RecognitionErrorKind, RecognitionEvent, SpeechRecognizer};
use crate::{Error, Result};

/// Minimum audio energy threshold to consider speech
const ENERGY_THRESHOLD: f32 = 0.03;

/// Minimum duration of speech to transcribe (in samples at 16kHz)
const MIN_SPEECH_SAMPLES: usize = 4800; // 0.3 seconds

/// Silence duration to consider end of utterance (in samples)
const SILENCE_SAMPLES: usize = 8000; // 0.5 seconds

/// Longest utterance sent in one request
const MAX_SPEECH_SAMPLES: usize = CAPTURE_SAMPLE_RATE as usize * 8;

/// How long the recognizer runs without speech before ending itself
const DEFAULT_IDLE_LIMIT: Duration = Duration::from_secs(60);

/// Response from OpenAI Whisper transcription API
#[derive(serde::Deserialize)]
struct WhisperResponse {
    text: String,
}

/// Transcribes speech to text
pub struct SpeechToText {
    client: reqwest::Client,
    url: String,
    api_key: SecretString,
    model: String,
}

impl SpeechToText {
    /// Create a Whisper-compatible STT client
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new(url: String, api_key: SecretString, model: String) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config(
                "an API key is required for transcription".to_string(),
            ));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            url,
            api_key,
            model,
        })
    }

    /// Transcribe audio to text
    ///
    /// # Arguments
    ///
    /// * `audio` - WAV audio bytes
    ///
    /// # Errors
    ///
    /// Returns error if transcription fails
    pub async fn transcribe(&self, audio: &[u8]) -> Result<String> {
        tracing::debug!(audio_bytes = audio.len(), "starting transcription");

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(audio.to_vec())
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Stt(e.to_string()))?,
            )
            .text("model", self.model.clone());

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(self.api_key.expose_secret())
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "transcription request failed");
                e
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, body = %body, "transcription API error");
            return Err(Error::Stt(format!("transcription API error {status}: {body}")));
        }

        let result: WhisperResponse = response.json().await?;

        tracing::debug!(transcript = %result.text, "transcription complete");
        Ok(result.text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmenterState {
    /// Waiting for speech
    Idle,
    /// Speech started, accumulating until silence
    Listening,
}

/// Cuts utterances out of a sample stream using energy
#[derive(Debug)]
pub struct SpeechSegmenter {
    state: SegmenterState,
    speech_buffer: Vec<f32>,
    voiced_samples: usize,
    silence_counter: usize,
}

impl Default for SpeechSegmenter {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeechSegmenter {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: SegmenterState::Idle,
            speech_buffer: Vec::new(),
            voiced_samples: 0,
            silence_counter: 0,
        }
    }

    /// Feed samples; returns an utterance once speech is followed by silence
    pub fn process(&mut self, samples: &[f32]) -> Option<Vec<f32>> {
        let energy = rms(samples);
        let is_speech = energy > ENERGY_THRESHOLD;

        match self.state {
            SegmenterState::Idle => {
                if is_speech {
                    self.state = SegmenterState::Listening;
                    self.speech_buffer.clear();
                    self.speech_buffer.extend_from_slice(samples);
                    self.voiced_samples = samples.len();
                    self.silence_counter = 0;
                    tracing::trace!(energy, "speech detected, listening");
                }
            }
            SegmenterState::Listening => {
                self.speech_buffer.extend_from_slice(samples);

                if is_speech {
                    self.voiced_samples += samples.len();
                    self.silence_counter = 0;
                } else {
                    self.silence_counter += samples.len();
                }

                let complete = self.silence_counter > SILENCE_SAMPLES
                    && self.voiced_samples > MIN_SPEECH_SAMPLES;
                if complete || self.speech_buffer.len() >= MAX_SPEECH_SAMPLES {
                    tracing::debug!(samples = self.speech_buffer.len(), "speech segment complete");
                    let segment = std::mem::take(&mut self.speech_buffer);
                    self.reset();
                    return Some(segment);
                }

                // Too much silence without enough speech
                if self.silence_counter > SILENCE_SAMPLES * 2 {
                    tracing::trace!("timeout - resetting");
                    self.reset();
                }
            }
        }

        None
    }

    /// Check if speech has started and not yet finished
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.state == SegmenterState::Listening
    }

    /// Reset to idle, dropping any partial utterance
    pub fn reset(&mut self) {
        self.state = SegmenterState::Idle;
        self.speech_buffer.clear();
        self.voiced_samples = 0;
        self.silence_counter = 0;
    }
}

struct Running {
    input: Box<dyn InputStream>,
    worker: JoinHandle<()>,
}

/// Microphone plus transcription API as a [`SpeechRecognizer`]
pub struct TranscribingRecognizer {
    microphone: Arc<dyn Microphone>,
    stt: Arc<SpeechToText>,
    idle_limit: Duration,
    running: Mutex<Option<Running>>,
}

impl TranscribingRecognizer {
    #[must_use]
    pub fn new(microphone: Arc<dyn Microphone>, stt: SpeechToText) -> Self {
        Self {
            microphone,
            stt: Arc::new(stt),
            idle_limit: DEFAULT_IDLE_LIMIT,
            running: Mutex::new(None),
        }
    }

    /// End recognition after this long without speech
    #[must_use]
    pub fn with_idle_limit(mut self, idle_limit: Duration) -> Self {
        self.idle_limit = idle_limit;
        self
    }

    fn release(&self) {
        let running = self.running.lock().ok().and_then(|mut r| r.take());
        if let Some(mut running) = running {
            running.worker.abort();
            running.input.close();
            tracing::debug!("recognizer released microphone");
        }
    }
}

#[async_trait]
impl SpeechRecognizer for TranscribingRecognizer {
    async fn start(&self) -> Result<mpsc::Receiver<RecognitionEvent>> {
        self.release();

        let (events_tx, events_rx) = mpsc::channel(16);
        let (samples_tx, samples_rx) = mpsc::unbounded_channel::<Vec<f32>>();

        let input = match self.microphone.open(Box::new(move |data: &[f32]| {
            let _ = samples_tx.send(data.to_vec());
        })) {
            Ok(input) => input,
            Err(e) if e.is_fatal() => {
                tracing::warn!(error = %e, "microphone access denied");
                let denied = RecognitionEvent::Error(RecognitionErrorKind::NotAllowed);
                let _ = events_tx.try_send(denied);
                return Ok(events_rx);
            }
            Err(e) => return Err(Error::Recognition(e.to_string())),
        };

        let worker = tokio::spawn(transcribe_loop(
            Arc::clone(&self.stt),
            samples_rx,
            events_tx,
            self.idle_limit,
        ));

        if let Ok(mut running) = self.running.lock() {
            *running = Some(Running { input, worker });
        }

        tracing::debug!("speech recognition started");
        Ok(events_rx)
    }

    async fn stop(&self) {
        self.release();
    }
}

async fn transcribe_loop(
    stt: Arc<SpeechToText>,
    mut samples: mpsc::UnboundedReceiver<Vec<f32>>,
    events: mpsc::Sender<RecognitionEvent>,
    idle_limit: Duration,
) {
    let mut segmenter = SpeechSegmenter::new();
    let mut idle_deadline = Instant::now() + idle_limit;

    loop {
        let chunk = match tokio::time::timeout_at(idle_deadline, samples.recv()).await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(_) => {
                tracing::debug!("no speech for a while, ending recognition");
                break;
            }
        };

        if segmenter.is_listening() {
            idle_deadline = Instant::now() + idle_limit;
        }

        let Some(segment) = segmenter.process(&chunk) else {
            continue;
        };

        let event = match samples_to_wav(&segment, CAPTURE_SAMPLE_RATE) {
            Ok(wav) => match stt.transcribe(&wav).await {
                Ok(text) => RecognitionEvent::Transcript {
                    text,
                    is_final: true,
                },
                Err(Error::Http(e)) => {
                    RecognitionEvent::Error(RecognitionErrorKind::Network(e.to_string()))
                }
                Err(e) => RecognitionEvent::Error(RecognitionErrorKind::Other(e.to_string())),
            },
            Err(e) => RecognitionEvent::Error(RecognitionErrorKind::Other(e.to_string())),
        };

        if events.send(event).await.is_err() {
            return;
        }
        idle_deadline = Instant::now() + idle_limit;
    }

    let _ = events.send(RecognitionEvent::Ended).await;
}
