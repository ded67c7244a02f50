//! Wake word detection
//!
//! Runs a speech recognizer continuously and scans every transcript for the
//! wake phrase. Recognizers that end on their own are restarted for as long
//! as the listener is wanted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::{Error, Result};

/// Delay before restarting after a recognizer error
pub const RESTART_BACKOFF: Duration = Duration::from_millis(500);

/// Why a recognizer reported an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionErrorKind {
    /// Microphone access refused; retrying will not help
    NotAllowed,
    /// Nothing was said before the engine gave up
    NoSpeech,
    /// The recognition backend could not be reached
    Network(String),
    Other(String),
}

/// Output of a running recognizer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    Transcript { text: String, is_final: bool },
    Error(RecognitionErrorKind),
    /// The engine stopped by itself
    Ended,
}

/// A continuous speech recognition engine
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Begin recognition and return its event stream
    ///
    /// # Errors
    ///
    /// Returns error if recognition is unavailable
    async fn start(&self) -> Result<mpsc::Receiver<RecognitionEvent>>;

    /// Stop recognition and release the microphone; safe to call repeatedly
    async fn stop(&self);
}

/// Lower-cased trigger phrase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakePhrase(String);

impl WakePhrase {
    #[must_use]
    pub fn new(phrase: &str) -> Self {
        Self(phrase.to_lowercase().trim().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether a transcript contains the phrase, ignoring case
    #[must_use]
    pub fn matches(&self, transcript: &str) -> bool {
        !self.0.is_empty() && transcript.to_lowercase().contains(&self.0)
    }
}

/// What the listener reports to its owner, at most once per start
#[derive(Debug)]
pub enum WakeSignal {
    Detected,
    /// Recognition cannot continue; the listener has stopped
    Fatal(Error),
}

/// Listens for the wake phrase and restarts its recognizer as needed
pub struct WakeWordListener {
    recognizer: Arc<dyn SpeechRecognizer>,
    phrase: WakePhrase,
    wanted: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WakeWordListener {
    #[must_use]
    pub fn new(recognizer: Arc<dyn SpeechRecognizer>, phrase: WakePhrase) -> Self {
        tracing::debug!(wake_phrase = phrase.as_str(), "wake word listener initialized");
        Self {
            recognizer,
            phrase,
            wanted: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    /// Start listening; `on_wake` runs once when the phrase is heard or
    /// recognition fails for good
    ///
    /// # Errors
    ///
    /// Returns error if the recognizer cannot be started the first time
    pub async fn start<F>(&self, on_wake: F) -> Result<()>
    where
        F: FnOnce(WakeSignal) + Send + 'static,
    {
        if self.is_running() {
            tracing::debug!("wake word listener already running");
            return Ok(());
        }

        self.wanted.store(true, Ordering::SeqCst);
        let events = match self.recognizer.start().await {
            Ok(events) => events,
            Err(e) => {
                self.wanted.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let handle = tokio::spawn(run(
            Arc::clone(&self.recognizer),
            self.phrase.clone(),
            Arc::clone(&self.wanted),
            events,
            on_wake,
        ));

        if let Ok(mut task) = self.task.lock() {
            *task = Some(handle);
        }

        tracing::info!(wake_phrase = self.phrase.as_str(), "listening for wake phrase");
        Ok(())
    }

    /// Stop listening; the recognizer is not restarted afterwards
    pub async fn stop(&self) {
        self.wanted.store(false, Ordering::SeqCst);

        let handle = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }

        self.recognizer.stop().await;
    }

    /// Check if the listener loop is alive
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .map(|t| t.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }
}

enum RunOutcome {
    Detected,
    Fatal(Error),
    Ended { after_error: bool },
}

async fn next_outcome(
    events: &mut mpsc::Receiver<RecognitionEvent>,
    phrase: &WakePhrase,
    wanted: &AtomicBool,
) -> RunOutcome {
    let mut after_error = false;

    while let Some(event) = events.recv().await {
        if !wanted.load(Ordering::SeqCst) {
            break;
        }
        match event {
            RecognitionEvent::Transcript { text, is_final } => {
                tracing::trace!(transcript = %text, is_final, "transcript received");
                if phrase.matches(&text) {
                    tracing::info!(wake_phrase = phrase.as_str(), transcript = %text, "wake phrase detected");
                    return RunOutcome::Detected;
                }
            }
            RecognitionEvent::Error(RecognitionErrorKind::NotAllowed) => {
                return RunOutcome::Fatal(Error::PermissionDenied(
                    "microphone access was denied".to_string(),
                ));
            }
            RecognitionEvent::Error(RecognitionErrorKind::NoSpeech) => {
                tracing::trace!("no speech before recognizer timeout");
            }
            RecognitionEvent::Error(kind) => {
                tracing::warn!(error = ?kind, "recognizer error");
                after_error = true;
            }
            RecognitionEvent::Ended => break,
        }
    }

    RunOutcome::Ended { after_error }
}

async fn run<F>(
    recognizer: Arc<dyn SpeechRecognizer>,
    phrase: WakePhrase,
    wanted: Arc<AtomicBool>,
    mut events: mpsc::Receiver<RecognitionEvent>,
    on_wake: F,
) where
    F: FnOnce(WakeSignal) + Send + 'static,
{
    let signal = loop {
        match next_outcome(&mut events, &phrase, &wanted).await {
            RunOutcome::Detected => break WakeSignal::Detected,
            RunOutcome::Fatal(e) => break WakeSignal::Fatal(e),
            RunOutcome::Ended { after_error } => {
                if after_error {
                    tokio::time::sleep(RESTART_BACKOFF).await;
                }
            }
        }

        // Restart until it works, we are stopped, or it fails for good
        events = loop {
            if !wanted.load(Ordering::SeqCst) {
                tracing::debug!("wake word listener stopped, not restarting");
                return;
            }
            tracing::debug!("recognizer ended, restarting");
            match recognizer.start().await {
                Ok(events) => break events,
                Err(e) if e.is_fatal() => {
                    wanted.store(false, Ordering::SeqCst);
                    on_wake(WakeSignal::Fatal(e));
                    return;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "recognizer restart failed");
                    tokio::time::sleep(RESTART_BACKOFF).await;
                }
            }
        };
    };

    if !wanted.swap(false, Ordering::SeqCst) {
        return;
    }
    recognizer.stop().await;
    on_wake(signal);
}
