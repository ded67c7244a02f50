//! Shared test utilities
//!
//! Fakes for every external collaborator of the voice controller, plus a
//! harness that wires them together.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use tempo_voice::config::{AssistantConfig, VoiceConfig};
use tempo_voice::controller::{ControllerDeps, Mode, VoiceController, VoiceEvent, VoiceHandle};
use tempo_voice::session::{
    AssistantConnector, AssistantSession, Connection, LiveDeps, SessionEvent, SessionSetup,
};
use tempo_voice::tools::ToolResult;
use tempo_voice::voice::{
    AudioOutput, EncodedAudio, InputStream, Microphone, PlaybackHandle, RecognitionErrorKind,
    RecognitionEvent, SampleCallback, Speaker, SpeechRecognizer,
};
use tempo_voice::{DataStore, Error, MemoryStore, Result, SharedState};

/// Ordered record of device and connection activity across fakes
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: &str) {
        self.0.lock().unwrap().push(entry.to_string());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn last_index_of(&self, entry: &str) -> Option<usize> {
        self.entries().iter().rposition(|e| e == entry)
    }

    pub fn first_index_of(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }
}

/// Recognizer whose transcripts are spoken by the test
pub struct FakeRecognizer {
    journal: Journal,
    current: Mutex<Option<mpsc::Sender<RecognitionEvent>>>,
    fail_next_start: Mutex<Option<Error>>,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
}

impl FakeRecognizer {
    pub fn new(journal: Journal) -> Arc<Self> {
        Arc::new(Self {
            journal,
            current: Mutex::new(None),
            fail_next_start: Mutex::new(None),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        })
    }

    pub fn fail_next_start(&self, error: Error) {
        *self.fail_next_start.lock().unwrap() = Some(error);
    }

    pub fn emit(&self, event: RecognitionEvent) -> bool {
        self.current
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|tx| tx.try_send(event).is_ok())
    }

    pub fn say(&self, text: &str) -> bool {
        self.emit(RecognitionEvent::Transcript {
            text: text.to_string(),
            is_final: true,
        })
    }

    pub fn deny(&self) -> bool {
        self.emit(RecognitionEvent::Error(RecognitionErrorKind::NotAllowed))
    }

    pub fn is_running(&self) -> bool {
        self.current.lock().unwrap().is_some()
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechRecognizer for FakeRecognizer {
    async fn start(&self) -> Result<mpsc::Receiver<RecognitionEvent>> {
        if let Some(e) = self.fail_next_start.lock().unwrap().take() {
            return Err(e);
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.journal.record("recognizer.start");
        let (tx, rx) = mpsc::channel(16);
        *self.current.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if self.current.lock().unwrap().take().is_some() {
            self.journal.record("recognizer.stop");
        }
    }
}

/// Microphone fed by the test
pub struct FakeMicrophone {
    journal: Journal,
    callback: Arc<Mutex<Option<SampleCallback>>>,
    deny: AtomicBool,
    pub opens: AtomicUsize,
}

struct FakeInput {
    journal: Journal,
    callback: Arc<Mutex<Option<SampleCallback>>>,
}

impl InputStream for FakeInput {
    fn close(&mut self) {
        if self.callback.lock().unwrap().take().is_some() {
            self.journal.record("mic.close");
        }
    }
}

impl FakeMicrophone {
    pub fn new(journal: Journal) -> Arc<Self> {
        Arc::new(Self {
            journal,
            callback: Arc::new(Mutex::new(None)),
            deny: AtomicBool::new(false),
            opens: AtomicUsize::new(0),
        })
    }

    pub fn deny_access(&self) {
        self.deny.store(true, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.callback.lock().unwrap().is_some()
    }

    /// Deliver samples as the audio thread would
    pub fn push(&self, samples: &[f32]) {
        if let Some(callback) = self.callback.lock().unwrap().as_mut() {
            callback(samples);
        }
    }
}

impl Microphone for FakeMicrophone {
    fn open(&self, on_samples: SampleCallback) -> Result<Box<dyn InputStream>> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(Error::PermissionDenied("microphone blocked".to_string()));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.journal.record("mic.open");
        *self.callback.lock().unwrap() = Some(on_samples);
        Ok(Box::new(FakeInput {
            journal: self.journal.clone(),
            callback: Arc::clone(&self.callback),
        }))
    }
}

/// Output with a clock frozen at zero that records what it was asked to play
#[derive(Default)]
pub struct FakeOutput {
    next: AtomicUsize,
    pub started: Mutex<Vec<(usize, f64)>>,
    pub stopped: Mutex<Vec<PlaybackHandle>>,
    pub closed: AtomicBool,
}

impl AudioOutput for FakeOutput {
    fn now(&self) -> f64 {
        0.0
    }

    fn sample_rate(&self) -> u32 {
        24_000
    }

    fn start_at(&self, samples: Vec<f32>, at: f64) -> PlaybackHandle {
        let id = self.next.fetch_add(1, Ordering::SeqCst);
        self.started.lock().unwrap().push((samples.len(), at));
        id as PlaybackHandle
    }

    fn stop(&self, handle: PlaybackHandle) {
        self.stopped.lock().unwrap().push(handle);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct FakeSpeaker {
    journal: Journal,
    pub outputs: Mutex<Vec<Arc<FakeOutput>>>,
}

impl FakeSpeaker {
    pub fn new(journal: Journal) -> Arc<Self> {
        Arc::new(Self {
            journal,
            outputs: Mutex::new(Vec::new()),
        })
    }

    pub fn last_output(&self) -> Option<Arc<FakeOutput>> {
        self.outputs.lock().unwrap().last().cloned()
    }
}

impl Speaker for FakeSpeaker {
    fn open(&self) -> Result<Arc<dyn AudioOutput>> {
        self.journal.record("speaker.open");
        let output = Arc::new(FakeOutput::default());
        self.outputs.lock().unwrap().push(Arc::clone(&output));
        Ok(output)
    }
}

/// Session that records what the controller sends
#[derive(Default)]
pub struct FakeSession {
    pub audio_frames: AtomicUsize,
    pub results: Mutex<Vec<Vec<ToolResult>>>,
    pub closed: AtomicBool,
}

#[async_trait]
impl AssistantSession for FakeSession {
    async fn send_audio(&self, _audio: &EncodedAudio) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Connection("closed".to_string()));
        }
        self.audio_frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send_tool_results(&self, results: &[ToolResult]) -> Result<()> {
        self.results.lock().unwrap().push(results.to_vec());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Connector whose sessions are driven by the test
pub struct FakeConnector {
    journal: Journal,
    fail: AtomicBool,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
    pub setups: Mutex<Vec<SessionSetup>>,
    pub sessions: Mutex<Vec<Arc<FakeSession>>>,
    server: Mutex<Option<mpsc::Sender<SessionEvent>>>,
}

impl FakeConnector {
    pub fn new(journal: Journal) -> Arc<Self> {
        Arc::new(Self {
            journal,
            fail: AtomicBool::new(false),
            gate: Mutex::new(None),
            setups: Mutex::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
            server: Mutex::new(None),
        })
    }

    pub fn fail_connections(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Hold the next connect until the returned sender fires
    pub fn hold_next_connect(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.gate.lock().unwrap() = Some(rx);
        tx
    }

    pub fn connects(&self) -> usize {
        self.setups.lock().unwrap().len()
    }

    pub fn last_session(&self) -> Option<Arc<FakeSession>> {
        self.sessions.lock().unwrap().last().cloned()
    }

    /// Take the sender for the current session's inbound events
    pub fn server(&self) -> mpsc::Sender<SessionEvent> {
        self.server.lock().unwrap().clone().expect("no session connected")
    }
}

#[async_trait]
impl AssistantConnector for FakeConnector {
    async fn connect(&self, setup: SessionSetup) -> Result<Connection> {
        self.journal.record("connect");
        self.setups.lock().unwrap().push(setup);

        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }

        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Connection("refused".to_string()));
        }

        let session = Arc::new(FakeSession::default());
        self.sessions.lock().unwrap().push(Arc::clone(&session));
        let (tx, rx) = mpsc::channel(32);
        *self.server.lock().unwrap() = Some(tx);

        Ok(Connection {
            session,
            events: rx,
        })
    }
}

/// A running controller plus handles on all its fakes
pub struct Harness {
    pub handle: VoiceHandle,
    pub events: tokio::sync::broadcast::Receiver<VoiceEvent>,
    pub journal: Journal,
    pub recognizer: Arc<FakeRecognizer>,
    pub microphone: Arc<FakeMicrophone>,
    pub speaker: Arc<FakeSpeaker>,
    pub connector: Arc<FakeConnector>,
    pub state: SharedState,
}

pub fn voice_config() -> VoiceConfig {
    VoiceConfig {
        frame_size: 1600,
        silence_timeout: Duration::from_secs(10),
        supervisor_tick: Duration::from_secs(1),
        end_session_grace: Duration::from_secs(1),
        ..VoiceConfig::default()
    }
}

pub fn harness() -> Harness {
    harness_with_store(Arc::new(MemoryStore::default()))
}

pub fn harness_with_store(store: Arc<dyn DataStore>) -> Harness {
    let journal = Journal::default();
    let recognizer = FakeRecognizer::new(journal.clone());
    let microphone = FakeMicrophone::new(journal.clone());
    let speaker = FakeSpeaker::new(journal.clone());
    let connector = FakeConnector::new(journal.clone());
    let state = SharedState::open(store).expect("open state");

    let deps = ControllerDeps {
        recognizer: recognizer.clone(),
        live: LiveDeps {
            connector: connector.clone(),
            microphone: microphone.clone(),
            speaker: speaker.clone(),
        },
        state: state.clone(),
        voice: voice_config(),
        assistant: AssistantConfig::default(),
    };

    let handle = VoiceController::spawn(deps);
    let events = handle.subscribe();

    Harness {
        handle,
        events,
        journal,
        recognizer,
        microphone,
        speaker,
        connector,
        state,
    }
}

/// Poll `condition` until it holds, advancing time in small steps
pub async fn eventually<F: FnMut() -> bool>(mut condition: F) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

/// Wait for `mode`, failing the test if it takes too long
pub async fn reach(handle: &VoiceHandle, mode: Mode) {
    tokio::time::timeout(Duration::from_secs(60), handle.wait_for(mode))
        .await
        .unwrap_or_else(|_| panic!("controller never reached {mode}"));
}

impl Harness {
    /// OFF to WAITING
    pub async fn start_waiting(&self) {
        self.handle.start();
        reach(&self.handle, Mode::Waiting).await;
        let recognizer = Arc::clone(&self.recognizer);
        eventually(move || recognizer.is_running()).await;
    }

    /// OFF to ACTIVE with a connected session
    pub async fn start_active(&self) {
        self.start_waiting().await;
        assert!(self.recognizer.say("hey tempo"));
        reach(&self.handle, Mode::Active).await;
        let microphone = Arc::clone(&self.microphone);
        eventually(move || microphone.is_open()).await;
    }

    /// Drain notifications received so far
    pub fn drain_events(&mut self) -> Vec<VoiceEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    /// Wait for the next batch to be answered
    pub async fn next_batch(&mut self) -> (usize, bool) {
        loop {
            match self.events.recv().await {
                Ok(VoiceEvent::BatchProcessed { calls, committed }) => return (calls, committed),
                Ok(_) => {}
                Err(e) => panic!("event stream failed: {e}"),
            }
        }
    }
}
