//! Voice session controller
//!
//! A single task owns the mode and every voice resource. Requests, wake
//! signals, session events, and timers all arrive through one `select!`
//! loop, so transitions and commits never overlap.
//!
//! Requests that arrive while a transition is in flight wait in the mailbox
//! and are judged against the mode that transition produced: a start while
//! WAITING or ACTIVE is ignored. [`VoiceHandle::stop`] also clears a shared
//! flag before it is queued, so a transition still in flight sees it at its
//! next check and winds down instead of listening again.

mod state;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::Error;
use crate::config::{AssistantConfig, VoiceConfig};
use crate::session::{EndReason, LiveDeps, LiveEvent, LiveEventKind, LiveSession, SessionSetup};
use crate::store::SharedState;
use crate::tools::executor::{is_error, mark_unsaved};
use crate::tools::{BatchOutcome, ToolCall, ToolExecutor};
use crate::voice::{
    RESTART_BACKOFF, SpeechRecognizer, WakePhrase, WakeSignal, WakeWordListener,
};

pub use state::{Mode, StateMachine, Transition, Trigger, next_mode};

/// Buffered notifications per subscriber
const EVENT_CAPACITY: usize = 64;

/// Everything the controller needs from the outside
#[derive(Clone)]
pub struct ControllerDeps {
    pub recognizer: Arc<dyn SpeechRecognizer>,
    pub live: LiveDeps,
    pub state: SharedState,
    pub voice: VoiceConfig,
    pub assistant: AssistantConfig,
}

/// Notifications for whoever presents the voice feature
#[derive(Debug, Clone)]
pub enum VoiceEvent {
    ModeChanged {
        from: Mode,
        to: Mode,
        trigger: Trigger,
    },
    /// A failure the user has to act on
    Fatal(String),
    /// A tool-call batch was answered
    BatchProcessed { calls: usize, committed: bool },
}

enum Command {
    Start,
    Stop,
    Shutdown(oneshot::Sender<()>),
}

struct WakeMessage {
    generation: u64,
    signal: WakeSignal,
}

/// Cloneable handle to a running controller
#[derive(Clone)]
pub struct VoiceHandle {
    commands: mpsc::UnboundedSender<Command>,
    wanted: Arc<AtomicBool>,
    mode: watch::Receiver<Mode>,
    events: broadcast::Sender<VoiceEvent>,
}

impl VoiceHandle {
    /// Ask to switch voice on (OFF to WAITING)
    pub fn start(&self) {
        self.wanted.store(true, Ordering::SeqCst);
        let _ = self.commands.send(Command::Start);
    }

    /// Switch voice off from any mode, releasing every resource
    pub fn stop(&self) {
        self.wanted.store(false, Ordering::SeqCst);
        let _ = self.commands.send(Command::Stop);
    }

    /// Current mode
    #[must_use]
    pub fn mode(&self) -> Mode {
        *self.mode.borrow()
    }

    /// Watch mode changes
    #[must_use]
    pub fn watch_mode(&self) -> watch::Receiver<Mode> {
        self.mode.clone()
    }

    /// Subscribe to controller notifications
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<VoiceEvent> {
        self.events.subscribe()
    }

    /// Wait until the controller reaches `mode`; false if it has shut down
    pub async fn wait_for(&self, mode: Mode) -> bool {
        let mut rx = self.mode.clone();
        rx.wait_for(|m| *m == mode).await.is_ok()
    }

    /// Stop everything and end the controller task
    pub async fn shutdown(&self) {
        self.wanted.store(false, Ordering::SeqCst);
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

/// The controller task's state
pub struct VoiceController {
    machine: StateMachine,
    deps: ControllerDeps,
    listener: WakeWordListener,
    live: Option<LiveSession>,
    wanted: Arc<AtomicBool>,
    generation: u64,
    wake_tx: mpsc::UnboundedSender<WakeMessage>,
    live_tx: mpsc::UnboundedSender<LiveEvent>,
    silence: Option<Interval>,
    end_deadline: Option<Instant>,
    listen_retry: Option<Instant>,
    mode_tx: watch::Sender<Mode>,
    events: broadcast::Sender<VoiceEvent>,
}

impl VoiceController {
    /// Spawn the controller in OFF and return its handle
    #[must_use]
    pub fn spawn(deps: ControllerDeps) -> VoiceHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        let (live_tx, live_rx) = mpsc::unbounded_channel();
        let (mode_tx, mode_rx) = watch::channel(Mode::Off);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let wanted = Arc::new(AtomicBool::new(false));

        let listener = WakeWordListener::new(
            Arc::clone(&deps.recognizer),
            WakePhrase::new(&deps.voice.wake_phrase),
        );

        let controller = Self {
            machine: StateMachine::new(),
            deps,
            listener,
            live: None,
            wanted: Arc::clone(&wanted),
            generation: 0,
            wake_tx,
            live_tx,
            silence: None,
            end_deadline: None,
            listen_retry: None,
            mode_tx,
            events: events.clone(),
        };

        tokio::spawn(controller.run(commands_rx, wake_rx, live_rx));

        VoiceHandle {
            commands: commands_tx,
            wanted,
            mode: mode_rx,
            events,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut wake_rx: mpsc::UnboundedReceiver<WakeMessage>,
        mut live_rx: mpsc::UnboundedReceiver<LiveEvent>,
    ) {
        tracing::debug!("voice controller started");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Start) => self.on_start().await,
                    Some(Command::Stop) => self.on_stop().await,
                    Some(Command::Shutdown(ack)) => {
                        self.on_stop().await;
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        self.on_stop().await;
                        break;
                    }
                },
                Some(message) = wake_rx.recv() => self.on_wake(message).await,
                Some(event) = live_rx.recv() => self.on_live_event(event).await,
                () = next_tick(&mut self.silence) => self.check_silence().await,
                () = sleep_until_opt(self.end_deadline) => {
                    self.end_deadline = None;
                    self.end_active(Trigger::EndSession).await;
                }
                () = sleep_until_opt(self.listen_retry) => {
                    self.listen_retry = None;
                    self.retry_listening().await;
                }
            }
        }

        tracing::debug!("voice controller stopped");
    }

    fn wanted(&self) -> bool {
        self.wanted.load(Ordering::SeqCst)
    }

    fn transition(&mut self, trigger: Trigger) {
        let mode = self.machine.mode();
        match self.machine.process(trigger.clone()) {
            Some(Transition { from, to, trigger }) => {
                self.mode_tx.send_replace(to);
                let _ = self.events.send(VoiceEvent::ModeChanged { from, to, trigger });
            }
            None => tracing::debug!(%mode, ?trigger, "trigger ignored in this mode"),
        }
    }

    fn notify_fatal(&self, error: &Error) {
        tracing::error!(error = %error, "voice assistant stopped");
        let _ = self.events.send(VoiceEvent::Fatal(error.to_string()));
    }

    async fn on_start(&mut self) {
        if self.machine.mode() != Mode::Off {
            tracing::debug!(mode = %self.machine.mode(), "already running, start ignored");
            return;
        }
        if !self.wanted() {
            return;
        }

        self.transition(Trigger::Start);
        self.begin_listening(true).await;
    }

    /// Start the wake word listener; expects WAITING
    ///
    /// Only the start requested by the user may fail back to OFF. Later
    /// restarts retry after a backoff unless access was refused.
    async fn begin_listening(&mut self, initial: bool) {
        self.generation += 1;
        let generation = self.generation;
        let wake_tx = self.wake_tx.clone();

        let started = self
            .listener
            .start(move |signal| {
                let _ = wake_tx.send(WakeMessage { generation, signal });
            })
            .await;

        match started {
            Ok(()) => {
                if !self.wanted() {
                    // A stop is queued behind us; make sure nothing keeps listening
                    self.listener.stop().await;
                }
            }
            Err(e) if e.is_fatal() || initial => {
                self.notify_fatal(&e);
                let message = e.to_string();
                let trigger = if e.is_fatal() {
                    Trigger::PermissionDenied { message }
                } else {
                    Trigger::ListenerFailed { message }
                };
                self.wanted.store(false, Ordering::SeqCst);
                self.transition(trigger);
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    retry_ms = RESTART_BACKOFF.as_millis(),
                    "wake word listener did not restart"
                );
                self.listen_retry = Some(Instant::now() + RESTART_BACKOFF);
            }
        }
    }

    async fn retry_listening(&mut self) {
        if self.machine.mode() != Mode::Waiting || !self.wanted() || self.listener.is_running() {
            return;
        }
        self.begin_listening(false).await;
    }

    async fn on_wake(&mut self, message: WakeMessage) {
        if message.generation != self.generation || self.machine.mode() != Mode::Waiting {
            tracing::debug!(generation = message.generation, "stale wake signal dropped");
            return;
        }

        match message.signal {
            WakeSignal::Detected => self.activate().await,
            WakeSignal::Fatal(e) => {
                self.listener.stop().await;
                self.notify_fatal(&e);
                self.wanted.store(false, Ordering::SeqCst);
                self.transition(Trigger::PermissionDenied {
                    message: e.to_string(),
                });
            }
        }
    }

    /// WAITING to ACTIVE: release the listener, then open the session
    async fn activate(&mut self) {
        self.listener.stop().await;
        if !self.wanted() {
            return;
        }

        self.transition(Trigger::WakeDetected);

        let snapshot = self.deps.state.snapshot().await;
        let today = chrono::Local::now().date_naive();
        let setup = SessionSetup::new(&self.deps.assistant, &snapshot, today);

        self.generation += 1;
        let opened = LiveSession::open(
            self.generation,
            &self.deps.live,
            setup,
            &self.deps.voice,
            self.live_tx.clone(),
        )
        .await;

        match opened {
            Ok(live) => {
                if !self.wanted() {
                    live.close().await;
                    return;
                }
                self.live = Some(live);
                self.start_silence_supervisor();
            }
            Err(e) if e.is_fatal() => {
                self.notify_fatal(&e);
                self.wanted.store(false, Ordering::SeqCst);
                self.transition(Trigger::PermissionDenied {
                    message: e.to_string(),
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not start live session");
                self.end_active(Trigger::SessionFailed {
                    message: e.to_string(),
                })
                .await;
            }
        }
    }

    fn start_silence_supervisor(&mut self) {
        let tick = self.deps.voice.supervisor_tick;
        let mut interval = tokio::time::interval_at(Instant::now() + tick, tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.silence = Some(interval);
    }

    async fn check_silence(&mut self) {
        let Some(live) = &self.live else {
            self.silence = None;
            return;
        };

        let silent = live.silent_for(Instant::now());
        if silent >= self.deps.voice.silence_timeout {
            tracing::info!(silent_secs = silent.as_secs(), "no speech, closing session");
            self.end_active(Trigger::SilenceTimeout).await;
        }
    }

    async fn on_live_event(&mut self, event: LiveEvent) {
        let current = self.live.as_ref().map(LiveSession::generation);
        if current != Some(event.generation) {
            tracing::debug!(generation = event.generation, "stale session event dropped");
            return;
        }

        match event.kind {
            LiveEventKind::ToolCalls(calls) => self.process_batch(calls).await,
            LiveEventKind::Ended(EndReason::Closed) => {
                self.end_active(Trigger::SessionClosed).await;
            }
            LiveEventKind::Ended(EndReason::Error(message)) => {
                tracing::warn!(error = %message, "assistant session failed");
                self.end_active(Trigger::SessionError { message }).await;
            }
        }
    }

    /// Apply one batch to one snapshot, commit once, answer in order
    async fn process_batch(&mut self, calls: Vec<ToolCall>) {
        let (outcome, saved) = self
            .deps
            .state
            .apply(|snapshot| {
                let BatchOutcome {
                    snapshot: next,
                    results,
                    changed,
                    end_session,
                } = ToolExecutor.apply_batch(&calls, std::mem::take(snapshot));
                *snapshot = next;
                (results, changed, end_session)
            })
            .await;
        let (mut results, changed, end_session) = outcome;

        let committed = match saved {
            Ok(committed) => committed,
            Err(e) => {
                tracing::warn!(error = %e, "tool-call batch could not be saved");
                mark_unsaved(&changed, &mut results);
                false
            }
        };

        let failed = results.iter().filter(|r| is_error(r)).count();
        tracing::debug!(
            calls = calls.len(),
            failed,
            committed,
            end_session,
            "tool-call batch processed"
        );
        let _ = self.events.send(VoiceEvent::BatchProcessed {
            calls: calls.len(),
            committed,
        });

        if let Some(live) = &self.live {
            if let Err(e) = live.send_tool_results(&results).await {
                tracing::warn!(error = %e, "failed to send tool results");
            }
        }

        if end_session && self.end_deadline.is_none() {
            self.end_deadline = Some(Instant::now() + self.deps.voice.end_session_grace);
        }
    }

    async fn release_session(&mut self) {
        self.silence = None;
        self.end_deadline = None;
        if let Some(live) = self.live.take() {
            live.close().await;
        }
    }

    /// Leave ACTIVE: release the session, then listen again unless stopped
    async fn end_active(&mut self, trigger: Trigger) {
        if self.machine.mode() != Mode::Active {
            return;
        }

        self.release_session().await;
        self.generation += 1;

        if self.wanted() {
            self.transition(trigger);
            self.begin_listening(false).await;
        } else {
            self.transition(Trigger::Stop);
        }
    }

    async fn on_stop(&mut self) {
        self.listener.stop().await;
        self.release_session().await;
        self.listen_retry = None;
        self.generation += 1;

        if self.machine.mode() != Mode::Off {
            self.transition(Trigger::Stop);
        }
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
