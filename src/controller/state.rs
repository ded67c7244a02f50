//! Voice mode state machine
//!
//! The transition table is the only place a mode changes. The controller
//! feeds it triggers and acts on the transitions it accepts.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Controller-wide operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Voice features switched off
    #[default]
    Off,
    /// Listening for the wake phrase
    Waiting,
    /// In a live assistant session
    Active,
}

impl Mode {
    /// Returns a human-readable description of the mode
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::Off => "Voice assistant off",
            Self::Waiting => "Listening for the wake phrase",
            Self::Active => "Talking to the assistant",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Off => "OFF",
            Self::Waiting => "WAITING",
            Self::Active => "ACTIVE",
        })
    }
}

/// Something that may move the controller to another mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// User switched voice on
    Start,
    /// User switched voice off
    Stop,
    /// The wake phrase was heard
    WakeDetected,
    /// Recognition could not be started
    ListenerFailed { message: String },
    /// The session or its devices could not be acquired
    SessionFailed { message: String },
    /// The assistant ended the session
    SessionClosed,
    /// The session failed mid-conversation
    SessionError { message: String },
    /// Nobody spoke for too long
    SilenceTimeout,
    /// The assistant asked to end the conversation
    EndSession,
    /// Microphone or recognition access was refused
    PermissionDenied { message: String },
}

/// An accepted mode change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: Mode,
    pub to: Mode,
    pub trigger: Trigger,
}

/// Target mode for `trigger` in `mode`, or `None` if it does not apply
#[must_use]
pub const fn next_mode(mode: Mode, trigger: &Trigger) -> Option<Mode> {
    match (mode, trigger) {
        // OFF
        (Mode::Off, Trigger::Start) => Some(Mode::Waiting),

        // WAITING
        (Mode::Waiting, Trigger::WakeDetected) => Some(Mode::Active),
        (Mode::Waiting, Trigger::ListenerFailed { .. }) => Some(Mode::Off),

        // ACTIVE
        (
            Mode::Active,
            Trigger::SessionFailed { .. }
            | Trigger::SessionClosed
            | Trigger::SessionError { .. }
            | Trigger::SilenceTimeout
            | Trigger::EndSession,
        ) => Some(Mode::Waiting),

        // Either running mode
        (Mode::Waiting | Mode::Active, Trigger::Stop | Trigger::PermissionDenied { .. }) => {
            Some(Mode::Off)
        }

        _ => None,
    }
}

/// Current mode plus when it was entered
#[derive(Debug)]
pub struct StateMachine {
    mode: Mode,
    entered_at: Instant,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            mode: Mode::Off,
            entered_at: Instant::now(),
        }
    }

    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.mode
    }

    /// How long the machine has been in the current mode
    #[must_use]
    pub fn time_in_mode(&self) -> std::time::Duration {
        self.entered_at.elapsed()
    }

    /// Apply `trigger`, returning the transition if the table allows one
    pub fn process(&mut self, trigger: Trigger) -> Option<Transition> {
        let to = next_mode(self.mode, &trigger)?;
        let from = self.mode;
        let in_previous_ms = self.time_in_mode().as_millis();

        self.mode = to;
        self.entered_at = Instant::now();

        tracing::info!(%from, %to, ?trigger, in_previous_ms, "voice mode transition");
        Some(Transition { from, to, trigger })
    }
}
