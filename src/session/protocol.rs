//! Remote assistant primitives
//!
//! The controller only needs to connect, stream audio out, answer tool calls,
//! and hear about audio, tool-call batches, and the session ending. Anything
//! that offers these can stand in for the transport.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::Result;
use crate::config::AssistantConfig;
use crate::model::DataSnapshot;
use crate::tools::{self, ToolCall, ToolResult};
use crate::voice::EncodedAudio;

/// Everything the assistant is told when a session opens
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSetup {
    pub model: String,
    pub voice: String,
    pub instructions: String,
    pub tools: Vec<Value>,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
}

impl SessionSetup {
    /// Build the setup for a session opened on `today`
    #[must_use]
    pub fn new(config: &AssistantConfig, snapshot: &DataSnapshot, today: NaiveDate) -> Self {
        Self {
            model: config.model.clone(),
            voice: config.voice.clone(),
            instructions: instructions(snapshot, today),
            tools: tools::declarations(),
            input_sample_rate: config.input_sample_rate,
            output_sample_rate: config.output_sample_rate,
        }
    }
}

/// System instructions describing the planner as it is right now
#[must_use]
pub fn instructions(snapshot: &DataSnapshot, today: NaiveDate) -> String {
    let mut text = format!(
        "You are Tempo, a voice assistant for a project and task planner. \
         Today is {} ({}). Keep spoken answers short. Use the tools to change \
         projects, tasks and the calendar, and call endSession when the user \
         is finished.",
        today.format(tools::DATE_FORMAT),
        today.format("%A"),
    );

    if snapshot.projects.is_empty() {
        text.push_str("\nThere are no projects yet.");
    } else {
        text.push_str("\nProjects:");
        for project in &snapshot.projects {
            text.push_str(&format!("\n- {} ({} tasks)", project.name, project.tasks.len()));
        }
    }

    if let Some(project) = snapshot.selected_project() {
        text.push_str(&format!("\nThe selected project is {}.", project.name));
    }

    text
}

/// Something the assistant sent or did
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Base64 PCM16 audio at the configured output rate
    Audio(String),
    /// One batch of tool calls, to be answered as a whole
    ToolCalls(Vec<ToolCall>),
    /// The user talked over the assistant; drop queued speech
    Interrupted,
    /// The session ended normally
    Closed,
    /// The session failed
    Error(String),
}

/// An open assistant session
#[async_trait]
pub trait AssistantSession: Send + Sync {
    /// Stream one encoded microphone frame
    ///
    /// # Errors
    ///
    /// Returns error if the session is gone
    async fn send_audio(&self, audio: &EncodedAudio) -> Result<()>;

    /// Answer a tool-call batch, in call order
    ///
    /// # Errors
    ///
    /// Returns error if the session is gone
    async fn send_tool_results(&self, results: &[ToolResult]) -> Result<()>;

    /// Close the session; safe to call more than once
    async fn close(&self);
}

/// A session plus the events it produces
pub struct Connection {
    pub session: Arc<dyn AssistantSession>,
    pub events: mpsc::Receiver<SessionEvent>,
}

/// Opens assistant sessions
#[async_trait]
pub trait AssistantConnector: Send + Sync {
    /// Connect and send `setup`
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Connection`] if the assistant is unreachable
    async fn connect(&self, setup: SessionSetup) -> Result<Connection>;
}

/// Tool call as it appears on the wire
#[derive(Debug, Clone, Deserialize)]
pub struct WireToolCall {
    pub id: String,
    pub name: String,
    /// A JSON object, or a string holding one
    #[serde(default)]
    pub arguments: Value,
}

impl WireToolCall {
    /// Validate into a typed call
    #[must_use]
    pub fn into_call(self) -> ToolCall {
        let arguments = match self.arguments {
            Value::String(raw) => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
            other => other,
        };
        ToolCall::new(self.id, self.name, &arguments)
    }
}

/// Validate a whole batch, keeping its order
#[must_use]
pub fn parse_batch(calls: Vec<WireToolCall>) -> Vec<ToolCall> {
    calls.into_iter().map(WireToolCall::into_call).collect()
}
