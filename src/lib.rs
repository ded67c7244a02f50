//! Tempo - project, task and calendar planner with a hands-free voice assistant
//!
//! This library provides the core of the Tempo voice feature:
//! - Planner data model and persistence (projects, tasks, calendar)
//! - Audio capture, gapless playback, and the PCM wire codec
//! - Wake phrase listening on top of a speech recognizer
//! - Live sessions with a remote realtime assistant
//! - Tool calls that edit planner data in atomic batches
//! - The voice session controller that ties it together
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              VoiceController (OFF/WAITING/ACTIVE)   │
//! └───────┬──────────────────┬──────────────────┬───────┘
//!         │                  │                  │
//! ┌───────▼───────┐  ┌───────▼───────┐  ┌───────▼───────┐
//! │ WakeWord      │  │ LiveSession   │  │ ToolExecutor  │
//! │ Listener      │  │ capture → ws  │  │ → SharedState │
//! │ (recognizer)  │  │ ws → playback │  │ → DataStore   │
//! └───────────────┘  └───────────────┘  └───────────────┘
//! ```

pub mod config;
pub mod controller;
pub mod error;
pub mod model;
pub mod session;
pub mod store;
pub mod tools;
pub mod voice;

pub use config::Config;
pub use controller::{ControllerDeps, Mode, VoiceController, VoiceEvent, VoiceHandle};
pub use error::{Error, Result};
pub use model::{DataSnapshot, Project, SelectionRef, Task};
pub use store::{DataStore, MemoryStore, SharedState, SqliteStore};
pub use tools::{ToolCall, ToolExecutor, ToolRequest, ToolResult};
