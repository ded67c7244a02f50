//! Assistant sessions
//!
//! [`protocol`] defines what the controller needs from a remote assistant,
//! [`ws`] provides it over WebSocket, and [`live`] runs one conversation.

pub mod live;
pub mod protocol;
pub mod ws;

pub use live::{EndReason, LiveDeps, LiveEvent, LiveEventKind, LiveSession};
pub use protocol::{
    AssistantConnector, AssistantSession, Connection, SessionEvent, SessionSetup, WireToolCall,
};
pub use ws::WsConnector;
