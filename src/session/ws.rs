//! WebSocket transport for the assistant session
//!
//! JSON text frames tagged by `type`. Outbound: `session.setup`,
//! `input_audio`, `tool_results`. Inbound: `audio`, `tool_call_batch`,
//! `interrupted`, `error`, `session.closed`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::protocol::{
    AssistantConnector, AssistantSession, Connection, SessionEvent, SessionSetup, WireToolCall,
    parse_batch,
};
use crate::config::AssistantConfig;
use crate::tools::ToolResult;
use crate::voice::EncodedAudio;
use crate::{Error, Result};

/// How long to wait for the socket to open
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Inbound event buffer per session
const EVENT_BUFFER: usize = 64;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Serialize)]
#[serde(tag = "type")]
enum ClientMessage<'a> {
    #[serde(rename = "session.setup")]
    Setup(&'a SessionSetup),
    #[serde(rename = "input_audio")]
    InputAudio { audio: &'a str, mime_type: String },
    #[serde(rename = "tool_results")]
    ToolResults { results: &'a [ToolResult] },
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ServerMessage {
    #[serde(rename = "audio")]
    Audio { audio: String },
    #[serde(rename = "tool_call_batch")]
    ToolCallBatch { calls: Vec<WireToolCall> },
    #[serde(rename = "interrupted")]
    Interrupted,
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(rename = "session.closed")]
    Closed,
    #[serde(other)]
    Other,
}

impl ServerMessage {
    fn into_event(self) -> Option<SessionEvent> {
        match self {
            Self::Audio { audio } => Some(SessionEvent::Audio(audio)),
            Self::ToolCallBatch { calls } => Some(SessionEvent::ToolCalls(parse_batch(calls))),
            Self::Interrupted => Some(SessionEvent::Interrupted),
            Self::Error { message } => Some(SessionEvent::Error(message)),
            Self::Closed => Some(SessionEvent::Closed),
            Self::Other => None,
        }
    }
}

/// Connects to a realtime assistant over WebSocket
pub struct WsConnector {
    url: String,
    api_key: Option<SecretString>,
}

impl WsConnector {
    #[must_use]
    pub fn new(config: &AssistantConfig) -> Self {
        Self {
            url: config.url.clone(),
            api_key: config.api_key.clone(),
        }
    }
}

#[async_trait]
impl AssistantConnector for WsConnector {
    async fn connect(&self, setup: SessionSetup) -> Result<Connection> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::Config(format!("invalid assistant url: {e}")))?;

        if let Some(key) = &self.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {}", key.expose_secret()))
                .map_err(|e| Error::Config(format!("invalid api key: {e}")))?;
            request.headers_mut().insert("Authorization", value);
        }

        tracing::debug!(url = %self.url, model = %setup.model, "connecting to assistant");

        let (ws, _response) = tokio::time::timeout(
            CONNECT_TIMEOUT,
            tokio_tungstenite::connect_async(request),
        )
        .await
        .map_err(|_| Error::Connection("timed out connecting to assistant".to_string()))?
        .map_err(|e| Error::Connection(e.to_string()))?;

        let (mut sink, stream) = ws.split();

        let setup_json = serde_json::to_string(&ClientMessage::Setup(&setup))?;
        sink.send(Message::text(setup_json))
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let reader = tokio::spawn(read_loop(stream, events_tx));

        tracing::info!(url = %self.url, "assistant session opened");

        Ok(Connection {
            session: Arc::new(WsSession {
                sink: Mutex::new(sink),
                reader: std::sync::Mutex::new(Some(reader)),
                closed: AtomicBool::new(false),
            }),
            events: events_rx,
        })
    }
}

async fn read_loop(mut stream: SplitStream<WsStream>, events: mpsc::Sender<SessionEvent>) {
    let last = loop {
        let event = match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<ServerMessage>(text.as_str()) {
                    Ok(message) => match message.into_event() {
                        Some(event) => event,
                        None => continue,
                    },
                    Err(e) => {
                        tracing::warn!(error = %e, "unparseable assistant message");
                        continue;
                    }
                }
            }
            Some(Ok(Message::Close(frame))) => {
                tracing::debug!(?frame, "assistant closed the socket");
                break SessionEvent::Closed;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => break SessionEvent::Error(e.to_string()),
            None => break SessionEvent::Closed,
        };

        let terminal = matches!(event, SessionEvent::Closed | SessionEvent::Error(_));
        if events.send(event).await.is_err() || terminal {
            return;
        }
    };

    let _ = events.send(last).await;
}

struct WsSession {
    sink: Mutex<SplitSink<WsStream, Message>>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl WsSession {
    async fn send(&self, message: &ClientMessage<'_>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Connection("session is closed".to_string()));
        }
        let json = serde_json::to_string(message)?;
        self.sink.lock().await.send(Message::text(json)).await?;
        Ok(())
    }
}

#[async_trait]
impl AssistantSession for WsSession {
    async fn send_audio(&self, audio: &EncodedAudio) -> Result<()> {
        tracing::trace!(bytes = audio.data.len(), "sending audio frame");
        self.send(&ClientMessage::InputAudio {
            audio: &audio.data,
            mime_type: audio.mime_type(),
        })
        .await
    }

    async fn send_tool_results(&self, results: &[ToolResult]) -> Result<()> {
        tracing::debug!(count = results.len(), "sending tool results");
        self.send(&ClientMessage::ToolResults { results }).await
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.sink.lock().await.close().await {
            tracing::debug!(error = %e, "error closing assistant socket");
        }
        let reader = self.reader.lock().ok().and_then(|mut r| r.take());
        if let Some(reader) = reader {
            reader.abort();
        }
        tracing::info!("assistant session closed");
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn outbound_messages_are_tagged() {
        let audio = EncodedAudio {
            data: "AAA=".to_string(),
            sample_rate: 16_000,
        };
        let json = serde_json::to_value(ClientMessage::InputAudio {
            audio: &audio.data,
            mime_type: audio.mime_type(),
        })
        .unwrap();
        assert_eq!(
            json,
            json!({ "type": "input_audio", "audio": "AAA=", "mime_type": "audio/pcm;rate=16000" })
        );

        let setup = SessionSetup {
            model: "m".into(),
            voice: "v".into(),
            instructions: "i".into(),
            tools: vec![],
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
        };
        let json = serde_json::to_value(ClientMessage::Setup(&setup)).unwrap();
        assert_eq!(json["type"], "session.setup");
        assert_eq!(json["model"], "m");
    }

    #[test]
    fn inbound_messages_map_to_events() {
        let parse = |v: serde_json::Value| {
            serde_json::from_value::<ServerMessage>(v)
                .unwrap()
                .into_event()
        };

        assert_eq!(
            parse(json!({ "type": "audio", "audio": "AAA=" })),
            Some(SessionEvent::Audio("AAA=".to_string()))
        );
        assert_eq!(
            parse(json!({ "type": "session.closed" })),
            Some(SessionEvent::Closed)
        );
        assert_eq!(parse(json!({ "type": "usage", "tokens": 12 })), None);

        let Some(SessionEvent::ToolCalls(calls)) = parse(json!({
            "type": "tool_call_batch",
            "calls": [{ "id": "a", "name": "endSession", "arguments": {} }]
        })) else {
            panic!("expected tool calls");
        };
        assert_eq!(calls.len(), 1);
    }
}
