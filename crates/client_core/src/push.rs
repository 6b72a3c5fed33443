use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use shared::{
    domain::{Story, StoryKey},
    protocol::{PushAction, PushEnvelope, STORY_OBJECT_TYPE},
};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info};

use crate::{controller::Mutation, error::FrameError, PushChannel, PushSession};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushEvent {
    Apply(Mutation),
    /// A well-formed frame this client has no use for.
    Ignored {
        action: String,
        object_type: Option<String>,
    },
}

/// Parses one inbound text frame.
///
/// Only `added` and `deleted` story frames become mutations. A `deleted`
/// payload is read for its `id` alone, so a server that trims the rest of the
/// story still gets its delete applied.
pub fn decode_frame(raw: &str) -> Result<PushEvent, FrameError> {
    let envelope: PushEnvelope = serde_json::from_str(raw).map_err(FrameError::Envelope)?;

    let foreign_type = envelope
        .object_type
        .as_deref()
        .is_some_and(|object_type| object_type != STORY_OBJECT_TYPE);
    let action = PushAction::from_wire(&envelope.action);
    if foreign_type || !matches!(action, Some(PushAction::Added | PushAction::Deleted)) {
        return Ok(PushEvent::Ignored {
            action: envelope.action,
            object_type: envelope.object_type,
        });
    }

    match action {
        Some(PushAction::Added) => {
            let story: Story = serde_json::from_value(envelope.object).map_err(|source| {
                FrameError::Payload {
                    action: PushAction::Added.as_str(),
                    source,
                }
            })?;
            Ok(PushEvent::Apply(Mutation::Added(story)))
        }
        _ => {
            let key: StoryKey = serde_json::from_value(envelope.object).map_err(|source| {
                FrameError::Payload {
                    action: PushAction::Deleted.as_str(),
                    source,
                }
            })?;
            Ok(PushEvent::Apply(Mutation::Deleted(key.id)))
        }
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Push channel over a plain websocket, one connection per `open`.
pub struct WebSocketPushChannel {
    url: String,
}

impl WebSocketPushChannel {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl PushChannel for WebSocketPushChannel {
    async fn open(&self) -> Result<Box<dyn PushSession>> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {}", self.url))?;
        info!(url = %self.url, "push channel open");
        let (writer, reader) = ws_stream.split();
        Ok(Box::new(WebSocketSession { writer, reader }))
    }
}

struct WebSocketSession {
    writer: SplitSink<WsStream, Message>,
    reader: SplitStream<WsStream>,
}

#[async_trait]
impl PushSession for WebSocketSession {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.writer
            .send(Message::Text(text))
            .await
            .context("websocket send failed")
    }

    async fn next_frame(&mut self) -> Option<Result<String>> {
        while let Some(msg) = self.reader.next().await {
            match msg {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "push channel closed by server");
                    return None;
                }
                Ok(_) => {}
                Err(err) => return Some(Err(anyhow::Error::new(err).context("websocket receive failed"))),
            }
        }
        None
    }
}

#[cfg(test)]
#[path = "tests/push_tests.rs"]
mod tests;
