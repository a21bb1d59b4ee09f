use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{stream, StreamExt};
use shared::domain::ConversationId;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use crate::transport::{PushFrame, PushStream, PushTransport};

/// Websocket push channel at `{server}/ws?conversation_id=…`.
#[derive(Clone)]
pub struct WebSocketPush {
    server_url: String,
}

impl WebSocketPush {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
        }
    }

    pub fn endpoint(&self, conversation_id: ConversationId) -> Result<Url> {
        let ws_base = if self.server_url.starts_with("https://") {
            self.server_url.replacen("https://", "wss://", 1)
        } else if self.server_url.starts_with("http://") {
            self.server_url.replacen("http://", "ws://", 1)
        } else {
            return Err(anyhow!("server_url must start with http:// or https://"));
        };
        let mut url = Url::parse(&format!("{}/ws", ws_base.trim_end_matches('/')))
            .with_context(|| format!("invalid server url: {}", self.server_url))?;
        url.query_pairs_mut()
            .append_pair("conversation_id", &conversation_id.0.to_string());
        Ok(url)
    }
}

#[async_trait]
impl PushTransport for WebSocketPush {
    async fn subscribe(&self, conversation_id: ConversationId) -> Result<PushStream> {
        let url = self.endpoint(conversation_id)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {url}"))?;
        let (_, ws_reader) = ws_stream.split();

        let frames = ws_reader
            .take_while(|msg| futures::future::ready(!matches!(msg, Ok(Message::Close(_)))))
            .filter_map(|msg| async move {
                match msg {
                    Ok(Message::Text(text)) => Some(Ok(PushFrame::Text(text.to_string()))),
                    Ok(_) => None,
                    Err(err) => Some(Err(anyhow!("websocket receive failed: {err}"))),
                }
            });

        Ok(stream::once(async { Ok(PushFrame::Opened) })
            .chain(frames)
            .boxed())
    }
}

#[cfg(test)]
#[path = "tests/ws_tests.rs"]
mod tests;
