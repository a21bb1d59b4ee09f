use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use shared::{
    domain::{ConversationId, UserId},
    error::{ApiError, ApiException},
    protocol::{MessagePayload, ProfileSummary, SendMessageRequest},
};

use crate::transport::{MessageBackend, ProfileLookup};

/// REST client for the message backend.
#[derive(Clone)]
pub struct HttpBackend {
    http: Client,
    server_url: String,
}

impl HttpBackend {
    pub fn new(server_url: impl Into<String>) -> Result<Self> {
        let server_url = server_url.into();
        if !(server_url.starts_with("http://") || server_url.starts_with("https://")) {
            return Err(anyhow!("server_url must start with http:// or https://"));
        }
        Ok(Self {
            http: Client::new(),
            server_url: server_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

/// Maps a non-success response to an error, preferring the server's `ApiError` body.
async fn ensure_success(response: Response, url: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match response.json::<ApiError>().await {
        Ok(api_error) => Err(anyhow::Error::new(ApiException::from(api_error))
            .context(format!("request to {url} failed with {status}"))),
        Err(_) => Err(anyhow!("request to {url} failed with {status}")),
    }
}

#[async_trait]
impl MessageBackend for HttpBackend {
    async fn list_messages(&self, conversation_id: ConversationId) -> Result<Vec<MessagePayload>> {
        let url = format!(
            "{}/conversations/{}/messages",
            self.server_url, conversation_id.0
        );
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("failed to fetch messages: {url}"))?;
        let messages: Vec<MessagePayload> = ensure_success(response, &url)
            .await?
            .json()
            .await
            .context("invalid message list payload")?;
        Ok(messages)
    }

    async fn create_message(&self, request: SendMessageRequest) -> Result<MessagePayload> {
        let url = format!("{}/messages", self.server_url);
        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("failed to post message: {url}"))?;
        let message: MessagePayload = ensure_success(response, &url)
            .await?
            .json()
            .await
            .context("invalid created message payload")?;
        Ok(message)
    }
}

#[async_trait]
impl ProfileLookup for HttpBackend {
    async fn lookup(&self, user_id: UserId) -> Result<Option<ProfileSummary>> {
        let url = format!("{}/users/{}/profile", self.server_url, user_id.0);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("failed to fetch profile: {url}"))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let profile: ProfileSummary = ensure_success(response, &url)
            .await?
            .json()
            .await
            .context("invalid profile payload")?;
        Ok(Some(profile))
    }
}

#[cfg(test)]
#[path = "tests/http_tests.rs"]
mod tests;
