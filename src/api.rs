use crate::config::ProviderSettings;
use crate::error::ChatError;
use crate::models::WireMessage;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

// Alias for the raw response body stream handed to the decoder
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ChatError>> + Send>>;

/// One outbound call to a chat completion endpoint per invocation.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Complete mode: returns the first choice's message content.
    async fn complete(
        &self,
        messages: &[WireMessage],
        cancel: &CancellationToken,
    ) -> Result<String, ChatError>;

    /// Streaming mode: returns the response body once headers have arrived.
    /// The stream ends with `Err(Timeout)` or `Err(Cancelled)` if the
    /// deadline passes or the token fires before the body is complete.
    async fn open_stream(
        &self,
        messages: &[WireMessage],
        cancel: &CancellationToken,
    ) -> Result<ByteStream, ChatError>;
}

// --- OpenAI Compatible Provider Implementation ---

#[derive(Serialize, Debug)]
struct OpenAIRequestBody<'a> {
    model: &'a str,
    messages: &'a [WireMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Deserialize, Debug)]
struct OpenAIResponse {
    #[serde(default)]
    choices: Vec<OpenAIChoice>,
}

#[derive(Deserialize, Debug)]
struct OpenAIChoice {
    message: OpenAIChoiceMessage,
}

#[derive(Deserialize, Debug)]
struct OpenAIChoiceMessage {
    content: Option<String>,
}

pub struct OpenAICompatibleProvider {
    client: Client,
    settings: ProviderSettings,
}

impl OpenAICompatibleProvider {
    pub fn new(settings: ProviderSettings) -> Self {
        Self {
            client: Client::new(),
            settings,
        }
    }

    fn request_url(&self) -> String {
        format!("{}/chat/completions", self.settings.base_url.trim_end_matches('/'))
    }

    async fn send(&self, messages: &[WireMessage], stream: bool) -> Result<reqwest::Response, ChatError> {
        if messages.is_empty() {
            return Err(ChatError::InvalidInput("message list is empty".to_string()));
        }

        let request_body = OpenAIRequestBody {
            model: &self.settings.model,
            messages,
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
            stream,
        };

        log::info!(
            "Sending {} request to {} using model: {} ({} messages)",
            if stream { "STREAM" } else { "COMPLETE" },
            self.settings.base_url,
            self.settings.model,
            messages.len()
        );

        let response = self
            .client
            .post(self.request_url())
            .bearer_auth(&self.settings.api_key)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, self.settings.timeout))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "<Failed to read error body>".to_string());
            log::error!("Chat API request failed with status {}: {}", status, error_body);
            return Err(ChatError::Upstream {
                status: status.as_u16(),
                body: error_body,
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl ChatTransport for OpenAICompatibleProvider {
    async fn complete(
        &self,
        messages: &[WireMessage],
        cancel: &CancellationToken,
    ) -> Result<String, ChatError> {
        let call = async {
            let response = self.send(messages, false).await?;
            let parsed: OpenAIResponse = response
                .json()
                .await
                .map_err(|e| map_reqwest_error(e, self.settings.timeout))?;
            parsed
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.message.content)
                .ok_or_else(|| {
                    log::error!("No choices in API response");
                    ChatError::EmptyResponse
                })
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ChatError::Cancelled),
            result = tokio::time::timeout(self.settings.timeout, call) => {
                result.unwrap_or(Err(ChatError::Timeout(self.settings.timeout)))
            }
        }
    }

    async fn open_stream(
        &self,
        messages: &[WireMessage],
        cancel: &CancellationToken,
    ) -> Result<ByteStream, ChatError> {
        let deadline = Instant::now() + self.settings.timeout;

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ChatError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => {
                return Err(ChatError::Timeout(self.settings.timeout))
            }
            response = self.send(messages, true) => response?,
        };

        let timeout = self.settings.timeout;
        let body = response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| map_reqwest_error(e, timeout)));

        Ok(guard_stream(body, deadline, timeout, cancel.clone()))
    }
}

/// Bounds a body stream by a deadline and a cancellation token.
///
/// The inner stream is dropped (releasing the connection) as soon as either
/// fires; the last item is then `Err(Timeout)` or `Err(Cancelled)`.
pub fn guard_stream<S>(
    body: S,
    deadline: Instant,
    timeout: Duration,
    cancel: CancellationToken,
) -> ByteStream
where
    S: Stream<Item = Result<Bytes, ChatError>> + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut body = Box::pin(body);
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    log::info!("Model stream cancelled, dropping connection.");
                    yield Err(ChatError::Cancelled);
                    return;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    log::warn!("Model stream exceeded {:?}, dropping connection.", timeout);
                    yield Err(ChatError::Timeout(timeout));
                    return;
                }
                next = body.next() => next,
            };
            match next {
                Some(item) => yield item,
                None => return,
            }
        }
    })
}

fn map_reqwest_error(e: reqwest::Error, timeout: Duration) -> ChatError {
    if e.is_timeout() {
        ChatError::Timeout(timeout)
    } else {
        ChatError::Transport(e.to_string())
    }
}
