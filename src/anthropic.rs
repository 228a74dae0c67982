//! Anthropic Messages API provider.
//!
//! Talks to `POST /v1/messages`, both plain and with Server-Sent Events
//! streaming.

use crate::config::ProviderConfig;
use crate::error::{ErrorCode, ProviderError};
use crate::messages::{ChatMessage, CompletionOptions, RequestSettings, Role};
use crate::provider::{CompletionProvider, ProviderCore, ProviderDefaults};
use crate::streaming::{SseDecoder, SseEvent, TextStream};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::RETRY_AFTER;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Model used when none is configured.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Environment variable holding the API key.
pub const API_KEY_ENV_VAR: &str = "ANTHROPIC_API_KEY";

/// Production API endpoint.
pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

/// Value of the `anthropic-version` header.
pub const API_VERSION: &str = "2023-06-01";

/// Provider for Anthropic's Claude models.
#[derive(Debug)]
pub struct AnthropicProvider {
    core: ProviderCore,
    client: Client,
    messages_url: Url,
}

impl ProviderDefaults for AnthropicProvider {
    fn default_model() -> String {
        DEFAULT_MODEL.to_string()
    }

    fn api_key_env_var() -> &'static str {
        API_KEY_ENV_VAR
    }
}

/// Request body for the messages API.
#[derive(Debug, Clone, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<ApiMessage>,
    stream: bool,
}

#[derive(Debug, Clone, Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MessagesResponse {
    content: Vec<ResponseBlock>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
enum ResponseBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiErrorDetail {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

/// The parts of a streaming event this provider reads.
#[derive(Debug, Clone, Deserialize)]
struct RawStreamEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    delta: Option<StreamDelta>,
    #[serde(default)]
    error: Option<ApiErrorDetail>,
}

#[derive(Debug, Clone, Deserialize)]
struct StreamDelta {
    #[serde(rename = "type", default)]
    delta_type: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

impl AnthropicProvider {
    /// Creates a provider, resolving the key from `ANTHROPIC_API_KEY` when
    /// the configuration has none.
    ///
    /// A missing key is not an error here; requests fail with
    /// `AUTHENTICATION_ERROR` instead.
    ///
    /// # Errors
    ///
    /// Returns `INVALID_CONFIG` for a malformed base URL or rate limit.
    pub fn new(config: impl Into<ProviderConfig>) -> Result<Self, ProviderError> {
        Self::from_core(ProviderCore::new::<Self>(config.into())?)
    }

    /// Creates a provider around already-resolved state.
    ///
    /// # Errors
    ///
    /// Returns `INVALID_CONFIG` for a malformed base URL, or a network error
    /// if the HTTP client cannot be built.
    pub fn from_core(core: ProviderCore) -> Result<Self, ProviderError> {
        let base = core.config().base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        let messages_url = messages_url(base)?;

        let client = Client::builder()
            .timeout(core.config().timeout)
            .build()
            .map_err(|e| ProviderError::network(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            core,
            client,
            messages_url,
        })
    }

    /// The endpoint requests are sent to.
    #[must_use]
    pub fn messages_url(&self) -> &Url {
        &self.messages_url
    }

    fn request_body(
        &self,
        settings: RequestSettings,
        messages: Vec<ApiMessage>,
        stream: bool,
    ) -> MessagesRequest {
        MessagesRequest {
            model: settings.model,
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
            system: settings.system,
            messages,
            stream,
        }
    }

    /// Sends `body` and returns the response once its status is a success.
    async fn send(&self, body: &MessagesRequest) -> Result<reqwest::Response, ProviderError> {
        let api_key = self.core.require_api_key()?;

        tracing::debug!(
            model = %body.model,
            max_tokens = body.max_tokens,
            messages = body.messages.len(),
            stream = body.stream,
            "sending anthropic request"
        );

        let response = self
            .client
            .post(self.messages_url.clone())
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .json(body)
            .send()
            .await?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body_text = match response.text().await {
            Ok(text) => text,
            Err(e) => unreadable_body(status, &e),
        };

        let error = error_from_response(status, retry_after, &body_text, &body.model);
        tracing::warn!(status, error = %error, "anthropic request failed");
        Err(error)
    }

    async fn send_messages(
        &self,
        settings: RequestSettings,
        messages: Vec<ApiMessage>,
    ) -> Result<String, ProviderError> {
        let body = self.request_body(settings, messages, false);

        self.core
            .with_rate_limit(1, async {
                let response: MessagesResponse = self.send(&body).await?.json().await?;
                if let Some(usage) = &response.usage {
                    tracing::debug!(
                        input_tokens = usage.input_tokens,
                        output_tokens = usage.output_tokens,
                        "anthropic request completed"
                    );
                }
                Ok::<_, ProviderError>(first_text(response))
            })
            .await
    }

    async fn stream_messages(
        &self,
        settings: RequestSettings,
        messages: Vec<ApiMessage>,
    ) -> Result<TextStream, ProviderError> {
        let body = self.request_body(settings, messages, true);
        let response = self.core.with_rate_limit(1, self.send(&body)).await?;
        let mut bytes = Box::pin(response.bytes_stream());

        let stream = async_stream::stream! {
            let mut decoder = SseDecoder::new();

            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(ProviderError::stream(format!("stream read error: {e}")));
                        return;
                    }
                };

                for event in decoder.feed(&chunk) {
                    match text_delta(&event) {
                        Ok(Some(text)) => yield Ok(text),
                        Ok(None) => {}
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
            }

            if let Some(event) = decoder.finish() {
                match text_delta(&event) {
                    Ok(Some(text)) => yield Ok(text),
                    Ok(None) => {}
                    Err(e) => yield Err(e),
                }
            }

            tracing::debug!("anthropic stream finished");
        };

        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl CompletionProvider for AnthropicProvider {
    fn core(&self) -> &ProviderCore {
        &self.core
    }

    async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String, ProviderError> {
        let settings = self.core.merge_options(options);
        self.send_messages(settings, vec![ApiMessage::user(prompt)])
            .await
    }

    async fn stream(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<TextStream, ProviderError> {
        let settings = self.core.merge_options(options);
        self.stream_messages(settings, vec![ApiMessage::user(prompt)])
            .await
    }

    /// Sends the transcript as native messages; system entries are merged
    /// into the request's system prompt.
    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<String, ProviderError> {
        let mut settings = self.core.merge_options(options);
        let (system, api_messages) = convert_messages(messages);
        settings.system = join_system(settings.system, system);

        if api_messages.is_empty() {
            return Err(ProviderError::invalid_request(
                "chat requires at least one user or assistant message",
            ));
        }

        self.send_messages(settings, api_messages).await
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn supports_chat(&self) -> bool {
        true
    }
}

impl ApiMessage {
    fn user(content: &str) -> Self {
        Self {
            role: "user",
            content: content.to_string(),
        }
    }
}

/// Joins `base` and `v1/messages`, keeping any path prefix on `base`.
fn messages_url(base: &str) -> Result<Url, ProviderError> {
    let mut base = Url::parse(base)
        .map_err(|e| ProviderError::invalid_config("base_url", format!("'{base}': {e}")))?;

    if base.cannot_be_a_base() {
        return Err(ProviderError::invalid_config(
            "base_url",
            format!("'{base}' cannot be used as a base URL"),
        ));
    }

    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }

    base.join("v1/messages")
        .map_err(|e| ProviderError::invalid_config("base_url", e))
}

/// Splits a transcript into the system prompt and API messages.
fn convert_messages(messages: &[ChatMessage]) -> (Option<String>, Vec<ApiMessage>) {
    let mut system = Vec::new();
    let mut api_messages = Vec::new();

    for msg in messages {
        match msg.role {
            Role::System => system.push(msg.content.as_str()),
            Role::User => api_messages.push(ApiMessage {
                role: "user",
                content: msg.content.clone(),
            }),
            Role::Assistant => api_messages.push(ApiMessage {
                role: "assistant",
                content: msg.content.clone(),
            }),
        }
    }

    let system = (!system.is_empty()).then(|| system.join("\n\n"));
    (system, api_messages)
}

fn join_system(first: Option<String>, second: Option<String>) -> Option<String> {
    match (first, second) {
        (Some(a), Some(b)) => Some(format!("{a}\n\n{b}")),
        (a, b) => a.or(b),
    }
}

fn first_text(response: MessagesResponse) -> String {
    response
        .content
        .into_iter()
        .find_map(|block| match block {
            ResponseBlock::Text { text } => Some(text),
            ResponseBlock::Other => None,
        })
        .unwrap_or_default()
}

/// Extracts the text of a `text_delta` event; other events yield `None`.
///
/// A payload that is not valid JSON ends the stream with a `STREAM_ERROR`.
fn text_delta(event: &SseEvent) -> Result<Option<String>, ProviderError> {
    let data = event.data.trim();
    if data.is_empty() || data == "[DONE]" {
        return Ok(None);
    }

    let raw: RawStreamEvent = serde_json::from_str(data).map_err(|e| {
        ProviderError::stream(format!("malformed stream event: {e}"))
    })?;

    match raw.event_type.as_str() {
        "content_block_delta" => Ok(raw.delta.and_then(|delta| {
            match delta.delta_type.as_deref() {
                Some("text_delta") | None => delta.text,
                Some(_) => None,
            }
        })),
        "error" => {
            let detail = raw.error.unwrap_or(ApiErrorDetail {
                error_type: "error".to_string(),
                message: "unknown stream error".to_string(),
            });
            Err(match detail.error_type.as_str() {
                "overloaded_error" => ProviderError::new(ErrorCode::Overloaded, detail.message),
                "rate_limit_error" => ProviderError::rate_limited(detail.message, None),
                _ => ProviderError::stream(detail.message),
            })
        }
        _ => Ok(None),
    }
}

/// Maps a non-success response to a [`ProviderError`].
fn unreadable_body(status: u16, err: &dyn std::fmt::Display) -> String {
    format!("HTTP {status} (body unreadable: {err})")
}

fn error_from_response(
    status: u16,
    retry_after: Option<Duration>,
    body: &str,
    model: &str,
) -> ProviderError {
    let detail = serde_json::from_str::<ApiErrorResponse>(body)
        .ok()
        .map(|r| r.error);
    let message = detail
        .as_ref()
        .map(|d| d.message.clone())
        .unwrap_or_else(|| {
            if body.is_empty() {
                format!("HTTP {status}")
            } else {
                body.to_string()
            }
        });
    let error_type = detail.as_ref().map(|d| d.error_type.as_str());

    match (status, error_type) {
        (429, _) | (_, Some("rate_limit_error")) => ProviderError::rate_limited(message, retry_after),
        (401 | 403, _) | (_, Some("authentication_error" | "permission_error")) => {
            ProviderError::authentication(message)
        }
        (_, Some("invalid_request_error")) => ProviderError::invalid_request(message),
        (529, _) | (_, Some("overloaded_error")) => ProviderError::overloaded(model),
        _ => ProviderError::api(status, message),
    }
}
