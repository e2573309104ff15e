//! Model Provider Abstraction
//!
//! The LLM gateway consumed by every pipeline stage: a stateless request/response
//! `complete` call and a streaming `stream` call. One OpenAI-compatible HTTP client
//! covers hosted OpenAI, Ollama's `/v1` endpoint and custom local servers.

use crate::error::GatewayError;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Provider flavour; all of them speak the chat-completions wire format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderType {
    #[serde(rename = "openai")]
    OpenAI,
    #[serde(rename = "ollama")]
    Ollama,
    #[serde(rename = "local")]
    LocalCustom,
}

/// Provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_type")]
    pub provider_type: ProviderType,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Base URL up to and including `/v1`
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub default_options: CompletionOptions,
}

fn default_provider_type() -> ProviderType {
    ProviderType::OpenAI
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider_type: default_provider_type(),
            model: default_model(),
            api_key: None,
            endpoint: None,
            default_options: CompletionOptions::default(),
        }
    }
}

impl ProviderConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.model.trim().is_empty() {
            return Err("Model name cannot be empty".to_string());
        }
        if let Some(endpoint) = &self.endpoint {
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                return Err(format!("Invalid endpoint URL: {}", endpoint));
            }
        }
        Ok(())
    }

    /// Resolved base URL for the chat-completions API.
    pub fn base_url(&self) -> String {
        if let Some(endpoint) = &self.endpoint {
            return endpoint.trim_end_matches('/').to_string();
        }
        match self.provider_type {
            ProviderType::OpenAI => "https://api.openai.com/v1".to_string(),
            ProviderType::Ollama => "http://localhost:11434/v1".to_string(),
            ProviderType::LocalCustom => "http://localhost:8080/v1".to_string(),
        }
    }
}

/// Chat message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// Chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

}

/// Completion options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionOptions {
    pub temperature: Option<f32>, // 0.0-2.0
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    pub stop: Option<Vec<String>>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            temperature: Some(0.7),
            max_tokens: Some(16384),
            top_p: None,
            stop: None,
        }
    }
}

impl CompletionOptions {
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// Token usage information
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Completion response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    pub model: String,
    pub usage: TokenUsage,
    pub finish_reason: Option<String>,
}

/// One item of a streamed completion.
///
/// Providers legitimately send chunks without content (role headers, keep-alives,
/// usage frames); those arrive as `Empty` and never end the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    Delta(String),
    Empty,
    /// Complete text delivered at the end of a stream. A non-empty payload replaces the
    /// accumulated deltas; an empty one leaves them in place.
    Final(String),
}

/// Streaming completion type
pub type CompletionStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, GatewayError>> + Send>>;

/// Model provider client trait
#[async_trait]
pub trait ModelProviderClient: Send + Sync {
    /// Generate a completion from a list of messages
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        options: CompletionOptions,
    ) -> Result<CompletionResponse, GatewayError>;

    /// Generate a streaming completion
    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        options: CompletionOptions,
    ) -> Result<CompletionStream, GatewayError>;

    fn provider_name(&self) -> &str;

    fn model_name(&self) -> &str;
}

/// Drain a completion stream into its final text.
pub async fn collect_stream(mut stream: CompletionStream) -> Result<String, GatewayError> {
    let mut text = String::new();
    while let Some(chunk) = stream.next().await {
        match chunk? {
            StreamChunk::Delta(delta) => text.push_str(&delta),
            StreamChunk::Empty => continue,
            StreamChunk::Final(payload) if payload.is_empty() => continue,
            StreamChunk::Final(payload) => text = payload,
        }
    }
    Ok(text)
}

// OpenAI-compatible API request/response structures
#[derive(Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    stream: bool,
}

#[derive(Serialize, Deserialize)]
struct OpenAIMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    model: String,
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: OpenAIMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Deserialize)]
struct StreamPayload {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
}

#[derive(Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

fn role_to_string(role: MessageRole) -> &'static str {
    match role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
    }
}

fn map_http_error(error: reqwest::Error) -> GatewayError {
    if let Some(status) = error.status() {
        map_status(status.as_u16(), error.to_string())
    } else {
        map_transport(error.is_timeout(), error.is_connect(), error.to_string())
    }
}

fn map_transport(is_timeout: bool, is_connect: bool, detail: String) -> GatewayError {
    if is_timeout {
        GatewayError::Timeout(PROVIDER_HTTP_REQUEST_TIMEOUT.as_secs())
    } else if is_connect {
        GatewayError::RequestFailed(format!("Connection error: {}", detail))
    } else {
        GatewayError::RequestFailed(format!("HTTP error: {}", detail))
    }
}

fn map_status(status: u16, detail: String) -> GatewayError {
    match status {
        401 | 403 => GatewayError::AuthFailed(detail),
        429 => GatewayError::RateLimit(detail),
        404 => GatewayError::ModelNotFound(detail),
        _ => GatewayError::RequestFailed(format!("status {}: {}", status, detail)),
    }
}

const PROVIDER_HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
// Pipeline stages apply their own per-task bound; this only stops a dead socket.
const PROVIDER_HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(900);

fn build_provider_http_client() -> Result<Client, GatewayError> {
    Client::builder()
        .connect_timeout(PROVIDER_HTTP_CONNECT_TIMEOUT)
        .timeout(PROVIDER_HTTP_REQUEST_TIMEOUT)
        .build()
        .map_err(|e| GatewayError::NotConfigured(format!("Failed to create HTTP client: {}", e)))
}

/// Chat-completions client for any OpenAI-compatible endpoint
pub struct OpenAICompatibleClient {
    client: Client,
    provider_name: &'static str,
    model: String,
    api_key: Option<String>,
    base_url: String,
}

impl OpenAICompatibleClient {
    pub fn new(config: &ProviderConfig) -> Result<Self, GatewayError> {
        config.validate().map_err(GatewayError::NotConfigured)?;
        if config.provider_type == ProviderType::OpenAI && config.api_key.is_none() {
            return Err(GatewayError::NotConfigured(
                "OpenAI provider requires an api_key".to_string(),
            ));
        }
        let provider_name = match config.provider_type {
            ProviderType::OpenAI => "openai",
            ProviderType::Ollama => "ollama",
            ProviderType::LocalCustom => "local",
        };
        Ok(Self {
            client: build_provider_http_client()?,
            provider_name,
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            base_url: config.base_url(),
        })
    }

    fn request_body(
        &self,
        messages: Vec<ChatMessage>,
        options: CompletionOptions,
        stream: bool,
    ) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: self.model.clone(),
            messages: messages
                .into_iter()
                .map(|msg| OpenAIMessage {
                    role: role_to_string(msg.role).to_string(),
                    content: Some(msg.content),
                })
                .collect(),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            top_p: options.top_p,
            stop: options.stop,
            stream,
        }
    }

    async fn post(&self, body: &ChatCompletionRequest) -> Result<reqwest::Response, GatewayError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut request = self.client.post(&url).json(body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }
        let response = request.send().await.map_err(map_http_error)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(map_status(status, error_text));
        }
        Ok(response)
    }
}

#[async_trait]
impl ModelProviderClient for OpenAICompatibleClient {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        options: CompletionOptions,
    ) -> Result<CompletionResponse, GatewayError> {
        let body = self.request_body(messages, options, false);
        let response = self.post(&body).await?;

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Malformed(format!("Failed to parse response: {}", e)))?;

        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::Malformed("No choices in response".to_string()))?;

        let usage = completion.usage.map_or_else(TokenUsage::default, |u| TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });

        Ok(CompletionResponse {
            content: choice.message.content.unwrap_or_default(),
            model: completion.model,
            usage,
            finish_reason: choice.finish_reason,
        })
    }

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        options: CompletionOptions,
    ) -> Result<CompletionStream, GatewayError> {
        let body = self.request_body(messages, options, true);
        let response = self.post(&body).await?;

        let state = SseState {
            response,
            frames: SseFrames::default(),
        };
        let stream = futures::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(item) = state.frames.pending.pop_front() {
                    return Some((item, state));
                }
                if state.frames.finished {
                    return None;
                }
                match state.response.chunk().await {
                    Ok(Some(bytes)) => state.frames.feed(&bytes),
                    Ok(None) => state.frames.close(),
                    Err(e) => state.frames.fail(map_http_error(e)),
                }
            }
        });
        Ok(Box::pin(stream))
    }

    fn provider_name(&self) -> &str {
        self.provider_name
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

struct SseState {
    response: reqwest::Response,
    frames: SseFrames,
}

/// Decoded stream items waiting to be yielded, fed from raw body reads.
#[derive(Default)]
struct SseFrames {
    decoder: SseDecoder,
    pending: VecDeque<Result<StreamChunk, GatewayError>>,
    finished: bool,
}

impl SseFrames {
    fn feed(&mut self, bytes: &[u8]) {
        let events = self.decoder.push(bytes);
        self.absorb(events);
    }

    /// End of body: flush the unterminated tail.
    fn close(&mut self) {
        let tail = self.decoder.finish();
        self.absorb(tail);
        self.finished = true;
    }

    fn fail(&mut self, error: GatewayError) {
        self.pending.push_back(Err(error));
        self.finished = true;
    }

    fn absorb(&mut self, events: Vec<SseEvent>) {
        if self.finished {
            return;
        }
        for event in events {
            match event {
                SseEvent::Data(payload) => self.pending.push_back(parse_stream_payload(&payload)),
                SseEvent::Done => {
                    self.finished = true;
                    break;
                }
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum SseEvent {
    Data(String),
    Done,
}

/// Line-oriented server-sent-events decoder; tolerates frames split across reads.
#[derive(Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(event) = Self::decode_line(&line) {
                events.push(event);
            }
        }
        events
    }

    fn finish(&mut self) -> Vec<SseEvent> {
        let line = std::mem::take(&mut self.buffer);
        Self::decode_line(&line).into_iter().collect()
    }

    fn decode_line(line: &[u8]) -> Option<SseEvent> {
        let line = String::from_utf8_lossy(line);
        let payload = line.trim_end_matches(['\r', '\n']).strip_prefix("data:")?.trim();
        match payload {
            "" => None,
            "[DONE]" => Some(SseEvent::Done),
            other => Some(SseEvent::Data(other.to_string())),
        }
    }
}

fn parse_stream_payload(payload: &str) -> Result<StreamChunk, GatewayError> {
    let parsed: StreamPayload = serde_json::from_str(payload)
        .map_err(|e| GatewayError::Malformed(format!("Invalid stream frame: {}", e)))?;
    let content = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta)
        .and_then(|delta| delta.content);
    Ok(match content {
        Some(text) if !text.is_empty() => StreamChunk::Delta(text),
        _ => StreamChunk::Empty,
    })
}

/// Provider factory for creating provider clients
pub struct ProviderFactory;

impl ProviderFactory {
    pub fn create_client(
        config: &ProviderConfig,
    ) -> Result<Arc<dyn ModelProviderClient>, GatewayError> {
        Ok(Arc::new(OpenAICompatibleClient::new(config)?))
    }
}
