//! llama-server API client with SSE streaming
//!
//! Uses the OpenAI-compatible Chat Completions endpoint exposed by
//! llama.cpp. Streaming responses arrive as Server-Sent Events and are
//! forwarded, in order, over an mpsc channel.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::config::{ClientConfig, SamplingOptions};
use crate::conversation::{Role, Turn};
use crate::error::InferenceError;

const COMPLETIONS_PATH: &str = "/v1/chat/completions";
const HEALTH_PATH: &str = "/health";
const DONE_MARKER: &str = "[DONE]";

/// Token usage statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Why generation stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    Other(String),
    /// Stream ended with the end marker but no reason was reported
    Unspecified,
}

impl FinishReason {
    fn parse(reason: &str) -> Self {
        match reason {
            "stop" => FinishReason::Stop,
            "length" => FinishReason::Length,
            other => FinishReason::Other(other.to_string()),
        }
    }
}

/// Ready / not ready, as reported by `/health`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Ready,
    NotReady,
}

/// Stream events from the backend
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A token/chunk of text
    Token(String),
    /// Stream finished
    Done(FinishReason, TokenUsage),
    /// Stream failed; no further events follow
    Error(InferenceError),
}

/// Result of a non-streaming completion
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionResult {
    pub text: String,
    pub finish_reason: FinishReason,
    pub usage: TokenUsage,
}

/// One message in the request body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role: role.as_str().to_string(),
            content: content.into(),
        }
    }
}

impl From<&Turn> for ChatMessage {
    fn from(turn: &Turn) -> Self {
        ChatMessage::new(turn.role, turn.text.clone())
    }
}

/// Build request messages: preamble + payload turns
pub fn build_messages(preamble: Option<&str>, payload: &[Turn]) -> Vec<ChatMessage> {
    preamble
        .map(|p| ChatMessage::new(Role::System, p))
        .into_iter()
        .chain(payload.iter().map(ChatMessage::from))
        .collect()
}

// ═══════════════════════════════════════════════════════════════
// STREAM HANDLE
// ═══════════════════════════════════════════════════════════════

/// A finite, ordered, non-restartable sequence of completion events.
///
/// Dropping the stream or calling [`CompletionStream::cancel`] aborts the
/// reader task, which drops the HTTP response and closes the connection.
pub struct CompletionStream {
    rx: mpsc::Receiver<StreamEvent>,
    task: Option<JoinHandle<()>>,
    finished: bool,
}

impl CompletionStream {
    /// Wrap a receiver fed by some producer (used by fakes in tests)
    pub fn from_receiver(rx: mpsc::Receiver<StreamEvent>) -> Self {
        Self {
            rx,
            task: None,
            finished: false,
        }
    }

    fn with_task(rx: mpsc::Receiver<StreamEvent>, task: JoinHandle<()>) -> Self {
        Self {
            rx,
            task: Some(task),
            finished: false,
        }
    }

    /// Next event; `None` once `Done` or `Error` has been yielded
    pub async fn next(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        let event = match self.rx.recv().await {
            Some(event) => event,
            None => StreamEvent::Error(InferenceError::MalformedResponse(
                "stream closed before end marker".to_string(),
            )),
        };
        if matches!(event, StreamEvent::Done(..) | StreamEvent::Error(_)) {
            self.finished = true;
        }
        Some(event)
    }

    /// Stop the stream and release the connection
    pub fn cancel(&mut self) {
        self.finished = true;
        self.rx.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Drain into a single result
    pub async fn collect(mut self) -> Result<CompletionResult, InferenceError> {
        let mut text = String::new();
        while let Some(event) = self.next().await {
            match event {
                StreamEvent::Token(t) => text.push_str(&t),
                StreamEvent::Done(finish_reason, usage) => {
                    return Ok(CompletionResult {
                        text,
                        finish_reason,
                        usage,
                    })
                }
                StreamEvent::Error(e) => return Err(e),
            }
        }
        Err(InferenceError::MalformedResponse(
            "stream already consumed".to_string(),
        ))
    }
}

impl Drop for CompletionStream {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// CLIENT
// ═══════════════════════════════════════════════════════════════

/// HTTP client bound to one backend address
#[derive(Clone)]
pub struct InferenceClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
    /// The backend serves one completion at a time
    in_flight: Arc<Mutex<()>>,
}

impl InferenceClient {
    pub fn new(base_url: impl Into<String>, config: &ClientConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout: config.request_timeout(),
            in_flight: Arc::new(Mutex::new(())),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Probe `/health`
    pub async fn health(&self, probe_timeout: Duration) -> HealthStatus {
        probe_health(&self.http, &self.base_url, probe_timeout).await
    }

    /// Non-streaming completion
    pub async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &SamplingOptions,
    ) -> Result<CompletionResult, InferenceError> {
        let _guard = self.in_flight.lock().await;
        let request = ChatRequest::new(messages, options, false);

        let response = self
            .http
            .post(self.url(COMPLETIONS_PATH))
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, self.timeout))?;
        let response = check_status(response).await?;

        let body: CompletionResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                InferenceError::Timeout(self.timeout)
            } else {
                InferenceError::MalformedResponse(e.to_string())
            }
        })?;
        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| InferenceError::MalformedResponse("no choices in response".into()))?;

        Ok(CompletionResult {
            text: choice.message.content.unwrap_or_default(),
            finish_reason: choice
                .finish_reason
                .as_deref()
                .map(FinishReason::parse)
                .unwrap_or(FinishReason::Unspecified),
            usage: body.usage.map(TokenUsage::from).unwrap_or_default(),
        })
    }

    /// Streaming completion. Errors before the first byte (refused
    /// connection, timeout, HTTP status) are returned directly; later
    /// errors arrive as `StreamEvent::Error`.
    pub async fn stream(
        &self,
        messages: &[ChatMessage],
        options: &SamplingOptions,
    ) -> Result<CompletionStream, InferenceError> {
        let guard = self.in_flight.clone().lock_owned().await;
        let request = ChatRequest::new(messages, options, true);
        let timeout = self.timeout;

        let send = self
            .http
            .post(self.url(COMPLETIONS_PATH))
            .json(&request)
            .send();
        let response = match tokio::time::timeout(timeout, send).await {
            Ok(result) => result.map_err(|e| map_reqwest_error(e, timeout))?,
            Err(_) => return Err(InferenceError::Timeout(timeout)),
        };
        let response = check_status(response).await?;

        let (tx, rx) = mpsc::channel(256);
        let task = tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = pump_sse(response, timeout, &tx).await {
                let _ = tx.send(StreamEvent::Error(e)).await;
            }
        });

        Ok(CompletionStream::with_task(rx, task))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// GET `/health` on a llama-server; 200 means the model is loaded
pub async fn probe_health(http: &reqwest::Client, base_url: &str, timeout: Duration) -> HealthStatus {
    let url = format!("{}{}", base_url.trim_end_matches('/'), HEALTH_PATH);
    match http.get(&url).timeout(timeout).send().await {
        Ok(resp) if resp.status().is_success() => HealthStatus::Ready,
        Ok(resp) => {
            tracing::debug!(status = %resp.status(), "backend not ready");
            HealthStatus::NotReady
        }
        Err(e) => {
            tracing::debug!(error = %e, "health probe failed");
            HealthStatus::NotReady
        }
    }
}

fn map_reqwest_error(e: reqwest::Error, timeout: Duration) -> InferenceError {
    if e.is_timeout() {
        InferenceError::Timeout(timeout)
    } else if e.is_connect() || e.is_request() {
        InferenceError::BackendUnavailable(e.to_string())
    } else {
        InferenceError::MalformedResponse(e.to_string())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, InferenceError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(InferenceError::Status { status, body })
}

/// Read the SSE body and forward decoded events.
async fn pump_sse(
    response: reqwest::Response,
    idle_timeout: Duration,
    tx: &mpsc::Sender<StreamEvent>,
) -> Result<(), InferenceError> {
    let mut decoder = SseDecoder::default();
    let mut bytes_stream = response.bytes_stream();

    loop {
        let chunk = match tokio::time::timeout(idle_timeout, bytes_stream.next()).await {
            Err(_) => return Err(InferenceError::Timeout(idle_timeout)),
            Ok(None) => break,
            Ok(Some(chunk)) => chunk.map_err(|e| map_reqwest_error(e, idle_timeout))?,
        };

        for event in decoder.feed(&chunk)? {
            let done = matches!(event, StreamEvent::Done(..));
            if tx.send(event).await.is_err() {
                // Receiver gone: consumer cancelled
                return Ok(());
            }
            if done {
                return Ok(());
            }
        }
    }

    match decoder.finish() {
        Some(event) => {
            let _ = tx.send(event).await;
            Ok(())
        }
        None => Err(InferenceError::MalformedResponse(
            "stream closed before end marker".to_string(),
        )),
    }
}

// ═══════════════════════════════════════════════════════════════
// SSE DECODING
// ═══════════════════════════════════════════════════════════════

/// Incremental decoder for `data: {...}` lines
#[derive(Debug, Default)]
pub struct SseDecoder {
    /// Buffer for incomplete SSE lines
    buffer: Vec<u8>,
    finish_reason: Option<FinishReason>,
    usage: TokenUsage,
    done: bool,
}

impl SseDecoder {
    /// Feed raw bytes; returns the events completed by this chunk.
    /// Bytes are buffered until a newline so multi-byte characters split
    /// across chunks decode intact.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<StreamEvent>, InferenceError> {
        let mut events = Vec::new();
        if self.done {
            return Ok(events);
        }
        self.buffer.extend_from_slice(bytes);

        while let Some(newline_pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim();

            if line.is_empty() || line.starts_with(':') {
                continue;
            }

            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();

            if data == DONE_MARKER {
                self.done = true;
                events.push(self.done_event());
                break;
            }

            let chunk: StreamChunk = serde_json::from_str(data)
                .map_err(|e| InferenceError::MalformedResponse(format!("{}: {}", e, data)))?;

            if let Some(choice) = chunk.choices.first() {
                if let Some(content) = choice.delta.as_ref().and_then(|d| d.content.as_ref()) {
                    if !content.is_empty() {
                        events.push(StreamEvent::Token(content.clone()));
                    }
                }
                if let Some(reason) = &choice.finish_reason {
                    self.finish_reason = Some(FinishReason::parse(reason));
                }
            }

            if let Some(u) = chunk.usage {
                self.usage = u.into();
            }
        }

        Ok(events)
    }

    /// Called at end of body. A stream that reported a finish reason but
    /// omitted `[DONE]` still completes.
    pub fn finish(&mut self) -> Option<StreamEvent> {
        if self.done {
            return None;
        }
        self.finish_reason.is_some().then(|| {
            self.done = true;
            self.done_event()
        })
    }

    fn done_event(&self) -> StreamEvent {
        StreamEvent::Done(
            self.finish_reason.clone().unwrap_or(FinishReason::Unspecified),
            self.usage.clone(),
        )
    }
}

// ═══════════════════════════════════════════════════════════════
// API Types
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    messages: &'a [ChatMessage],
    stream: bool,
    max_tokens: u32,
    temperature: f32,
}

impl<'a> ChatRequest<'a> {
    fn new(messages: &'a [ChatMessage], options: &SamplingOptions, stream: bool) -> Self {
        Self {
            messages,
            stream,
            max_tokens: options.max_tokens,
            temperature: options.temperature,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Option<StreamDelta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

impl From<ApiUsage> for TokenUsage {
    fn from(u: ApiUsage) -> Self {
        Self {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}
