//! Session context: one chat with one backend
//!
//! Owns the conversation, the inference client, the supervised backend (if
//! any) and the command executor. `handle_line` is the whole per-line
//! protocol: classify, gather, stage, stream, commit.
//!
//! Turns produced by a line are staged and only committed when the reply
//! completes, so a failed request leaves the history untouched.

use async_trait::async_trait;
use std::io::{self, Write};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::client::{
    build_messages, ChatMessage, CompletionResult, CompletionStream, FinishReason, HealthStatus,
    InferenceClient, StreamEvent,
};
use crate::commands::{self, classify, CommandInvocation, CommandKind, Executor};
use crate::config::{Config, SamplingOptions, SessionsConfig};
use crate::conversation::{Conversation, Turn};
use crate::error::{CommandError, InferenceError};
use crate::supervisor::BackendProcess;
use crate::ui;

/// Pause before the single retry after `BackendUnavailable`
const RETRY_DELAY: Duration = Duration::from_millis(500);

// ═══════════════════════════════════════════════════════════════
// COMPLETER SEAM
// ═══════════════════════════════════════════════════════════════

/// Anything that can produce a chat completion, streamed or whole
#[async_trait]
pub trait Completer: Send + Sync {
    async fn stream(
        &self,
        messages: &[ChatMessage],
        options: &SamplingOptions,
    ) -> Result<CompletionStream, InferenceError>;

    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &SamplingOptions,
    ) -> Result<CompletionResult, InferenceError>;

    /// Used when no supervised process is attached
    async fn health(&self) -> HealthStatus;
}

#[async_trait]
impl Completer for InferenceClient {
    async fn stream(
        &self,
        messages: &[ChatMessage],
        options: &SamplingOptions,
    ) -> Result<CompletionStream, InferenceError> {
        InferenceClient::stream(self, messages, options).await
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &SamplingOptions,
    ) -> Result<CompletionResult, InferenceError> {
        InferenceClient::complete(self, messages, options).await
    }

    async fn health(&self) -> HealthStatus {
        InferenceClient::health(self, Duration::from_secs(2)).await
    }
}

/// What the loop should do after a line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    Quit,
}

enum Reply {
    Complete { text: String, finish: FinishReason },
    Cancelled { text: String },
    Failed { error: InferenceError, text: String },
}

// ═══════════════════════════════════════════════════════════════
// SESSION CONTEXT
// ═══════════════════════════════════════════════════════════════

pub struct SessionContext {
    conversation: Conversation,
    completer: Box<dyn Completer>,
    backend: Option<BackendProcess>,
    executor: Executor,
    sampling: SamplingOptions,
    sessions: SessionsConfig,
    keep_partial_on_cancel: bool,
    retry_delay: Duration,
}

impl SessionContext {
    pub fn new(config: &Config, completer: impl Completer + 'static) -> Self {
        let conversation = Conversation::new(config.context_budget())
            .with_preamble(config.conversation.system_prompt.clone());
        Self {
            conversation,
            completer: Box::new(completer),
            backend: None,
            executor: Executor::new(config.commands.clone()),
            sampling: config.sampling.clone(),
            sessions: config.sessions.clone(),
            keep_partial_on_cancel: config.conversation.keep_partial_on_cancel,
            retry_delay: RETRY_DELAY,
        }
    }

    /// Attach the supervised backend; it is stopped by [`SessionContext::shutdown`]
    pub fn with_backend(mut self, backend: BackendProcess) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_executor(mut self, executor: Executor) -> Self {
        self.executor = executor;
        self
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn backend(&self) -> Option<&BackendProcess> {
        self.backend.as_ref()
    }

    /// Load the default session if one exists. Missing files are not an error.
    pub fn autoload(&mut self, out: &mut impl Write) -> io::Result<usize> {
        if !self.sessions.autoload {
            return Ok(0);
        }
        let path = self.sessions.path_for(None);
        match self.conversation.restore(&path) {
            Ok(count) => {
                tracing::info!(path = %path.display(), turns = count, "restored session");
                ui::info(out, &format!("Restored {} turns from {}", count, path.display()))?;
                Ok(count)
            }
            Err(e) if e.is_missing() => Ok(0),
            Err(e) => {
                ui::warn(out, &e.to_string())?;
                Ok(0)
            }
        }
    }

    /// Save to the default session if autosave is on and there is something to save
    pub fn autosave(&self, out: &mut impl Write) -> io::Result<()> {
        if !self.sessions.autosave || self.conversation.is_empty() {
            return Ok(());
        }
        let path = self.sessions.path_for(None);
        match self.conversation.save(&path) {
            Ok(()) => ui::info(out, &format!("Saved {} turns to {}", self.conversation.len(), path.display())),
            Err(e) => ui::warn(out, &e.to_string()),
        }
    }

    /// Stop the backend (idempotent)
    pub async fn shutdown(&mut self) {
        if let Some(backend) = self.backend.as_mut() {
            backend.stop().await;
        }
    }

    /// Handle one line of input
    pub async fn handle_line<W: Write + Send>(
        &mut self,
        line: &str,
        out: &mut W,
        cancel: &CancellationToken,
    ) -> io::Result<Outcome> {
        let Some(invocation) = classify(line) else {
            return Ok(Outcome::Continue);
        };
        tracing::debug!(kind = ?invocation.kind, "classified input");

        match invocation.kind {
            CommandKind::Quit => return Ok(Outcome::Quit),
            CommandKind::Help => ui::help(out)?,
            CommandKind::ShowHistory => ui::history(out, &self.conversation, ui::terminal_width())?,
            CommandKind::ClearHistory => {
                self.conversation.clear();
                ui::info(out, "Conversation cleared.")?;
            }
            CommandKind::SaveHistory => self.save(invocation.arg(), out)?,
            CommandKind::LoadHistory => self.load(invocation.arg(), out)?,
            CommandKind::ChatMessage => {
                self.exchange(vec![Turn::user(invocation.argument)], out, cancel)
                    .await?
            }
            CommandKind::ExplainCode => match invocation.arg() {
                Some(code) => {
                    let staged = vec![Turn::user(commands::explain_prompt(code))];
                    self.exchange(staged, out, cancel).await?
                }
                None => self.command_failed(&CommandError::Usage("!explain <code>"), out)?,
            },
            CommandKind::ListProcesses
            | CommandKind::ListDirectory
            | CommandKind::AnalyzeFile
            | CommandKind::RunSystemCommand => self.introspect(&invocation, out, cancel).await?,
        }
        Ok(Outcome::Continue)
    }

    async fn introspect<W: Write + Send>(
        &mut self,
        invocation: &CommandInvocation,
        out: &mut W,
        cancel: &CancellationToken,
    ) -> io::Result<()> {
        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return ui::info(out, "Command cancelled.");
            }
            result = self.executor.run(invocation) => result,
        };
        match output {
            Ok(output) => {
                ui::command_output(out, &output)?;
                let staged = vec![
                    Turn::system(output.to_context()),
                    Turn::user(commands::instruction_for(invocation.kind, &invocation.argument)),
                ];
                self.exchange(staged, out, cancel).await
            }
            Err(e) => self.command_failed(&e, out),
        }
    }

    fn command_failed(&mut self, error: &CommandError, out: &mut impl Write) -> io::Result<()> {
        tracing::warn!(error = %error, "command failed");
        ui::error(out, error)?;
        self.conversation.push(Turn::system(format!("Command failed: {}", error)));
        Ok(())
    }

    fn save(&mut self, name: Option<&str>, out: &mut impl Write) -> io::Result<()> {
        let path = self.sessions.path_for(name);
        match self.conversation.save(&path) {
            Ok(()) => ui::info(
                out,
                &format!("Saved {} turns to {}", self.conversation.len(), path.display()),
            ),
            Err(e) => ui::error(out, &e),
        }
    }

    fn load(&mut self, name: Option<&str>, out: &mut impl Write) -> io::Result<()> {
        let path = self.sessions.path_for(name);
        match self.conversation.restore(&path) {
            Ok(count) => ui::info(out, &format!("Loaded {} turns from {}", count, path.display())),
            Err(e) if e.is_missing() => {
                ui::error(out, &format!("no saved session at {}", path.display()))
            }
            Err(e) => ui::error(out, &e),
        }
    }

    // ───────────────────────────────────────────────────────────
    // Inference
    // ───────────────────────────────────────────────────────────

    /// Send staged turns plus bounded history; commit on success
    async fn exchange<W: Write + Send>(
        &mut self,
        staged: Vec<Turn>,
        out: &mut W,
        cancel: &CancellationToken,
    ) -> io::Result<()> {
        let payload = self.conversation.assemble_payload(&staged);
        let messages = build_messages(self.conversation.preamble(), &payload);
        tracing::debug!(
            turns = payload.len(),
            cost = self.conversation.payload_cost(&payload),
            budget = self.conversation.budget(),
            "sending request"
        );

        let mut reply = self.fetch_reply(&messages, out, cancel).await?;
        if let Reply::Failed {
            error: InferenceError::BackendUnavailable(reason),
            text,
        } = &reply
        {
            if text.is_empty() && self.backend_ready().await {
                tracing::warn!(reason = %reason, "backend unavailable but healthy, retrying once");
                tokio::time::sleep(self.retry_delay).await;
                reply = self.fetch_reply(&messages, out, cancel).await?;
            }
        }

        match reply {
            Reply::Complete { text, finish } => {
                if finish == FinishReason::Length {
                    ui::info(out, "(reply cut off at the token limit)")?;
                }
                self.conversation.extend(staged);
                self.conversation.push(Turn::assistant(text));
            }
            Reply::Cancelled { text } => {
                ui::info(out, "Reply cancelled.")?;
                if self.keep_partial_on_cancel && !text.is_empty() {
                    self.conversation.extend(staged);
                    self.conversation.push(Turn::partial_assistant(text));
                }
            }
            Reply::Failed { error, .. } => {
                tracing::warn!(error = %error, "inference failed");
                ui::error(out, &error)?;
                if let InferenceError::BackendUnavailable(_) = error {
                    if let Some(backend) = self.backend.as_ref() {
                        ui::info(out, &format!("Backend state: {:?}", backend.state()))?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn backend_ready(&mut self) -> bool {
        let status = match self.backend.as_mut() {
            Some(backend) => backend.health_check().await,
            None => self.completer.health().await,
        };
        status == HealthStatus::Ready
    }

    async fn fetch_reply<W: Write + Send>(
        &self,
        messages: &[ChatMessage],
        out: &mut W,
        cancel: &CancellationToken,
    ) -> io::Result<Reply> {
        if self.sampling.stream {
            self.stream_reply(messages, out, cancel).await
        } else {
            self.whole_reply(messages, out, cancel).await
        }
    }

    /// Wait for the complete reply, then print it at once
    async fn whole_reply<W: Write + Send>(
        &self,
        messages: &[ChatMessage],
        out: &mut W,
        cancel: &CancellationToken,
    ) -> io::Result<Reply> {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Reply::Cancelled { text: String::new() }),
            result = self.completer.complete(messages, &self.sampling) => result,
        };
        match result {
            Ok(CompletionResult { text, finish_reason, usage }) => {
                ui::reply_start(out)?;
                ui::reply_fragment(out, &text)?;
                ui::reply_end(out)?;
                tracing::debug!(
                    prompt = usage.prompt_tokens,
                    completion = usage.completion_tokens,
                    finish = ?finish_reason,
                    "reply complete"
                );
                Ok(Reply::Complete { text, finish: finish_reason })
            }
            Err(error) => Ok(Reply::Failed {
                error,
                text: String::new(),
            }),
        }
    }

    /// Stream one reply to `out`, honoring cancellation
    async fn stream_reply<W: Write + Send>(
        &self,
        messages: &[ChatMessage],
        out: &mut W,
        cancel: &CancellationToken,
    ) -> io::Result<Reply> {
        let started = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Reply::Cancelled { text: String::new() }),
            result = self.completer.stream(messages, &self.sampling) => result,
        };
        let mut stream = match started {
            Ok(stream) => stream,
            Err(error) => {
                return Ok(Reply::Failed {
                    error,
                    text: String::new(),
                })
            }
        };

        ui::reply_start(out)?;
        let mut text = String::new();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    stream.cancel();
                    ui::reply_end(out)?;
                    return Ok(Reply::Cancelled { text });
                }
                event = stream.next() => match event {
                    Some(StreamEvent::Token(fragment)) => {
                        ui::reply_fragment(out, &fragment)?;
                        text.push_str(&fragment);
                    }
                    Some(StreamEvent::Done(finish, usage)) => {
                        ui::reply_end(out)?;
                        tracing::debug!(
                            prompt = usage.prompt_tokens,
                            completion = usage.completion_tokens,
                            ?finish,
                            "reply complete"
                        );
                        return Ok(Reply::Complete { text, finish });
                    }
                    Some(StreamEvent::Error(error)) => {
                        ui::reply_end(out)?;
                        return Ok(Reply::Failed { error, text });
                    }
                    None => {
                        ui::reply_end(out)?;
                        return Ok(Reply::Failed {
                            error: InferenceError::MalformedResponse("stream ended early".into()),
                            text,
                        });
                    }
                },
            }
        }
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("conversation", &self.conversation)
            .field("backend", &self.backend)
            .finish()
    }
}
