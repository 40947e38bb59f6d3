//! User Story Integration Tests
//!
//! These tests trace complete user workflows with logging to verify
//! the system behaves correctly from the user's perspective.
//!
//! Each test represents a real user story:
//! - "As a user, I want to..."
//! - Tests verify the expected output/behavior
//! - Fake llama-server endpoints are axum routers on ephemeral ports

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::http::header;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use shellmind::client::InferenceClient;
use shellmind::commands::{classify, CommandKind, Executor};
use shellmind::config::{ClientConfig, Config, HealthPolicy};
use shellmind::conversation::{list_saved, Conversation, Role, Turn};
use shellmind::error::StartupError;
use shellmind::session::{Outcome, SessionContext};
use shellmind::supervisor::{BackendProcess, BackendState};

/// Test helper to capture and display trace logs
struct TestTracer {
    name: String,
    logs: Vec<String>,
}

impl TestTracer {
    fn new(name: &str) -> Self {
        eprintln!("\n╔═══════════════════════════════════════════════════════════════");
        eprintln!("║ USER STORY: {}", name);
        eprintln!("╚═══════════════════════════════════════════════════════════════\n");
        Self {
            name: name.to_string(),
            logs: vec![],
        }
    }

    fn step(&mut self, description: &str) {
        let msg = format!("  → {}", description);
        eprintln!("{}", msg);
        self.logs.push(msg);
    }

    fn expect(&mut self, condition: bool, description: &str) {
        let status = if condition { "✓" } else { "✗" };
        let msg = format!("    {} {}", status, description);
        eprintln!("{}", msg);
        self.logs.push(msg);
        assert!(condition, "FAILED: {}", description);
    }

    fn done(&self) {
        eprintln!("\n  ══════════════════════════════════════════════════════");
        eprintln!("  ✓ Story completed: {} ({} log lines)", self.name, self.logs.len());
        eprintln!();
    }
}

// ═══════════════════════════════════════════════════════════════
// FAKE BACKEND
// ═══════════════════════════════════════════════════════════════

/// Records every request body it receives and streams a fixed reply
#[derive(Clone, Default)]
struct FakeLlama {
    requests: Arc<Mutex<Vec<Value>>>,
}

impl FakeLlama {
    async fn serve(&self, reply: &'static [&'static str]) -> u16 {
        let requests = self.requests.clone();
        let app = Router::new()
            .route("/health", get(|| async { Json(serde_json::json!({"status": "ok"})) }))
            .route(
                "/v1/chat/completions",
                post(move |Json(body): Json<Value>| {
                    let requests = requests.clone();
                    async move {
                        requests.lock().unwrap().push(body);
                        ([(header::CONTENT_TYPE, "text/event-stream")], sse_body(reply))
                    }
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        port
    }

    fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }
}

fn sse_body(tokens: &[&str]) -> String {
    let mut body = String::new();
    for t in tokens {
        body.push_str(&format!(
            "data: {}\n\n",
            serde_json::json!({"choices":[{"delta":{"content":t},"finish_reason":null}]})
        ));
    }
    body.push_str("data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n");
    body.push_str("data: [DONE]\n\n");
    body
}

fn test_config(dir: &Path, port: u16) -> Config {
    let mut config = Config::default();
    config.backend.host = "127.0.0.1".into();
    config.backend.port = port;
    config.backend.model_path = dir.join("model.gguf");
    config.sessions.dir = dir.join("sessions");
    config.client.request_timeout_secs = 5;
    config
}

fn fast_policy() -> HealthPolicy {
    HealthPolicy {
        max_attempts: 20,
        initial_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(100),
        max_wait: Duration::from_secs(3),
        probe_timeout: Duration::from_millis(300),
        stop_grace: Duration::from_secs(2),
    }
}

async fn say(session: &mut SessionContext, line: &str) -> (Outcome, String) {
    let mut out = Vec::new();
    let outcome = session
        .handle_line(line, &mut out, &CancellationToken::new())
        .await
        .unwrap();
    (outcome, String::from_utf8_lossy(&out).to_string())
}

fn messages(request: &Value) -> Vec<(String, String)> {
    request["messages"]
        .as_array()
        .map(|msgs| {
            msgs.iter()
                .map(|m| {
                    (
                        m["role"].as_str().unwrap_or_default().to_string(),
                        m["content"].as_str().unwrap_or_default().to_string(),
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}

// ═══════════════════════════════════════════════════════════════
// STORY: User types different kinds of input
// ═══════════════════════════════════════════════════════════════

#[test]
fn story_input_is_classified() {
    let mut t = TestTracer::new("Every input line maps to exactly one command kind");

    t.step("Given a mix of chat, commands and lookalikes");
    let cases = [
        ("what is a zombie process?", CommandKind::ChatMessage),
        ("!ps", CommandKind::ListProcesses),
        ("!LS /tmp", CommandKind::ListDirectory),
        ("!analyze Cargo.toml", CommandKind::AnalyzeFile),
        ("!explain let x = 1;", CommandKind::ExplainCode),
        ("@system df -h", CommandKind::RunSystemCommand),
        ("!save", CommandKind::SaveHistory),
        ("!load work", CommandKind::LoadHistory),
        ("!nonsense", CommandKind::ChatMessage),
        ("quit", CommandKind::Quit),
    ];

    for (line, expected) in cases {
        t.step(&format!("When classifying {:?}", line));
        let kind = classify(line).map(|c| c.kind);
        t.expect(kind == Some(expected), &format!("{:?} is {:?}", line, expected));
    }

    t.step("When the line is blank");
    t.expect(classify("  \t ").is_none(), "Blank input is ignored");

    t.done();
}

// ═══════════════════════════════════════════════════════════════
// STORY: Long conversations stay within the context window
// ═══════════════════════════════════════════════════════════════

#[test]
fn story_long_conversation_evicts_oldest() {
    let mut t = TestTracer::new("Payload stays within budget and keeps the newest turns");

    t.step("Given a conversation with a small budget and twenty exchanges");
    let mut conv = Conversation::new(200).with_preamble("You are terse.");
    for i in 0..20 {
        conv.push(Turn::user(format!("question number {} about the system", i)));
        conv.push(Turn::assistant(format!("answer number {} with some detail", i)));
    }

    t.step("When the next question is staged");
    let pending = [Turn::user("and the final question?")];
    let payload = conv.assemble_payload(&pending);

    t.expect(
        conv.payload_cost(&payload) <= conv.budget(),
        "Assembled payload fits the budget",
    );
    t.expect(
        payload.last().map(|turn| turn.text.as_str()) == Some("and the final question?"),
        "Newest user turn is always sent",
    );
    t.expect(payload.len() < 41, "Oldest turns were evicted");
    t.expect(
        payload.iter().all(|turn| !turn.text.contains("number 0 ")),
        "The very first exchange is gone",
    );
    t.expect(conv.len() == 40, "History itself is untouched");

    t.done();
}

// ═══════════════════════════════════════════════════════════════
// STORY: User chats with a running backend
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn story_chat_streams_and_remembers() {
    let mut t = TestTracer::new("Chat reply is streamed, shown and remembered");

    t.step("Given a fake llama-server answering every request");
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeLlama::default();
    let port = fake.serve(&["A zombie ", "is a finished ", "child."]).await;
    let config = test_config(dir.path(), port);
    let client = InferenceClient::new(config.backend.base_url(), &ClientConfig { request_timeout_secs: 5 });
    let mut session = SessionContext::new(&config, client);

    t.step("When the user asks a question");
    let (outcome, shown) = say(&mut session, "what is a zombie process?").await;

    t.expect(outcome == Outcome::Continue, "Loop continues");
    t.expect(shown.contains("A zombie is a finished child."), "Fragments rendered in order");
    let turns = session.conversation().turns();
    t.expect(turns.len() == 2, "User and assistant turns committed");
    t.expect(turns[1].role == Role::Assistant, "Second turn is the reply");

    t.step("When the user asks a follow-up");
    say(&mut session, "how do I get rid of one?").await;
    let requests = fake.requests();
    let second = messages(&requests[1]);
    t.expect(second[0].0 == "system", "Preamble goes first");
    t.expect(
        second.iter().any(|(_, c)| c == "what is a zombie process?"),
        "Earlier question is part of the context",
    );
    t.expect(
        second.last().map(|(_, c)| c.as_str()) == Some("how do I get rid of one?"),
        "Follow-up is the last message",
    );
    t.expect(requests[1]["stream"] == Value::Bool(true), "Request asks for streaming");

    t.done();
}

// ═══════════════════════════════════════════════════════════════
// STORY: User asks about command output
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn story_system_command_is_explained() {
    let mut t = TestTracer::new("@system output is folded into the next request");

    t.step("Given a session against a fake backend");
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeLlama::default();
    let port = fake.serve(&["It printed a greeting."]).await;
    let config = test_config(dir.path(), port);
    let client = InferenceClient::new(config.backend.base_url(), &config.client);
    let mut session = SessionContext::new(&config, client)
        .with_executor(Executor::new(config.commands.clone()).with_work_dir(dir.path()));

    t.step("When the user runs @system \"echo hi\"");
    let (_, shown) = say(&mut session, "@system \"echo hi\"").await;

    t.expect(shown.contains("echo hi"), "Command is echoed to the user");
    t.expect(shown.contains("It printed a greeting."), "Explanation is streamed");
    let request = messages(&fake.requests()[0]);
    t.expect(
        request.iter().any(|(role, c)| role == "system" && c.contains("\nhi\n")),
        "Command output reaches the model as a system message",
    );

    t.step("When the user lists a directory that does not exist");
    let before = fake.requests().len();
    let (_, shown) = say(&mut session, "!ls /nonexistent/for/sure").await;
    t.expect(shown.contains("not found"), "NotFound is reported");
    t.expect(fake.requests().len() == before, "No inference request was made");
    t.expect(
        session.conversation().turns().last().map(|turn| turn.role) == Some(Role::System),
        "Failure is recorded as a system turn",
    );

    t.step("When the user keeps chatting");
    let (outcome, shown) = say(&mut session, "ok, what else?").await;
    t.expect(outcome == Outcome::Continue, "Session is still active");
    t.expect(shown.contains("It printed a greeting."), "Next chat still gets a reply");
    t.expect(fake.requests().len() == before + 1, "Chat reached the backend");

    t.done();
}

// ═══════════════════════════════════════════════════════════════
// STORY: User saves and resumes a conversation
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn story_save_and_resume() {
    let mut t = TestTracer::new("Conversation survives a restart");

    t.step("Given a conversation with one exchange");
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeLlama::default();
    let port = fake.serve(&["pong"]).await;
    let config = test_config(dir.path(), port);
    let mut session = SessionContext::new(&config, InferenceClient::new(config.backend.base_url(), &config.client));
    say(&mut session, "ping").await;

    t.step("When the user saves it under a name");
    let (_, shown) = say(&mut session, "!save morning").await;
    t.expect(shown.contains("Saved 2 turns"), "Save is confirmed");
    let listed = list_saved(&config.sessions.dir);
    t.expect(listed.len() == 1 && listed[0].name == "morning", "Session is listed");

    t.step("When a new session loads it");
    let mut fresh = SessionContext::new(&config, InferenceClient::new(config.backend.base_url(), &config.client));
    say(&mut fresh, "!load morning").await;
    let turns = fresh.conversation().turns();
    t.expect(turns.len() == 2, "Both turns restored");
    t.expect(turns[0].text == "ping" && turns[1].text == "pong", "Content and order preserved");

    t.step("When a corrupt file is loaded");
    std::fs::write(config.sessions.dir.join("broken.json"), "{ not json").unwrap();
    let (_, shown) = say(&mut fresh, "!load broken").await;
    t.expect(shown.contains("not a valid session file"), "Corruption is reported");
    t.expect(fresh.conversation().len() == 2, "History is unchanged");

    t.expect(fake.requests().len() == 1, "Save and load never call the model");

    t.done();
}

// ═══════════════════════════════════════════════════════════════
// STORY: Backend lifecycle
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn story_missing_model_is_explained() {
    let mut t = TestTracer::new("Startup fails clearly when the model file is missing");

    t.step("Given a config pointing at a model that does not exist");
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), 1);
    config.backend.server_path = dir.path().join("llama-server");
    std::fs::write(&config.backend.server_path, "").unwrap();

    t.step("When the backend is started");
    let err = BackendProcess::start(&config.backend, &fast_policy())
        .await
        .unwrap_err();

    t.expect(matches!(err, StartupError::ModelMissing { .. }), "ModelMissing is returned");
    t.expect(err.to_string().contains("model.gguf"), "Message names the missing path");

    t.done();
}

#[cfg(unix)]
#[tokio::test]
async fn story_supervised_session_end_to_end() {
    use std::os::unix::fs::PermissionsExt;

    let mut t = TestTracer::new("Start backend, chat, quit, backend is stopped");

    t.step("Given a fake llama-server binary and an HTTP endpoint on its port");
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeLlama::default();
    let port = fake.serve(&["ready when you are"]).await;
    let mut config = test_config(dir.path(), port);
    config.backend.server_path = dir.path().join("llama-server");
    std::fs::write(&config.backend.server_path, "#!/bin/sh\nexec sleep 30\n").unwrap();
    std::fs::set_permissions(&config.backend.server_path, std::fs::Permissions::from_mode(0o755)).unwrap();
    std::fs::write(&config.backend.model_path, b"GGUF").unwrap();

    t.step("When the supervisor starts it");
    let backend = BackendProcess::start(&config.backend, &fast_policy()).await.unwrap();
    t.expect(backend.state() == BackendState::Ready, "Backend is Ready");
    t.expect(backend.pid().is_some(), "Process id is known");

    let client = InferenceClient::new(backend.base_url(), &config.client);
    let mut session = SessionContext::new(&config, client).with_backend(backend);

    t.step("When the user chats and quits");
    let (_, shown) = say(&mut session, "hello").await;
    t.expect(shown.contains("ready when you are"), "Reply is shown");
    let (outcome, _) = say(&mut session, "!quit").await;
    t.expect(outcome == Outcome::Quit, "Quit ends the loop");

    t.step("When the session shuts down");
    session.shutdown().await;
    t.expect(
        session.backend().map(|b| b.state()) == Some(BackendState::Stopped),
        "Backend is Stopped",
    );
    session.shutdown().await;
    t.expect(
        session.backend().map(|b| b.state()) == Some(BackendState::Stopped),
        "Second shutdown is a no-op",
    );

    t.done();
}
