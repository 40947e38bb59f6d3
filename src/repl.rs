//! Interactive chat loop
//!
//! Starts the backend, restores the default session, then reads lines from
//! stdin until EOF or `!quit`. Ctrl-C cancels the reply in progress; at the
//! prompt it only prints a hint.

use anyhow::{Context, Result};
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::client::InferenceClient;
use crate::config::Config;
use crate::session::{Outcome, SessionContext};
use crate::supervisor::BackendProcess;
use crate::ui;

/// Token swapped in for each line; the Ctrl-C handler cancels whichever is current
#[derive(Clone, Default)]
struct Interrupts {
    current: Arc<Mutex<CancellationToken>>,
}

impl Interrupts {
    fn install(&self) -> Result<()> {
        let current = self.current.clone();
        ctrlc::set_handler(move || {
            if let Ok(token) = current.lock() {
                token.cancel();
            }
        })
        .context("Failed to install Ctrl-C handler")
    }

    fn fresh(&self) -> CancellationToken {
        let token = CancellationToken::new();
        if let Ok(mut current) = self.current.lock() {
            *current = token.clone();
        }
        token
    }
}

/// Run an interactive session until the user quits
pub async fn run(config: Config) -> Result<()> {
    let mut stdout = io::stdout();
    let interrupts = Interrupts::default();
    interrupts.install()?;

    ui::info(
        &mut stdout,
        &format!("Starting llama-server with {} ...", config.backend.model_path.display()),
    )?;
    let startup = interrupts.fresh();
    let policy = config.health.policy();
    let backend = tokio::select! {
        _ = startup.cancelled() => anyhow::bail!("Interrupted while starting the backend"),
        result = BackendProcess::start(&config.backend, &policy) => {
            result.context("Could not start the inference backend")?
        }
    };
    tracing::info!(pid = ?backend.pid(), address = %backend.address(), "backend ready");

    let client = InferenceClient::new(backend.base_url(), &config.client);
    let model_name = config
        .backend
        .model_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    ui::banner(&mut stdout, &model_name, &backend.address())?;

    let mut session = SessionContext::new(&config, client).with_backend(backend);
    session.autoload(&mut stdout)?;

    let result = chat_loop(&mut session, &interrupts, &mut stdout).await;

    session.autosave(&mut stdout)?;
    session.shutdown().await;
    result
}

async fn chat_loop(
    session: &mut SessionContext,
    interrupts: &Interrupts,
    stdout: &mut io::Stdout,
) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        ui::prompt(stdout)?;
        let token = interrupts.fresh();
        let line = tokio::select! {
            _ = token.cancelled() => {
                writeln!(stdout)?;
                ui::info(stdout, "(Ctrl-C only stops a reply; type !quit to leave)")?;
                continue;
            }
            line = lines.next_line() => line.context("Failed to read input")?,
        };
        let Some(line) = line else {
            writeln!(stdout)?;
            break;
        };

        // Reply streaming uses a token of its own so a stale Ctrl-C does not leak in
        let token = interrupts.fresh();
        match session.handle_line(&line, stdout, &token).await? {
            Outcome::Quit => break,
            Outcome::Continue => {}
        }
    }
    Ok(())
}
