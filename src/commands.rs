//! Command classification and introspection tools
//!
//! - `!ps`, `!ls`, `!analyze`: gather local system information
//! - `@system <cmd>`: run an arbitrary shell command (privileged, opt-in)
//! - `!explain`, `!save`, `!load`, `!history`, `!clear`, `!help`, `!quit`
//! - anything else is plain chat
//!
//! Tool output is captured, sanitized, truncated, and wrapped as a system
//! turn so the model can explain it.

use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;
use sysinfo::System;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use crate::config::CommandsConfig;
use crate::error::CommandError;
use crate::supervisor::{signal_group, Signal};

/// Marker for introspection commands
pub const COMMAND_PREFIX: char = '!';
/// Marker for raw command execution
pub const SYSTEM_MARKER: &str = "@system";

// ═══════════════════════════════════════════════════════════════
// CLASSIFICATION
// ═══════════════════════════════════════════════════════════════

/// The closed set of things a line of input can mean
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    ChatMessage,
    ListProcesses,
    ListDirectory,
    AnalyzeFile,
    ExplainCode,
    RunSystemCommand,
    SaveHistory,
    LoadHistory,
    ShowHistory,
    ClearHistory,
    Help,
    Quit,
}

impl CommandKind {
    /// Does this command gather output that is folded into the chat?
    pub fn is_introspection(&self) -> bool {
        matches!(
            self,
            CommandKind::ListProcesses
                | CommandKind::ListDirectory
                | CommandKind::AnalyzeFile
                | CommandKind::RunSystemCommand
        )
    }
}

/// Fixed command table: name after `!` → kind
const COMMAND_TABLE: &[(&str, CommandKind)] = &[
    ("ps", CommandKind::ListProcesses),
    ("ls", CommandKind::ListDirectory),
    ("analyze", CommandKind::AnalyzeFile),
    ("explain", CommandKind::ExplainCode),
    ("save", CommandKind::SaveHistory),
    ("load", CommandKind::LoadHistory),
    ("history", CommandKind::ShowHistory),
    ("clear", CommandKind::ClearHistory),
    ("help", CommandKind::Help),
    ("quit", CommandKind::Quit),
    ("exit", CommandKind::Quit),
];

/// One classified input line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInvocation {
    pub kind: CommandKind,
    pub argument: String,
}

impl CommandInvocation {
    fn new(kind: CommandKind, argument: &str) -> Self {
        Self {
            kind,
            argument: argument.trim().to_string(),
        }
    }

    /// Argument, or `None` when empty
    pub fn arg(&self) -> Option<&str> {
        (!self.argument.is_empty()).then_some(self.argument.as_str())
    }
}

/// Classify a line of input. Blank lines yield `None`.
pub fn classify(line: &str) -> Option<CommandInvocation> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if let Some(rest) = line.strip_prefix(SYSTEM_MARKER) {
        // `@systemd` is chat, `@system cmd` is a command
        if rest.is_empty() || rest.starts_with(char::is_whitespace) {
            return Some(CommandInvocation::new(
                CommandKind::RunSystemCommand,
                strip_quotes(rest.trim()),
            ));
        }
    }

    if line.eq_ignore_ascii_case("quit") || line.eq_ignore_ascii_case("exit") {
        return Some(CommandInvocation::new(CommandKind::Quit, ""));
    }

    if let Some(rest) = line.strip_prefix(COMMAND_PREFIX) {
        let (name, argument) = match rest.split_once(char::is_whitespace) {
            Some((name, argument)) => (name, argument),
            None => (rest, ""),
        };
        let name = name.to_ascii_lowercase();
        if let Some((_, kind)) = COMMAND_TABLE.iter().find(|(n, _)| *n == name) {
            return Some(CommandInvocation::new(*kind, argument));
        }
    }

    Some(CommandInvocation::new(CommandKind::ChatMessage, line))
}

/// Remove one layer of matching surrounding quotes
fn strip_quotes(s: &str) -> &str {
    for q in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(q) && s.ends_with(q) {
            return &s[1..s.len() - 1];
        }
    }
    s
}

// ═══════════════════════════════════════════════════════════════
// OUTPUT
// ═══════════════════════════════════════════════════════════════

/// Captured output of an introspection command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// What ran, e.g. "ls -la /tmp" or "read src/main.rs"
    pub description: String,
    pub output: String,
    pub exit_code: Option<i32>,
    pub truncated: bool,
}

impl CommandOutput {
    /// Text of the system turn fed to the model
    pub fn to_context(&self) -> String {
        let status = match self.exit_code {
            Some(code) => format!(" (exit status {})", code),
            None => String::new(),
        };
        let body = if self.output.trim().is_empty() {
            "(no output)"
        } else {
            self.output.as_str()
        };
        let note = if self.truncated { "\n(output truncated)" } else { "" };
        format!(
            "Output of `{}`{}:\n```\n{}\n```{}",
            self.description, status, body, note
        )
    }
}

/// Instruction paired with tool output in the folded request
pub fn instruction_for(kind: CommandKind, argument: &str) -> String {
    match kind {
        CommandKind::ListProcesses => "Above is the current process list sorted by CPU usage. \
            Which processes use the most CPU and what are they doing? \
            Is anything unusual? Summarize the system's resource usage."
            .to_string(),
        CommandKind::ListDirectory => format!(
            "Above is a listing of `{}`. Briefly explain what this directory contains, \
             including file types and permissions.",
            if argument.is_empty() { "." } else { argument }
        ),
        CommandKind::AnalyzeFile => format!(
            "Above is the content of `{}`. Summarize what the file is for, point out key \
             parts or potential problems, and if it is code, explain its logic.",
            Path::new(argument)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| argument.to_string())
        ),
        CommandKind::RunSystemCommand => format!(
            "Above is the output of the command `{}`. Explain what it means.",
            argument
        ),
        _ => "Explain or summarize the output above.".to_string(),
    }
}

/// Wrap a code snippet for `!explain`
pub fn explain_prompt(code: &str) -> String {
    format!(
        "Explain what the following code does:\n\n```\n{}\n```\n\n\
         Cover its overall purpose, the key steps, and any important concepts or libraries it uses.",
        code
    )
}

fn ansi_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07]*\x07").expect("valid ANSI regex")
    })
}

/// Strip terminal escapes and cap the size at `max_chars` characters
pub fn sanitize_output(raw: &str, max_chars: usize) -> (String, bool) {
    let clean = ansi_regex().replace_all(raw, "");
    let clean = clean.trim_end();
    match clean.char_indices().nth(max_chars) {
        Some((cut, _)) => (clean[..cut].to_string(), true),
        None => (clean.to_string(), false),
    }
}

// ═══════════════════════════════════════════════════════════════
// EXECUTION
// ═══════════════════════════════════════════════════════════════

/// Runs introspection commands with the configured limits
#[derive(Debug, Clone)]
pub struct Executor {
    limits: CommandsConfig,
    work_dir: PathBuf,
}

impl Executor {
    pub fn new(limits: CommandsConfig) -> Self {
        Self {
            limits,
            work_dir: PathBuf::from("."),
        }
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    /// Execute a side-effecting command. Non-introspection kinds are a usage error.
    pub async fn run(&self, invocation: &CommandInvocation) -> Result<CommandOutput, CommandError> {
        tracing::info!(kind = ?invocation.kind, argument = %invocation.argument, "running command");
        match invocation.kind {
            CommandKind::ListProcesses => self.list_processes().await,
            CommandKind::ListDirectory => self.list_directory(invocation.arg().unwrap_or(".")).await,
            CommandKind::AnalyzeFile => match invocation.arg() {
                Some(path) => self.read_file(path),
                None => Err(CommandError::Usage("!analyze <file>")),
            },
            CommandKind::RunSystemCommand => match invocation.arg() {
                Some(cmd) => self.run_shell(cmd).await,
                None => Err(CommandError::Usage("@system <command>")),
            },
            _ => Err(CommandError::Usage("not an introspection command")),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.work_dir.join(p)
        }
    }

    /// Top processes by CPU, sampled twice so usage figures are meaningful
    async fn list_processes(&self) -> Result<CommandOutput, CommandError> {
        let limit = self.limits.ps_limit;
        let table = tokio::task::spawn_blocking(move || {
            let mut sys = System::new();
            sys.refresh_processes();
            std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
            sys.refresh_processes();
            sys.refresh_memory();
            format_process_table(&sys, limit)
        })
        .await
        .map_err(|e| CommandError::Io {
            command: "ps".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::Other, e),
        })?;

        let (output, truncated) = sanitize_output(&table, self.limits.max_output_chars);
        Ok(CommandOutput {
            description: format!("ps (top {} by CPU)", limit),
            output,
            exit_code: None,
            truncated,
        })
    }

    async fn list_directory(&self, path: &str) -> Result<CommandOutput, CommandError> {
        let resolved = self.resolve(path);
        match std::fs::metadata(&resolved) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CommandError::NotFound(PathBuf::from(path)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(CommandError::PermissionDenied(PathBuf::from(path)))
            }
            Err(e) => {
                return Err(CommandError::Io {
                    command: format!("ls -la {}", path),
                    source: e,
                })
            }
        }

        let mut command = Command::new("ls");
        command.arg("-la").arg("--").arg(&resolved);
        let mut out = self.capture(command, &format!("ls -la {}", path)).await?;
        if out.exit_code != Some(0) {
            if out.output.contains("Permission denied") {
                return Err(CommandError::PermissionDenied(PathBuf::from(path)));
            }
            return Err(CommandError::ExecutionFailed {
                command: out.description,
                status: exit_label(out.exit_code),
                output: out.output,
            });
        }
        out.exit_code = None;
        Ok(out)
    }

    /// Read the head of a file (at most `max_file_bytes`)
    fn read_file(&self, path: &str) -> Result<CommandOutput, CommandError> {
        use std::io::Read;

        let resolved = self.resolve(path);
        if !resolved.is_file() {
            return Err(CommandError::NotFound(PathBuf::from(path)));
        }
        let file = std::fs::File::open(&resolved).map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => CommandError::PermissionDenied(PathBuf::from(path)),
            _ => CommandError::Io {
                command: format!("read {}", path),
                source: e,
            },
        })?;

        let limit = self.limits.max_file_bytes;
        let mut buf = Vec::with_capacity(limit.min(64 * 1024));
        file.take(limit as u64 + 1)
            .read_to_end(&mut buf)
            .map_err(|e| CommandError::Io {
                command: format!("read {}", path),
                source: e,
            })?;
        let file_truncated = buf.len() > limit;
        buf.truncate(limit);

        let text = String::from_utf8_lossy(&buf);
        let (output, truncated) = sanitize_output(&text, self.limits.max_output_chars);
        Ok(CommandOutput {
            description: format!("read {}", path),
            output,
            exit_code: None,
            truncated: truncated || file_truncated,
        })
    }

    /// Run `sh -c <cmd>`; a non-zero exit is an error carrying the output
    async fn run_shell(&self, cmd: &str) -> Result<CommandOutput, CommandError> {
        let mut command = Command::new("sh");
        command.arg("-c").arg(cmd);
        let out = self.capture(command, cmd).await?;
        match out.exit_code {
            Some(0) => Ok(out),
            code => Err(CommandError::ExecutionFailed {
                command: cmd.to_string(),
                status: exit_label(code),
                output: out.output,
            }),
        }
    }

    /// Spawn, capture stdout+stderr, enforce the timeout
    async fn capture(&self, mut command: Command, description: &str) -> Result<CommandOutput, CommandError> {
        command
            .current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own group so a timeout also takes down pipelines and background jobs
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| CommandError::Io {
            command: description.to_string(),
            source,
        })?;
        let pid = child.id();

        // Anything past this many bytes would be cut by sanitize_output anyway
        let limit = self.limits.max_output_chars.saturating_mul(4);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let read_all = async {
            let ((out, out_dropped), (err, err_dropped)) =
                tokio::try_join!(read_bounded(stdout, limit), read_bounded(stderr, limit))?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((out, err, out_dropped || err_dropped, status))
        };

        let timeout: Duration = self.limits.timeout();
        let (out, err, dropped, status) = match tokio::time::timeout(timeout, read_all).await {
            Ok(result) => result.map_err(|source| CommandError::Io {
                command: description.to_string(),
                source,
            })?,
            Err(_) => {
                signal_group(pid, Signal::Kill);
                return Err(CommandError::Timeout {
                    command: description.to_string(),
                    timeout,
                });
            }
        };

        let mut combined = String::from_utf8_lossy(&out).to_string();
        let stderr_text = String::from_utf8_lossy(&err);
        if !stderr_text.trim().is_empty() {
            if !combined.trim().is_empty() {
                combined.push_str("\n[stderr]\n");
            }
            combined.push_str(&stderr_text);
        }

        let (output, cut) = sanitize_output(&combined, self.limits.max_output_chars);
        tracing::debug!(command = description, code = ?status.code(), bytes = combined.len(), dropped, "command finished");
        Ok(CommandOutput {
            description: description.to_string(),
            output,
            exit_code: status.code(),
            truncated: cut || dropped,
        })
    }
}

/// Read a pipe to EOF, keeping at most `limit` bytes. The rest is drained
/// and discarded so the writer never blocks. Returns whether bytes were dropped.
async fn read_bounded<R>(reader: Option<R>, limit: usize) -> std::io::Result<(Vec<u8>, bool)>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok((Vec::new(), false));
    };
    let mut kept = Vec::new();
    let mut dropped = false;
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let room = limit.saturating_sub(kept.len());
        if n > room {
            dropped = true;
        }
        kept.extend_from_slice(&chunk[..n.min(room)]);
    }
    Ok((kept, dropped))
}

fn exit_label(code: Option<i32>) -> String {
    match code {
        Some(c) => format!("exit status {}", c),
        None => "signal".to_string(),
    }
}

fn format_process_table(sys: &System, limit: usize) -> String {
    let mut procs: Vec<_> = sys.processes().values().collect();
    procs.sort_by(|a, b| {
        b.cpu_usage()
            .partial_cmp(&a.cpu_usage())
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let total_mem = sys.total_memory().max(1) as f64;
    let mut table = format!("{:>8} {:>6} {:>6} {:>10}  {}\n", "PID", "%CPU", "%MEM", "RSS(KiB)", "COMMAND");
    for p in procs.into_iter().take(limit) {
        let cmd = if p.cmd().is_empty() {
            p.name().to_string()
        } else {
            p.cmd().join(" ")
        };
        table.push_str(&format!(
            "{:>8} {:>6.1} {:>6.1} {:>10}  {}\n",
            p.pid().as_u32(),
            p.cpu_usage(),
            p.memory() as f64 / total_mem * 100.0,
            p.memory() / 1024,
            cmd
        ));
    }
    table
}
