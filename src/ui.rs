//! Terminal rendering
//!
//! Line-oriented output for the chat loop:
//! - banner and help
//! - streamed assistant replies
//! - command output previews and history listings
//! - system notes and errors
//!
//! Everything writes to a caller-supplied `Write` so the session can be
//! driven against a buffer in tests.

use crossterm::style::Stylize;
use std::io::{self, Write};

use crate::commands::CommandOutput;
use crate::conversation::Conversation;

/// Lines of command output echoed before the model's explanation
const PREVIEW_LINES: usize = 12;

/// Fallback width when the terminal size is unknown
const DEFAULT_WIDTH: usize = 100;

pub fn terminal_width() -> usize {
    crossterm::terminal::size()
        .map(|(cols, _)| cols as usize)
        .unwrap_or(DEFAULT_WIDTH)
        .max(40)
}

// ═══════════════════════════════════════════════════════════════
// BANNER / HELP
// ═══════════════════════════════════════════════════════════════

pub fn banner(out: &mut impl Write, model: &str, address: &str) -> io::Result<()> {
    writeln!(out, "{}", "shellmind".bold().cyan())?;
    writeln!(out, "{} {}", "model:".dark_grey(), model)?;
    writeln!(out, "{} {}", "backend:".dark_grey(), address)?;
    writeln!(out, "{}", "Type !help for commands, !quit to leave.".dark_grey())?;
    writeln!(out)
}

const HELP: &[(&str, &str)] = &[
    ("!ps", "show the busiest processes and explain them"),
    ("!ls [path]", "list a directory and explain it"),
    ("!analyze <file>", "read a file and explain it"),
    ("!explain <code>", "explain a code snippet"),
    ("@system <cmd>", "run a shell command and explain its output"),
    ("!save [name]", "save the conversation"),
    ("!load [name]", "load a saved conversation"),
    ("!history", "list the turns in this conversation"),
    ("!clear", "forget the conversation"),
    ("!help", "show this help"),
    ("!quit", "leave (also: exit, quit)"),
];

pub fn help(out: &mut impl Write) -> io::Result<()> {
    writeln!(out, "{}", "Commands:".bold())?;
    for (usage, what) in HELP {
        writeln!(out, "  {:<18} {}", usage.cyan(), what)?;
    }
    writeln!(out, "{}", "Anything else is sent to the model. Ctrl-C stops a reply.".dark_grey())
}

pub fn prompt(out: &mut impl Write) -> io::Result<()> {
    write!(out, "{} ", ">".green().bold())?;
    out.flush()
}

// ═══════════════════════════════════════════════════════════════
// REPLIES
// ═══════════════════════════════════════════════════════════════

pub fn reply_start(out: &mut impl Write) -> io::Result<()> {
    write!(out, "{} ", "assistant:".magenta().bold())?;
    out.flush()
}

pub fn reply_fragment(out: &mut impl Write, text: &str) -> io::Result<()> {
    write!(out, "{}", text)?;
    out.flush()
}

pub fn reply_end(out: &mut impl Write) -> io::Result<()> {
    writeln!(out)?;
    writeln!(out)
}

// ═══════════════════════════════════════════════════════════════
// NOTES
// ═══════════════════════════════════════════════════════════════

pub fn info(out: &mut impl Write, text: &str) -> io::Result<()> {
    writeln!(out, "{}", text.dark_grey())
}

pub fn warn(out: &mut impl Write, text: &str) -> io::Result<()> {
    writeln!(out, "{} {}", "warning:".yellow().bold(), text)
}

pub fn error(out: &mut impl Write, err: &dyn std::fmt::Display) -> io::Result<()> {
    writeln!(out, "{} {}", "error:".red().bold(), err)
}

/// Echo the head of a command's output
pub fn command_output(out: &mut impl Write, output: &CommandOutput) -> io::Result<()> {
    writeln!(out, "{} {}", "$".dark_grey(), output.description.as_str().bold())?;
    let lines: Vec<&str> = output.output.lines().collect();
    for line in lines.iter().take(PREVIEW_LINES) {
        writeln!(out, "  {}", line)?;
    }
    if lines.len() > PREVIEW_LINES {
        writeln!(out, "  {}", format!("... {} more lines", lines.len() - PREVIEW_LINES).dark_grey())?;
    }
    if output.truncated {
        writeln!(out, "  {}", "(output truncated)".dark_grey())?;
    }
    writeln!(out)
}

pub fn history(out: &mut impl Write, conversation: &Conversation, width: usize) -> io::Result<()> {
    if conversation.is_empty() {
        return info(out, "(no turns yet)");
    }
    for line in conversation.summary_lines(width) {
        writeln!(out, "{}", line)?;
    }
    let payload = conversation.assemble_payload(&[]);
    info(
        out,
        &format!(
            "{} turns, {} fit in the next request (~{} of {} tokens)",
            conversation.len(),
            payload.len(),
            conversation.payload_cost(&payload),
            conversation.budget()
        ),
    )
}
