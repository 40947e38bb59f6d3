//! Error taxonomy
//!
//! - `StartupError`: backend could not be brought up (fatal for the session)
//! - `InferenceError`: one completion request failed (recovered per turn)
//! - `CommandError`: an introspection / system command failed (recovered per turn)
//! - `PersistError`: saving or loading a session file failed

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failures while launching the inference server.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("llama-server binary not found at {} (set `backend.server_path` or --server)", .path.display())]
    BinaryMissing { path: PathBuf },

    #[error("model file not found at {} (set `backend.model_path` or --model)", .path.display())]
    ModelMissing { path: PathBuf },

    #[error("backend did not become healthy after {attempts} probes over {:.1}s", .waited.as_secs_f64())]
    Timeout { attempts: u32, waited: Duration },

    #[error("failed to launch {}: {source}", .path.display())]
    SpawnFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("backend exited during startup ({status}){}", stderr_hint(.stderr_tail))]
    Exited {
        status: String,
        stderr_tail: Vec<String>,
    },
}

fn stderr_hint(lines: &[String]) -> String {
    match lines.last() {
        Some(last) => format!(": {}", last),
        None => String::new(),
    }
}

/// Failures of a single completion request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InferenceError {
    #[error("inference request timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("malformed response from backend: {0}")]
    MalformedResponse(String),

    #[error("backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

/// Failures of introspection and raw system commands.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("`{command}` failed with {status}:\n{output}")]
    ExecutionFailed {
        command: String,
        status: String,
        output: String,
    },

    #[error("not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("permission denied: {}", .0.display())]
    PermissionDenied(PathBuf),

    #[error("`{command}` timed out after {}s", .timeout.as_secs())]
    Timeout { command: String, timeout: Duration },

    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("could not run `{command}`: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Failures of session persistence.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("failed to read {}: {source}", .path.display())]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {}: {source}", .path.display())]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} is not a valid session file: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },
}

impl PersistError {
    pub fn is_missing(&self) -> bool {
        matches!(self, PersistError::ReadFailed { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}
