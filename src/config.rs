//! Configuration management with XDG paths
//!
//! ~/.config/shellmind/config.json        - backend, sampling, budget settings
//! ~/.local/share/shellmind/models/       - default model location
//! ~/.local/state/shellmind/sessions/     - saved conversations

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_NAME: &str = "shellmind";

pub const DEFAULT_MODEL_FILE: &str = "qwen1_5-1_8b-chat-q4_k_m.gguf";
pub const DEFAULT_SESSION_NAME: &str = "chat_history";

/// Get config directory (~/.config/shellmind/)
pub fn config_dir() -> Result<PathBuf> {
    let base = dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .context("Could not determine config directory")?;
    Ok(base.join(APP_NAME))
}

/// Get data directory (~/.local/share/shellmind/)
pub fn data_dir() -> Result<PathBuf> {
    let base = dirs::data_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".local/share")))
        .context("Could not determine data directory")?;
    Ok(base.join(APP_NAME))
}

/// Get state directory (~/.local/state/shellmind/)
pub fn state_dir() -> Result<PathBuf> {
    let base = dirs::state_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".local/state")))
        .context("Could not determine state directory")?;
    Ok(base.join(APP_NAME))
}

/// Get config file path
pub fn config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.json"))
}

fn fallback_dir(dir: Result<PathBuf>) -> PathBuf {
    dir.unwrap_or_else(|_| PathBuf::from(".").join(APP_NAME))
}

// ═══════════════════════════════════════════════════════════════
// SECTIONS
// ═══════════════════════════════════════════════════════════════

/// How the llama-server process is launched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub server_path: PathBuf,
    pub model_path: PathBuf,
    pub host: String,
    pub port: u16,
    /// Context window passed to the server (`-c`)
    pub context_size: u32,
    /// CPU threads (`-t`)
    pub threads: u32,
    /// Layers offloaded to GPU (`-ngl`), 0 = CPU only
    pub gpu_layers: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        let data = fallback_dir(data_dir());
        Self {
            server_path: data.join("llama.cpp/build/bin/llama-server"),
            model_path: data.join("models").join(DEFAULT_MODEL_FILE),
            host: "127.0.0.1".to_string(),
            port: 8080,
            context_size: 2048,
            threads: default_threads(),
            gpu_layers: 0,
        }
    }
}

fn default_threads() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(4)
}

impl BackendConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Health polling during startup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_wait_secs: u64,
    pub probe_timeout_ms: u64,
    pub stop_grace_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_attempts: 60,
            initial_delay_ms: 250,
            max_delay_ms: 2000,
            max_wait_secs: 60,
            probe_timeout_ms: 2000,
            stop_grace_secs: 5,
        }
    }
}

impl HealthConfig {
    pub fn policy(&self) -> HealthPolicy {
        HealthPolicy {
            max_attempts: self.max_attempts.max(1),
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms.max(self.initial_delay_ms)),
            max_wait: Duration::from_secs(self.max_wait_secs),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            stop_grace: Duration::from_secs(self.stop_grace_secs),
        }
    }
}

/// Resolved health polling parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_wait: Duration,
    pub probe_timeout: Duration,
    pub stop_grace: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        HealthConfig::default().policy()
    }
}

/// Sampling options sent with each completion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    pub stream: bool,
}

impl Default for SamplingOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 512,
            stream: true,
        }
    }
}

/// Inference client settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub request_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 120,
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

/// Conversation budget and persona
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Token budget for the assembled payload. Defaults to
    /// `context_size - max_tokens` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_budget: Option<usize>,
    pub system_prompt: String,
    pub keep_partial_on_cancel: bool,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            context_budget: None,
            system_prompt: "You are a command-line assistant running on Linux. \
                You help the user understand command output, analyze files and explain code. \
                Keep answers short and clear."
                .to_string(),
            keep_partial_on_cancel: false,
        }
    }
}

/// Limits for introspection commands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    pub timeout_secs: u64,
    pub max_output_chars: usize,
    pub max_file_bytes: usize,
    pub ps_limit: usize,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_output_chars: 4000,
            max_file_bytes: 4096,
            ps_limit: 15,
        }
    }
}

impl CommandsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

/// Where sessions are saved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    pub dir: PathBuf,
    pub default_name: String,
    pub autoload: bool,
    pub autosave: bool,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            dir: fallback_dir(state_dir()).join("sessions"),
            default_name: DEFAULT_SESSION_NAME.to_string(),
            autoload: true,
            autosave: true,
        }
    }
}

impl SessionsConfig {
    /// Resolve `!save [name]` / `!load [name]` to a file path.
    /// Names with more than one path component are used as given; bare
    /// names live in the sessions directory, `.json` added when missing.
    pub fn path_for(&self, name: Option<&str>) -> PathBuf {
        let name = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.default_name);
        let candidate = Path::new(name);
        if candidate.components().count() > 1 {
            candidate.to_path_buf()
        } else if name.ends_with(".json") {
            self.dir.join(name)
        } else {
            self.dir.join(format!("{}.json", name))
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// CONFIG
// ═══════════════════════════════════════════════════════════════

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: BackendConfig,
    pub health: HealthConfig,
    pub sampling: SamplingOptions,
    pub client: ClientConfig,
    pub conversation: ConversationConfig,
    pub commands: CommandsConfig,
    pub sessions: SessionsConfig,
}

impl Config {
    /// Load config from a specific file and apply environment overrides
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = Self::load_file(path)?;
        config.apply_env();
        Ok(config)
    }

    /// File contents only; a missing file yields defaults
    pub fn load_file(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            Config::default()
        };
        Ok(config)
    }

    /// Save config atomically (temp file + rename)
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let tmp_path = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(self)?;
        fs::write(&tmp_path, &content)
            .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
        fs::rename(&tmp_path, path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Environment variables take precedence over the file
    fn apply_env(&mut self) {
        if let Some(model) = non_empty_env("SHELLMIND_MODEL") {
            self.backend.model_path = PathBuf::from(model);
        }
        if let Some(server) = non_empty_env("SHELLMIND_SERVER") {
            self.backend.server_path = PathBuf::from(server);
        }
    }

    /// Effective token budget for assembled payloads
    pub fn context_budget(&self) -> usize {
        self.conversation.context_budget.unwrap_or_else(|| {
            (self.backend.context_size as usize)
                .saturating_sub(self.sampling.max_tokens as usize)
                .max(64)
        })
    }

    /// Set a value by its CLI key (`shellmind config set <key> <value>`)
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "model" => self.backend.model_path = PathBuf::from(value),
            "server" => self.backend.server_path = PathBuf::from(value),
            "host" => self.backend.host = value.to_string(),
            "port" => self.backend.port = parse_value(key, value)?,
            "ctx-size" => self.backend.context_size = parse_value(key, value)?,
            "threads" => self.backend.threads = parse_value(key, value)?,
            "gpu-layers" => self.backend.gpu_layers = parse_value(key, value)?,
            "temperature" => self.sampling.temperature = parse_value(key, value)?,
            "max-tokens" => self.sampling.max_tokens = parse_value(key, value)?,
            "timeout" => self.client.request_timeout_secs = parse_value(key, value)?,
            "budget" => self.conversation.context_budget = Some(parse_value(key, value)?),
            "session-dir" => self.sessions.dir = PathBuf::from(value),
            _ => anyhow::bail!(
                "Unknown config key: {}. Valid keys: model, server, host, port, ctx-size, \
                 threads, gpu-layers, temperature, max-tokens, timeout, budget, session-dir",
                key
            ),
        }
        Ok(())
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid value for {}: {} ({})", key, value, e))
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let cfg = Config::default();
        assert_eq!(cfg.backend.port, 8080);
        assert_eq!(cfg.backend.context_size, 2048);
        assert_eq!(cfg.sampling.max_tokens, 512);
        assert!(cfg.sessions.autosave);
        assert_eq!(cfg.context_budget(), 1536);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let json = r#"{"backend":{"port":9090},"sampling":{"temperature":0.2}}"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.backend.port, 9090);
        assert_eq!(cfg.backend.host, "127.0.0.1");
        assert!((cfg.sampling.temperature - 0.2).abs() < f32::EPSILON);
        assert_eq!(cfg.sampling.max_tokens, 512);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.json");

        let mut cfg = Config::default();
        cfg.set("port", "9000").unwrap();
        cfg.set("budget", "700").unwrap();
        cfg.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.backend.port, 9000);
        assert_eq!(loaded.context_budget(), 700);
    }

    #[test]
    fn test_env_overrides_file_but_is_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut cfg = Config::default();
        cfg.set("model", "/from/file.gguf").unwrap();
        cfg.save_to(&path).unwrap();

        std::env::set_var("SHELLMIND_MODEL", "/from/env.gguf");
        let effective = Config::load_from(&path).unwrap();
        let on_disk = Config::load_file(&path).unwrap();
        std::env::remove_var("SHELLMIND_MODEL");

        assert_eq!(effective.backend.model_path, PathBuf::from("/from/env.gguf"));
        assert_eq!(on_disk.backend.model_path, PathBuf::from("/from/file.gguf"));
    }

    #[test]
    fn test_set_rejects_unknown_and_invalid() {
        let mut cfg = Config::default();
        assert!(cfg.set("colour", "blue").is_err());
        assert!(cfg.set("port", "not-a-port").is_err());
    }

    #[test]
    fn test_session_path_resolution() {
        let sessions = SessionsConfig {
            dir: PathBuf::from("/tmp/sessions"),
            ..Default::default()
        };
        assert_eq!(
            sessions.path_for(None),
            PathBuf::from("/tmp/sessions/chat_history.json")
        );
        assert_eq!(
            sessions.path_for(Some("work")),
            PathBuf::from("/tmp/sessions/work.json")
        );
        assert_eq!(
            sessions.path_for(Some("notes.json")),
            PathBuf::from("/tmp/sessions/notes.json")
        );
        assert_eq!(
            sessions.path_for(Some("/var/tmp/abs.json")),
            PathBuf::from("/var/tmp/abs.json")
        );
        assert_eq!(
            sessions.path_for(Some("./backup.json")),
            PathBuf::from("./backup.json")
        );
    }
}
