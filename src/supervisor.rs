//! Backend process supervision: llama-server spawn, health, shutdown.
//!
//! One `BackendProcess` owns exactly one child process. The child runs in
//! its own process group so SIGTERM/SIGKILL reach anything it forks, and it
//! is killed on drop if nobody stopped it explicitly.

use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

use crate::client::{probe_health, HealthStatus};
use crate::config::{BackendConfig, HealthPolicy};
use crate::error::StartupError;

/// Lines of server stderr kept for error messages
const STDERR_TAIL: usize = 20;

/// Lifecycle state of the supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Starting,
    Ready,
    Failed,
    Stopped,
}

type StderrTail = Arc<Mutex<VecDeque<String>>>;

/// Handle to a running llama-server
pub struct BackendProcess {
    child: Option<Child>,
    pid: Option<u32>,
    host: String,
    port: u16,
    state: BackendState,
    http: reqwest::Client,
    policy: HealthPolicy,
    stderr_tail: StderrTail,
}

impl std::fmt::Debug for BackendProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendProcess")
            .field("pid", &self.pid)
            .field("address", &self.address())
            .field("state", &self.state)
            .finish()
    }
}

/// Check the binary and model exist before spawning anything.
pub fn validate(config: &BackendConfig) -> Result<(), StartupError> {
    if !config.server_path.is_file() {
        return Err(StartupError::BinaryMissing {
            path: config.server_path.clone(),
        });
    }
    if !config.model_path.is_file() {
        return Err(StartupError::ModelMissing {
            path: config.model_path.clone(),
        });
    }
    Ok(())
}

/// Command-line arguments for llama-server
pub fn server_args(config: &BackendConfig) -> Vec<String> {
    vec![
        "-m".to_string(),
        config.model_path.display().to_string(),
        "--host".to_string(),
        config.host.clone(),
        "--port".to_string(),
        config.port.to_string(),
        "-c".to_string(),
        config.context_size.to_string(),
        "-t".to_string(),
        config.threads.to_string(),
        "-ngl".to_string(),
        config.gpu_layers.to_string(),
    ]
}

/// Delay before the next health probe: doubles each attempt, capped
pub fn backoff_delay(policy: &HealthPolicy, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
    policy
        .initial_delay
        .checked_mul(factor)
        .unwrap_or(policy.max_delay)
        .min(policy.max_delay)
}

impl BackendProcess {
    /// Validate paths, launch llama-server, and wait until `/health` is OK.
    pub async fn start(config: &BackendConfig, policy: &HealthPolicy) -> Result<Self, StartupError> {
        validate(config)?;

        tracing::info!(
            model = %config.model_path.display(),
            address = %format!("{}:{}", config.host, config.port),
            ctx = config.context_size,
            threads = config.threads,
            "starting llama-server"
        );

        let mut command = Command::new(&config.server_path);
        command
            .args(server_args(config))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| StartupError::SpawnFailed {
            path: config.server_path.clone(),
            source,
        })?;

        let stderr_tail: StderrTail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL)));
        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_drain(stderr, stderr_tail.clone());
        }

        let mut process = Self {
            pid: child.id(),
            child: Some(child),
            host: config.host.clone(),
            port: config.port,
            state: BackendState::Starting,
            http: reqwest::Client::new(),
            policy: *policy,
            stderr_tail,
        };

        match process.wait_until_ready().await {
            Ok(()) => {
                process.state = BackendState::Ready;
                tracing::info!(pid = ?process.pid, "llama-server ready");
                Ok(process)
            }
            Err(e) => {
                tracing::error!(error = %e, "llama-server failed to start");
                process.stop().await;
                process.state = BackendState::Failed;
                Err(e)
            }
        }
    }

    /// Poll `/health` with exponential backoff until Ready, the child
    /// exits, or the attempt/time budget runs out.
    async fn wait_until_ready(&mut self) -> Result<(), StartupError> {
        let started = Instant::now();
        let mut attempts = 0;

        while attempts < self.policy.max_attempts {
            if let Some(status) = self.exit_status() {
                return Err(StartupError::Exited {
                    status,
                    stderr_tail: self.stderr_lines(),
                });
            }

            attempts += 1;
            if probe_health(&self.http, &self.base_url(), self.policy.probe_timeout).await
                == HealthStatus::Ready
            {
                return Ok(());
            }

            let elapsed = started.elapsed();
            if elapsed >= self.policy.max_wait {
                break;
            }
            let delay = backoff_delay(&self.policy, attempts - 1).min(self.policy.max_wait - elapsed);
            tracing::debug!(attempt = attempts, delay_ms = delay.as_millis() as u64, "backend not ready yet");
            tokio::time::sleep(delay).await;
        }

        Err(StartupError::Timeout {
            attempts,
            waited: started.elapsed(),
        })
    }

    /// Probe the server. A child that has exited marks the handle Failed.
    pub async fn health_check(&mut self) -> HealthStatus {
        match self.state {
            BackendState::Stopped | BackendState::Failed if self.child.is_none() => {
                return HealthStatus::NotReady
            }
            _ => {}
        }
        if let Some(status) = self.exit_status() {
            tracing::warn!(%status, "llama-server exited");
            self.child = None;
            self.state = BackendState::Failed;
            return HealthStatus::NotReady;
        }

        let health = probe_health(&self.http, &self.base_url(), self.policy.probe_timeout).await;
        if health == HealthStatus::Ready {
            self.state = BackendState::Ready;
        }
        health
    }

    /// Terminate the server: SIGTERM, bounded wait, then SIGKILL.
    /// Calling this on a stopped handle does nothing.
    pub async fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            if self.state != BackendState::Failed {
                self.state = BackendState::Stopped;
            }
            return;
        };

        if let Ok(Some(status)) = child.try_wait() {
            tracing::debug!(%status, "llama-server already exited");
            self.state = BackendState::Stopped;
            return;
        }

        tracing::info!(pid = ?self.pid, "stopping llama-server");
        signal_group(self.pid, Signal::Term);

        match tokio::time::timeout(self.policy.stop_grace, child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(%status, "llama-server exited"),
            Ok(Err(e)) => tracing::warn!(error = %e, "waiting for llama-server failed"),
            Err(_) => {
                tracing::warn!("llama-server ignored SIGTERM, killing");
                signal_group(self.pid, Signal::Kill);
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "failed to kill llama-server");
                }
            }
        }
        self.state = BackendState::Stopped;
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> BackendState {
        self.state
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// URL handed to the inference client; the client never sees the child
    pub fn base_url(&self) -> String {
        format!("http://{}", self.address())
    }

    /// Most recent stderr lines from the server
    pub fn stderr_lines(&self) -> Vec<String> {
        self.stderr_tail
            .lock()
            .map(|lines| lines.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn exit_status(&mut self) -> Option<String> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(e.to_string()),
        }
    }
}

impl Drop for BackendProcess {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if matches!(child.try_wait(), Ok(None)) {
                tracing::warn!(pid = ?self.pid, "llama-server still running at shutdown, killing");
                signal_group(self.pid, Signal::Kill);
                let _ = child.start_kill();
            }
        }
    }
}

fn spawn_stderr_drain(stderr: tokio::process::ChildStderr, tail: StderrTail) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim_end().to_string();
            if line.is_empty() {
                continue;
            }
            tracing::debug!(target: "llama_server", "{}", line);
            if let Ok(mut buf) = tail.lock() {
                if buf.len() == STDERR_TAIL {
                    buf.pop_front();
                }
                buf.push_back(line);
            }
        }
    });
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Signal {
    Term,
    Kill,
}

/// Signal a whole process group led by `pid`
#[cfg(unix)]
pub(crate) fn signal_group(pid: Option<u32>, signal: Signal) {
    let Some(pid) = pid else { return };
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // The child leads its own group (process_group(0)), so -pid targets it
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(-(pid as libc::pid_t), sig) };
    if rc != 0 {
        tracing::debug!(pid, ?signal, error = %std::io::Error::last_os_error(), "kill failed");
    }
}

#[cfg(not(unix))]
pub(crate) fn signal_group(_pid: Option<u32>, _signal: Signal) {}

/// Is a path an executable-looking file? Used by `doctor`.
pub fn describe_path(path: &Path) -> &'static str {
    if path.is_file() {
        "found"
    } else if path.exists() {
        "not a file"
    } else {
        "missing"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn fast_policy() -> HealthPolicy {
        HealthPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(80),
            max_wait: Duration::from_secs(2),
            probe_timeout: Duration::from_millis(200),
            stop_grace: Duration::from_secs(2),
        }
    }

    fn free_port() -> u16 {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    }

    #[cfg(unix)]
    fn fake_server(dir: &Path, script: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("llama-server");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", script)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn config_in(dir: &Path, server: PathBuf, port: u16) -> BackendConfig {
        let model = dir.join("model.gguf");
        std::fs::write(&model, b"GGUF").unwrap();
        BackendConfig {
            server_path: server,
            model_path: model,
            host: "127.0.0.1".into(),
            port,
            context_size: 512,
            threads: 1,
            gpu_layers: 0,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = fast_policy();
        assert_eq!(backoff_delay(&p, 0), Duration::from_millis(20));
        assert_eq!(backoff_delay(&p, 1), Duration::from_millis(40));
        assert_eq!(backoff_delay(&p, 2), Duration::from_millis(80));
        assert_eq!(backoff_delay(&p, 10), Duration::from_millis(80));
        assert_eq!(backoff_delay(&p, 40), Duration::from_millis(80));
    }

    #[test]
    fn test_server_args_enumerate_config() {
        let cfg = BackendConfig {
            model_path: PathBuf::from("/m/q.gguf"),
            port: 9001,
            context_size: 4096,
            threads: 8,
            ..Default::default()
        };
        let args = server_args(&cfg).join(" ");
        assert!(args.contains("-m /m/q.gguf"));
        assert!(args.contains("--port 9001"));
        assert!(args.contains("-c 4096"));
        assert!(args.contains("-t 8"));
    }

    #[tokio::test]
    async fn test_missing_binary_spawns_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config_in(dir.path(), dir.path().join("no-such-server"), free_port());
        let err = BackendProcess::start(&cfg, &fast_policy()).await.unwrap_err();
        assert!(matches!(err, StartupError::BinaryMissing { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_model_spawns_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("spawned");
        let server = fake_server(dir.path(), &format!("touch {}", marker.display()));
        let mut cfg = config_in(dir.path(), server, free_port());
        cfg.model_path = dir.path().join("absent.gguf");

        let err = BackendProcess::start(&cfg, &fast_policy()).await.unwrap_err();
        match err {
            StartupError::ModelMissing { path } => assert_eq!(path, cfg.model_path),
            other => panic!("expected ModelMissing, got {other:?}"),
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!marker.exists(), "server must not be launched");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unhealthy_server_times_out_and_is_reaped() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("pid");
        let server = fake_server(dir.path(), &format!("echo $$ > {}\nexec sleep 30", pidfile.display()));
        let cfg = config_in(dir.path(), server, free_port());

        let err = BackendProcess::start(&cfg, &fast_policy()).await.unwrap_err();
        assert!(matches!(err, StartupError::Timeout { attempts: 5, .. }), "{err:?}");

        let pid: i32 = std::fs::read_to_string(&pidfile).unwrap().trim().parse().unwrap();
        // SAFETY: signal 0 only checks for existence
        let alive = unsafe { libc::kill(pid, 0) } == 0;
        assert!(!alive, "timed-out server must be terminated");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_early_exit_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let server = fake_server(dir.path(), "echo 'error: unknown model architecture' >&2\nexit 1");
        let cfg = config_in(dir.path(), server, free_port());

        let err = BackendProcess::start(&cfg, &fast_policy()).await.unwrap_err();
        match err {
            StartupError::Exited { .. } => {
                // stderr drain races the exit check; the tail is best effort
            }
            other => panic!("expected Exited, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ready_then_idempotent_stop() {
        use axum::routing::get;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = axum::Router::new().route("/health", get(|| async { "{\"status\":\"ok\"}" }));
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        let dir = tempfile::tempdir().unwrap();
        let server = fake_server(dir.path(), "exec sleep 30");
        let cfg = config_in(dir.path(), server, port);

        let mut backend = BackendProcess::start(&cfg, &fast_policy()).await.unwrap();
        assert_eq!(backend.state(), BackendState::Ready);
        assert_eq!(backend.base_url(), format!("http://127.0.0.1:{}", port));
        let pid = backend.pid().unwrap() as i32;
        assert_eq!(backend.health_check().await, HealthStatus::Ready);

        backend.stop().await;
        assert_eq!(backend.state(), BackendState::Stopped);
        // SAFETY: signal 0 only checks for existence
        assert_ne!(unsafe { libc::kill(pid, 0) }, 0);

        backend.stop().await;
        assert_eq!(backend.state(), BackendState::Stopped);
        assert_eq!(backend.health_check().await, HealthStatus::NotReady);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_escalates_when_term_is_ignored() {
        use axum::routing::get;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = axum::Router::new().route("/health", get(|| async { "ok" }));
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        let dir = tempfile::tempdir().unwrap();
        let server = fake_server(dir.path(), "trap '' TERM\nwhile true; do sleep 0.1; done");
        let cfg = config_in(dir.path(), server, port);
        let policy = HealthPolicy {
            stop_grace: Duration::from_millis(300),
            ..fast_policy()
        };

        let mut backend = BackendProcess::start(&cfg, &policy).await.unwrap();
        let pid = backend.pid().unwrap() as i32;
        // let the script reach its trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = std::time::Instant::now();
        backend.stop().await;
        let took = started.elapsed();
        assert_eq!(backend.state(), BackendState::Stopped);
        assert!(took >= Duration::from_millis(300), "stopped before the grace period: {:?}", took);
        assert!(took < Duration::from_secs(5));
        // SAFETY: signal 0 only checks for existence
        assert_ne!(unsafe { libc::kill(pid, 0) }, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_crash_after_ready_marks_failed() {
        use axum::routing::get;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = axum::Router::new().route("/health", get(|| async { "ok" }));
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        let dir = tempfile::tempdir().unwrap();
        let server = fake_server(dir.path(), "sleep 0.3");
        let cfg = config_in(dir.path(), server, port);

        let mut backend = BackendProcess::start(&cfg, &fast_policy()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(backend.health_check().await, HealthStatus::NotReady);
        assert_eq!(backend.state(), BackendState::Failed);

        backend.stop().await;
        assert_eq!(backend.state(), BackendState::Failed);
    }
}
