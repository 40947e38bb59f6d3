//! shellmind - chat with a local model about your system
//!
//! USAGE:
//!   shellmind [chat] [--model P] [--server P]   # start llama-server and chat
//!   shellmind doctor                            # check binary, model, backend
//!   shellmind sessions                          # list saved conversations
//!   shellmind config show                       # print effective config
//!   shellmind config set <key> <value>          # edit config file

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use shellmind::client::{probe_health, HealthStatus};
use shellmind::config::{self, Config};
use shellmind::conversation::list_saved;
use shellmind::supervisor::{describe_path, server_args};
use shellmind::repl;

// ═══════════════════════════════════════════════════════════════
// CLI
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Parser)]
#[command(name = "shellmind", version, about = "Chat with a local llama.cpp model about your system")]
struct Cli {
    /// More logging (-v info, -vv debug); RUST_LOG overrides
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Config file (default: ~/.config/shellmind/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    chat: ChatArgs,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the backend and chat (default)
    Chat(ChatArgs),
    /// Check config, binary, model, session dir and backend
    Doctor,
    /// List saved sessions
    Sessions,
    /// Show or edit the config file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigAction {
    /// Print the effective config as JSON
    Show,
    /// Set one value, e.g. `config set port 8081`
    Set { key: String, value: String },
}

#[derive(Debug, Default, Clone, Args)]
struct ChatArgs {
    /// Path to the GGUF model
    #[arg(long)]
    model: Option<PathBuf>,
    /// Path to the llama-server binary
    #[arg(long)]
    server: Option<PathBuf>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    ctx_size: Option<u32>,
    #[arg(long)]
    threads: Option<u32>,
    /// Where `!save` / `!load` keep sessions
    #[arg(long)]
    session_dir: Option<PathBuf>,
    /// Start with an empty conversation
    #[arg(long)]
    no_autoload: bool,
}

impl ChatArgs {
    fn apply(self, config: &mut Config) {
        if let Some(model) = self.model {
            config.backend.model_path = model;
        }
        if let Some(server) = self.server {
            config.backend.server_path = server;
        }
        if let Some(port) = self.port {
            config.backend.port = port;
        }
        if let Some(ctx_size) = self.ctx_size {
            config.backend.context_size = ctx_size;
        }
        if let Some(threads) = self.threads {
            config.backend.threads = threads;
        }
        if let Some(dir) = self.session_dir {
            config.sessions.dir = dir;
        }
        if self.no_autoload {
            config.sessions.autoload = false;
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// MAIN
// ═══════════════════════════════════════════════════════════════

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config_path = match cli.config {
        Some(path) => path,
        None => config::config_path()?,
    };

    match cli.command {
        None => run_chat(&config_path, cli.chat).await,
        Some(Command::Chat(args)) => run_chat(&config_path, args).await,
        Some(Command::Doctor) => run_doctor(&config_path).await,
        Some(Command::Sessions) => run_sessions(&config_path),
        Some(Command::Config { action: ConfigAction::Show }) => run_config_show(&config_path),
        Some(Command::Config { action: ConfigAction::Set { key, value } }) => {
            run_config_set(&config_path, &key, &value)
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

// ═══════════════════════════════════════════════════════════════
// COMMANDS
// ═══════════════════════════════════════════════════════════════

async fn run_chat(config_path: &std::path::Path, args: ChatArgs) -> Result<()> {
    let mut cfg = Config::load_from(config_path)?;
    args.apply(&mut cfg);
    tracing::info!(config = %config_path.display(), "loaded config");
    repl::run(cfg).await
}

async fn run_doctor(config_path: &std::path::Path) -> Result<()> {
    println!("shellmind doctor\n");

    let cfg = Config::load_from(config_path)?;
    println!("[{}] Config: {}",
        if config_path.exists() { "✓" } else { "-" },
        config_path.display()
    );

    let server = describe_path(&cfg.backend.server_path);
    println!("[{}] llama-server: {} ({})",
        if server == "found" { "✓" } else { "✗" },
        cfg.backend.server_path.display(),
        server
    );

    let model = describe_path(&cfg.backend.model_path);
    println!("[{}] Model: {} ({})",
        if model == "found" { "✓" } else { "✗" },
        cfg.backend.model_path.display(),
        model
    );

    println!("[{}] Sessions: {} ({} saved)",
        if cfg.sessions.dir.is_dir() { "✓" } else { "-" },
        cfg.sessions.dir.display(),
        list_saved(&cfg.sessions.dir).len()
    );

    println!("    Launch: {} {}", cfg.backend.server_path.display(), server_args(&cfg.backend).join(" "));

    let base_url = cfg.backend.base_url();
    print!("[?] Backend at {}: checking...", base_url);
    std::io::stdout().flush()?;
    let http = reqwest::Client::new();
    match probe_health(&http, &base_url, Duration::from_secs(2)).await {
        HealthStatus::Ready => println!("\r[✓] Backend at {}: ready          ", base_url),
        HealthStatus::NotReady => println!("\r[-] Backend at {}: not running    ", base_url),
    }

    Ok(())
}

fn run_sessions(config_path: &std::path::Path) -> Result<()> {
    let cfg = Config::load_from(config_path)?;
    let sessions = list_saved(&cfg.sessions.dir);
    if sessions.is_empty() {
        println!("No saved sessions in {}", cfg.sessions.dir.display());
        return Ok(());
    }
    println!("Saved sessions in {}:", cfg.sessions.dir.display());
    for s in sessions {
        println!("  {:<24} {:>4} turns  {}",
            s.name,
            s.turns,
            s.saved_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

fn run_config_show(config_path: &std::path::Path) -> Result<()> {
    let cfg = Config::load_from(config_path)?;
    println!("# {}", config_path.display());
    println!("{}", serde_json::to_string_pretty(&cfg)?);
    Ok(())
}

fn run_config_set(config_path: &std::path::Path, key: &str, value: &str) -> Result<()> {
    let mut cfg = Config::load_file(config_path)?;
    cfg.set(key, value)?;
    cfg.save_to(config_path)
        .with_context(|| format!("Failed to save {}", config_path.display()))?;
    println!("{} set to {} in {}", key, value, config_path.display());
    Ok(())
}
