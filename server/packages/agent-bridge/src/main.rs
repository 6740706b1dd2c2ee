use std::path::PathBuf;
use std::time::Duration;

use agent_bridge::backends::{BackendKind, ClaudeSettings, CodexSettings};
use agent_bridge::config::{BridgeConfig, DEFAULT_HOST, DEFAULT_PORT};
use agent_bridge::run_server;
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "agent-bridge")]
#[command(about = "Session-resuming HTTP bridge for coding-agent CLIs", version)]
struct Cli {
    #[arg(long, env = "AGENT_BRIDGE_HOST", default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, env = "AGENT_BRIDGE_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Seconds a conversation may sit unused before its session is dropped.
    #[arg(long, env = "AGENT_BRIDGE_IDLE_TIMEOUT_SECS", default_value_t = 1800)]
    idle_timeout_secs: u64,

    #[arg(long, env = "AGENT_BRIDGE_SWEEP_INTERVAL_SECS", default_value_t = 300)]
    sweep_interval_secs: u64,

    /// Backend used when the model selector matches no rule.
    #[arg(long, env = "AGENT_BRIDGE_DEFAULT_BACKEND", default_value_t = BackendKind::ClaudeCode)]
    default_backend: BackendKind,

    #[arg(
        long,
        env = "AGENT_BRIDGE_BACKENDS",
        value_delimiter = ',',
        default_values_t = BackendKind::all()
    )]
    backends: Vec<BackendKind>,

    #[arg(long, env = "AGENT_BRIDGE_CLAUDE_BIN", default_value = "claude")]
    claude_bin: PathBuf,

    #[arg(long, env = "AGENT_BRIDGE_CODEX_BIN", default_value = "codex")]
    codex_bin: PathBuf,

    /// Tools Claude Code may use without prompting.
    #[arg(long, env = "AGENT_BRIDGE_ALLOWED_TOOLS", value_delimiter = ',')]
    allowed_tools: Option<Vec<String>>,

    /// Codex `--sandbox` mode; empty keeps the Codex default.
    #[arg(long, env = "AGENT_BRIDGE_CODEX_SANDBOX", default_value = "workspace-write")]
    codex_sandbox: String,

    #[arg(long, env = "AGENT_BRIDGE_TURN_TIMEOUT_SECS")]
    turn_timeout_secs: Option<u64>,

    /// Run at most one turn per conversation at a time.
    #[arg(long, env = "AGENT_BRIDGE_SERIALIZE_TURNS")]
    serialize_turns: bool,
}

impl Cli {
    fn into_config(self) -> BridgeConfig {
        let turn_timeout = self.turn_timeout_secs.map(Duration::from_secs);
        let mut claude = ClaudeSettings {
            program: self.claude_bin,
            turn_timeout,
            ..ClaudeSettings::default()
        };
        if let Some(tools) = self.allowed_tools {
            claude.allowed_tools = tools
                .into_iter()
                .map(|tool| tool.trim().to_string())
                .filter(|tool| !tool.is_empty())
                .collect();
        }
        let codex = CodexSettings {
            program: self.codex_bin,
            sandbox: Some(self.codex_sandbox).filter(|mode| !mode.trim().is_empty()),
            turn_timeout,
        };

        BridgeConfig {
            host: self.host,
            port: self.port,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            default_backend: self.default_backend,
            backends: self.backends,
            claude,
            codex,
            serialize_turns: self.serialize_turns,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging();

    if let Err(err) = run_server(cli.into_config()).await {
        tracing::error!(error = %err, "agent-bridge failed");
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}
