use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::backends::{build_adapter, BackendKind, ClaudeSettings, CodexSettings};
use crate::process::AgentRunner;
use crate::reaper::{DEFAULT_IDLE_TIMEOUT, DEFAULT_SWEEP_INTERVAL};
use crate::routing::{default_rules, BackendRouter};
use crate::sessions::SessionTable;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8787;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no backends enabled")]
    NoBackends,
    #[error("default backend `{0}` is not enabled")]
    DefaultBackendDisabled(BackendKind),
    #[error("{name} must be greater than zero")]
    ZeroDuration { name: &'static str },
    #[error("invalid listen address `{address}`: {source}")]
    InvalidAddress {
        address: String,
        #[source]
        source: std::net::AddrParseError,
    },
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub host: String,
    pub port: u16,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub default_backend: BackendKind,
    pub backends: Vec<BackendKind>,
    pub claude: ClaudeSettings,
    pub codex: CodexSettings,
    /// Run at most one turn per conversation id at a time.
    pub serialize_turns: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            default_backend: BackendKind::ClaudeCode,
            backends: BackendKind::all().to_vec(),
            claude: ClaudeSettings::default(),
            codex: CodexSettings::default(),
            serialize_turns: false,
        }
    }
}

impl BridgeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backends.is_empty() {
            return Err(ConfigError::NoBackends);
        }
        if !self.backends.contains(&self.default_backend) {
            return Err(ConfigError::DefaultBackendDisabled(self.default_backend));
        }
        if self.idle_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration {
                name: "idle timeout",
            });
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::ZeroDuration {
                name: "sweep interval",
            });
        }
        let turn_timeouts = [self.claude.turn_timeout, self.codex.turn_timeout];
        if turn_timeouts.iter().flatten().any(|timeout| timeout.is_zero()) {
            return Err(ConfigError::ZeroDuration {
                name: "turn timeout",
            });
        }
        self.listen_addr()?;
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let address = format!("{}:{}", self.host, self.port);
        address
            .parse()
            .map_err(|source| ConfigError::InvalidAddress { address, source })
    }

    /// Builds one adapter per enabled backend, each with its own session
    /// table, behind a router using the default selector rules.
    pub fn backend_router(&self, runner: Arc<dyn AgentRunner>) -> Result<BackendRouter, ConfigError> {
        self.validate()?;

        let mut kinds = self.backends.clone();
        kinds.sort();
        kinds.dedup();

        let adapters = kinds
            .into_iter()
            .map(|kind| {
                let sessions = if self.serialize_turns {
                    SessionTable::with_turn_serialization()
                } else {
                    SessionTable::new()
                };
                build_adapter(
                    kind,
                    runner.clone(),
                    Arc::new(sessions),
                    &self.claude,
                    &self.codex,
                )
            })
            .collect();

        BackendRouter::new(adapters, default_rules(), self.default_backend)
    }
}
