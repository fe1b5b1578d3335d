//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `TESTKUBE_PRO_URL`, `TESTKUBE_PRO_API_KEY`,
//!    `TESTKUBE_PRO_RUNNER_ID`, `TESTKUBE_PRO_ORG_ID`, `TESTKUBE_PRO_ENV_ID`,
//!    `TESTKUBE_CLUSTER_ID`
//! 2. **Config file**: path via `--config <path>`, or `testkube-agent.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [control_plane]
//! url = "wss://agent.testkube.io"
//! api_key = "tkcagnt_..."
//! runner_id = ""                 # sent on relay tunnels when set
//! cluster_id = "tkccl_..."
//! organization_id = "tkcorg_..."
//! environment_id = "tkcenv_..."
//! insecure = false               # plain ws:// (no TLS)
//! skip_verify = false            # accept any server certificate
//! cert_file = ""                 # client certificate, PEM
//! key_file = ""                  # client key, PKCS#8 PEM
//! ca_file = ""                   # additional root CA, PEM
//! connect_timeout_secs = 10
//!
//! [tunnel]
//! send_timeout_secs = 30
//! receive_timeout_secs = 300
//! healthcheck_interval_secs = 30
//! reconnect_delay_secs = 5
//! log_stream_workers = 5
//! notifications_workers = 5
//! event_queue_capacity = 256
//! resolve_attempts = 10
//! resolve_retry_delay_ms = 100
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Default config file looked up in the current directory.
pub const DEFAULT_CONFIG_FILE: &str = "testkube-agent.toml";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub control_plane: ControlPlaneConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where the control plane lives and how to authenticate against it.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlPlaneConfig {
    /// Base URL of the agent API (`wss://…` or `ws://…`).
    #[serde(default = "default_url")]
    pub url: String,
    /// Agent API key. Override with `TESTKUBE_PRO_API_KEY`.
    #[serde(default)]
    pub api_key: String,
    /// Runner identity attached to the relay tunnels (optional).
    #[serde(default)]
    pub runner_id: String,
    #[serde(default)]
    pub cluster_id: String,
    #[serde(default)]
    pub organization_id: String,
    #[serde(default)]
    pub environment_id: String,
    /// Migration marker forwarded as-is to the control plane.
    #[serde(default)]
    pub migrate: String,
    /// Connect without TLS (default false).
    #[serde(default)]
    pub insecure: bool,
    /// Skip server certificate verification (default false).
    #[serde(default)]
    pub skip_verify: bool,
    #[serde(default)]
    pub cert_file: String,
    #[serde(default)]
    pub key_file: String,
    #[serde(default)]
    pub ca_file: String,
    /// Seconds allowed for each WebSocket handshake (default 10).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// Timeouts, pool sizes and retry policy for the tunnels.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Max seconds a single frame send may take (default 30).
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,
    /// Max seconds without any inbound frame on the command tunnel (default 300).
    #[serde(default = "default_receive_timeout")]
    pub receive_timeout_secs: u64,
    /// Seconds between event-tunnel keep-alives (default 30).
    #[serde(default = "default_healthcheck_interval")]
    pub healthcheck_interval_secs: u64,
    /// Fixed pause between reconnect attempts (default 5).
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// Concurrent log fetch workers (default 5).
    #[serde(default = "default_workers")]
    pub log_stream_workers: usize,
    /// Concurrent notification fetch workers (default 5).
    #[serde(default = "default_workers")]
    pub notifications_workers: usize,
    /// Outbound event queue capacity (default 256).
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
    /// Push-source resolution attempts before reporting an error frame (default 10).
    #[serde(default = "default_resolve_attempts")]
    pub resolve_attempts: u32,
    /// Pause between resolution attempts in milliseconds (default 100).
    #[serde(default = "default_resolve_retry_delay_ms")]
    pub resolve_retry_delay_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_url() -> String {
    "wss://agent.testkube.io".to_string()
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_send_timeout() -> u64 {
    30
}
fn default_receive_timeout() -> u64 {
    300
}
fn default_healthcheck_interval() -> u64 {
    30
}
fn default_reconnect_delay() -> u64 {
    5
}
fn default_workers() -> usize {
    5
}
fn default_event_queue_capacity() -> usize {
    256
}
fn default_resolve_attempts() -> u32 {
    10
}
fn default_resolve_retry_delay_ms() -> u64 {
    100
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            api_key: String::new(),
            runner_id: String::new(),
            cluster_id: String::new(),
            organization_id: String::new(),
            environment_id: String::new(),
            migrate: String::new(),
            insecure: false,
            skip_verify: false,
            cert_file: String::new(),
            key_file: String::new(),
            ca_file: String::new(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            send_timeout_secs: default_send_timeout(),
            receive_timeout_secs: default_receive_timeout(),
            healthcheck_interval_secs: default_healthcheck_interval(),
            reconnect_delay_secs: default_reconnect_delay(),
            log_stream_workers: default_workers(),
            notifications_workers: default_workers(),
            event_queue_capacity: default_event_queue_capacity(),
            resolve_attempts: default_resolve_attempts(),
            resolve_retry_delay_ms: default_resolve_retry_delay_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ControlPlaneConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl TunnelConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_secs(self.receive_timeout_secs)
    }

    pub fn healthcheck_interval(&self) -> Duration {
        Duration::from_secs(self.healthcheck_interval_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn resolve_retry_delay(&self) -> Duration {
        Duration::from_millis(self.resolve_retry_delay_ms)
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file. Otherwise looks for
    /// `testkube-agent.toml` in the current directory, falling back to
    /// compiled defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::from_file(DEFAULT_CONFIG_FILE)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Env var overrides, with the lookup injected for testability.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let cp = &mut self.control_plane;
        for (name, field) in [
            ("TESTKUBE_PRO_URL", &mut cp.url),
            ("TESTKUBE_PRO_API_KEY", &mut cp.api_key),
            ("TESTKUBE_PRO_RUNNER_ID", &mut cp.runner_id),
            ("TESTKUBE_PRO_ORG_ID", &mut cp.organization_id),
            ("TESTKUBE_PRO_ENV_ID", &mut cp.environment_id),
            ("TESTKUBE_CLUSTER_ID", &mut cp.cluster_id),
        ] {
            if let Some(value) = lookup(name) {
                *field = value;
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let cp = &self.control_plane;
        let tunnel = &self.tunnel;
        if cp.url.trim().is_empty() {
            return Err(ConfigError::Invalid("control_plane.url is empty".into()));
        }
        if !cp.cert_file.is_empty() && cp.key_file.is_empty() {
            return Err(ConfigError::Invalid(
                "control_plane.cert_file requires control_plane.key_file".into(),
            ));
        }
        if tunnel.log_stream_workers == 0 || tunnel.notifications_workers == 0 {
            return Err(ConfigError::Invalid("worker counts must be at least 1".into()));
        }
        if tunnel.healthcheck_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "tunnel.healthcheck_interval_secs must be at least 1".into(),
            ));
        }
        if tunnel.resolve_attempts == 0 {
            return Err(ConfigError::Invalid("tunnel.resolve_attempts must be at least 1".into()));
        }
        if tunnel.event_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "tunnel.event_queue_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
