use serde::{Deserialize, Serialize};

use crate::error::BrokerError;
use crate::transport::Transport;

/// Full configuration for the broker, matching SPEC_FULL.md §4.10/§6.
///
/// Parsed from TOML with support for environment variable overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Endpoint clients and workers dial for the plaintext channel.
    #[serde(default = "default_plaintext_endpoint")]
    pub plaintext_endpoint: String,

    /// Endpoint clients and workers dial for the encrypted channel, gated by
    /// the `Authenticator` (see `auth.rs`).
    #[serde(default = "default_encrypted_endpoint")]
    pub encrypted_endpoint: String,

    /// Optional fan-out endpoint; fan-out is disabled when absent.
    pub publisher_endpoint: Option<String>,

    /// Directory of allowed peer identities for the encrypted endpoint.
    /// Mutually exclusive with an injected `Authenticator::from_callback`
    /// (callbacks are constructed in code, not from config).
    pub credentials_location: Option<String>,

    /// Raise the logging filter to `debug`.
    #[serde(default)]
    pub verbose: bool,

    /// Milliseconds between heartbeat emission ticks.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Consecutive missed heartbeat intervals tolerated before a worker is
    /// purged.
    #[serde(default = "default_heartbeat_liveness")]
    pub heartbeat_liveness: u32,

    /// Optional HTTP port for the `/metrics` JSON endpoint.
    pub metrics_port: Option<u16>,
}

fn default_plaintext_endpoint() -> String {
    "ipc:///tmp/stupid-bahnhof/broker-plaintext.sock".into()
}

fn default_encrypted_endpoint() -> String {
    "ipc:///tmp/stupid-bahnhof/broker-encrypted.sock".into()
}

fn default_heartbeat_interval_ms() -> u64 {
    2500
}

fn default_heartbeat_liveness() -> u32 {
    3
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            plaintext_endpoint: default_plaintext_endpoint(),
            encrypted_endpoint: default_encrypted_endpoint(),
            publisher_endpoint: None,
            credentials_location: None,
            verbose: false,
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_liveness: default_heartbeat_liveness(),
            metrics_port: None,
        }
    }
}

impl BrokerConfig {
    /// Parse config from a TOML string, apply environment overrides, then
    /// validate.
    pub fn from_toml(toml_str: &str) -> Result<Self, BrokerError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, BrokerError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Single-host deployment using IPC sockets for every endpoint.
    pub fn local() -> Self {
        Self::default()
    }

    /// Distributed deployment using TCP, ports assigned from `base_port`.
    pub fn tcp(host: &str, base_port: u16) -> Self {
        Self {
            plaintext_endpoint: format!("tcp://{host}:{base_port}"),
            encrypted_endpoint: format!("tcp://{host}:{}", base_port + 1),
            publisher_endpoint: Some(format!("tcp://{host}:{}", base_port + 2)),
            metrics_port: Some(base_port + 3),
            ..Self::default()
        }
    }

    pub fn plaintext_transport(&self) -> Transport {
        parse_endpoint_to_transport(&self.plaintext_endpoint)
    }

    pub fn encrypted_transport(&self) -> Transport {
        parse_endpoint_to_transport(&self.encrypted_endpoint)
    }

    pub fn publisher_transport(&self) -> Option<Transport> {
        self.publisher_endpoint
            .as_deref()
            .map(parse_endpoint_to_transport)
    }

    pub fn heartbeat_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.heartbeat_interval_ms)
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply environment variable overrides.
    ///
    /// Convention: `BAHNHOF_KEY` overrides the matching top-level field.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("BAHNHOF_PLAINTEXT_ENDPOINT") {
            self.plaintext_endpoint = v;
        }
        if let Ok(v) = std::env::var("BAHNHOF_ENCRYPTED_ENDPOINT") {
            self.encrypted_endpoint = v;
        }
        if let Ok(v) = std::env::var("BAHNHOF_PUBLISHER_ENDPOINT") {
            self.publisher_endpoint = Some(v);
        }
        if let Ok(v) = std::env::var("BAHNHOF_CREDENTIALS_LOCATION") {
            self.credentials_location = Some(v);
        }
        if let Ok(v) = std::env::var("BAHNHOF_VERBOSE") {
            self.verbose = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("BAHNHOF_HEARTBEAT_INTERVAL_MS") {
            if let Ok(n) = v.parse() {
                self.heartbeat_interval_ms = n;
            }
        }
        if let Ok(v) = std::env::var("BAHNHOF_HEARTBEAT_LIVENESS") {
            if let Ok(n) = v.parse() {
                self.heartbeat_liveness = n;
            }
        }
        if let Ok(v) = std::env::var("BAHNHOF_METRICS_PORT") {
            if let Ok(n) = v.parse() {
                self.metrics_port = Some(n);
            }
        }
    }

    // ── Validation ──────────────────────────────────────────────────

    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.plaintext_endpoint == self.encrypted_endpoint {
            return Err(BrokerError::Config(
                "plaintext_endpoint and encrypted_endpoint must differ".into(),
            ));
        }
        if self.heartbeat_liveness == 0 {
            return Err(BrokerError::Config(
                "heartbeat_liveness must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Parse an endpoint string like "ipc:///tmp/foo.sock" or "tcp://host:port"
/// into a [`Transport`].
fn parse_endpoint_to_transport(endpoint: &str) -> Transport {
    if let Some(path) = endpoint.strip_prefix("ipc://") {
        let name = std::path::Path::new(path)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown");
        Transport::ipc(name)
    } else if let Some(addr) = endpoint.strip_prefix("tcp://") {
        if let Some((host, port_str)) = addr.rsplit_once(':') {
            let port = port_str.parse().unwrap_or(5555);
            Transport::tcp(host, port)
        } else {
            Transport::tcp(addr, 5555)
        }
    } else {
        Transport::ipc("unknown")
    }
}
