//! bahnhof-broker — Majordomo-style request/reply broker.
//!
//! # Usage
//!
//! ```bash
//! # Local IPC (default)
//! bahnhof-broker
//!
//! # TCP with sequential ports starting at --base-port
//! bahnhof-broker --transport tcp --host 0.0.0.0 --base-port 5555
//!
//! # From a config file, with environment variable overrides (BAHNHOF_*)
//! bahnhof-broker --config /etc/bahnhof/broker.toml
//! ```

use std::sync::Arc;

use clap::Parser;
use stupid_bahnhof::auth::Authenticator;
use stupid_bahnhof::broker::{Broker, BrokerConfig};

/// Majordomo-style request/reply broker.
#[derive(Parser, Debug)]
#[command(name = "bahnhof-broker", version, about)]
struct Cli {
    /// Load configuration from a TOML file. Overrides --transport/--host/--base-port.
    #[arg(long, env = "BAHNHOF_CONFIG")]
    config: Option<String>,

    /// Transport type when no --config is given: "ipc" or "tcp".
    #[arg(long, env = "BAHNHOF_TRANSPORT", default_value = "ipc")]
    transport: String,

    /// TCP host to bind to (only used with --transport tcp).
    #[arg(long, env = "BAHNHOF_HOST", default_value = "0.0.0.0")]
    host: String,

    /// First of four sequentially assigned TCP ports: plaintext, encrypted,
    /// publisher, metrics (only used with --transport tcp).
    #[arg(long, env = "BAHNHOF_BASE_PORT", default_value_t = 5555)]
    base_port: u16,

    /// Directory of allowed peer identity files for the encrypted endpoint.
    /// Ignored when --config already sets credentials_location.
    #[arg(long, env = "BAHNHOF_CREDENTIALS_LOCATION")]
    credentials_location: Option<String>,
}

impl Cli {
    fn into_broker_config(&self) -> anyhow::Result<BrokerConfig> {
        if let Some(path) = &self.config {
            return Ok(BrokerConfig::from_file(path)?);
        }
        let mut cfg = match self.transport.as_str() {
            "tcp" => BrokerConfig::tcp(&self.host, self.base_port),
            _ => BrokerConfig::local(),
        };
        if let Some(location) = &self.credentials_location {
            cfg.credentials_location = Some(location.clone());
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    tracing::info!(?cli, "starting bahnhof-broker");

    let config = cli.into_broker_config()?;
    let broker = match &config.credentials_location {
        Some(path) => Arc::new(Broker::with_authenticator(
            config,
            Arc::new(Authenticator::from_directory(path)?),
        )),
        None => Arc::new(Broker::new(config)),
    };

    let broker_for_signal = broker.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        broker_for_signal.shutdown();
    });

    broker.run().await?;

    tracing::info!("bahnhof-broker exited cleanly");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for ctrl_c");
    }
}
