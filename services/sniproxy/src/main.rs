//! sniproxy
//!
//! L4 reverse proxy that routes TCP connections by TLS SNI or HTTP `Host:`
//! without terminating either protocol.
//!
//! This service:
//! - Loads listen ports and forward rules from a YAML file
//! - Accepts TCP connections on every configured port
//! - Sniffs a hostname from the first bytes of each connection
//! - Proxies the connection to the matching backend
//! - Reloads forward rules on SIGHUP (and Ctrl+D with `--ctrl-d`)

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sniproxy::reload::{spawn_hangup_source, spawn_stdin_source};
use sniproxy::{Config, ConfigStore, Listener, ListenerConfig, Reloader};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Route TCP connections by TLS SNI or HTTP Host header.
#[derive(Parser, Debug)]
#[command(name = "sniproxy", version, about)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long, env = "SNIPROXY_CONFIG", default_value = "config.yaml")]
    config: PathBuf,

    /// Reload on Ctrl+D; require Ctrl+C twice to exit.
    #[arg(short = 'd', long)]
    ctrl_d: bool,

    /// Log level, used when RUST_LOG is unset.
    #[arg(long, env = "SNIPROXY_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log output format.
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Prefer RUST_LOG, fall back to --log-level
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    match args.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }

    info!(version = env!("CARGO_PKG_VERSION"), "Starting sniproxy");

    let config = Config::load(&args.config)
        .with_context(|| format!("Failed to load config {}", args.config.display()))?;
    info!(
        config_path = %args.config.display(),
        listen = ?config.listen,
        rule_count = config.forward_rules.len(),
        has_default = !config.default.is_empty(),
        "Configuration loaded"
    );

    // Listen ports are taken from the initial record only.
    let ports = config.listen.clone();
    let store = Arc::new(ConfigStore::new(config));

    for port in ports {
        let listener = Listener::bind(ListenerConfig::any_v4(port), Arc::clone(&store))
            .await
            .with_context(|| format!("Failed to bind port {}", port))?;

        let listener = Arc::new(listener);
        tokio::spawn(async move {
            if let Err(e) = listener.run().await {
                error!(port = port, error = %e, "Listener error");
            }
        });
    }

    let (trigger_tx, trigger_rx) = mpsc::channel(8);
    spawn_hangup_source(trigger_tx.clone()).context("Failed to install SIGHUP handler")?;
    if args.ctrl_d {
        spawn_stdin_source(trigger_tx.clone());
    }
    let reloaded = Reloader::new(&args.config, Arc::clone(&store)).spawn(trigger_rx);

    wait_for_shutdown(args.ctrl_d, reloaded).await?;

    // Keep the trigger channel open until shutdown.
    drop(trigger_tx);
    info!("Shutting down");
    Ok(())
}

/// Resolve once SIGTERM arrives, or on Ctrl+C.
///
/// With `ctrl_d`, a single Ctrl+C only warns; a second one exits unless a
/// reload happened in between.
async fn wait_for_shutdown(ctrl_d: bool, mut reloaded: mpsc::Receiver<()>) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut interrupts = 0u32;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received");
                return Ok(());
            }
            _ = sigint.recv() => {
                if !ctrl_d {
                    return Ok(());
                }
                interrupts += 1;
                if interrupts < 2 {
                    warn!("Ctrl+C again to exit");
                    continue;
                }
                warn!("Ctrl+C pressed twice");
                return Ok(());
            }
            Some(()) = reloaded.recv() => {
                interrupts = 0;
            }
        }
    }
}
