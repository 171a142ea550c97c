#![forbid(unsafe_code)]

//! `host-relay` hosts a line-framed endpoint on TCP, WebSocket and named
//! pipe listeners.
//!
//! Loads the configuration, starts every configured server and the IPC
//! control socket for `host-relay-ctl`, then drains all servers on SIGINT
//! or SIGTERM.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use host_relay::config::GlobalConfig;
use host_relay::ipc::server::spawn_ipc_server;
use host_relay::server::ServerRegistry;
use host_relay::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "host-relay", about = "Line-framed endpoint host", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Stop servers without waiting for connections to drain.
    #[arg(long)]
    force_shutdown: bool,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("host-relay bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let config = GlobalConfig::load_from_path(&args.config)?;
    let specs = config.server_specs()?;
    info!(servers = specs.len(), "configuration loaded");

    // ── Start servers ───────────────────────────────────
    let registry = ServerRegistry::new();
    for spec in specs {
        let label = spec.name.clone().unwrap_or_else(|| spec.kind.to_string());
        match registry.start(spec).await {
            Ok(handle) => info!(
                server = %handle.name(),
                local = ?handle.local_address(),
                "server started"
            ),
            Err(err) => {
                error!(server = %label, %err, "server failed to start");
                registry.stop_all(true).await;
                return Err(err);
            }
        }
    }

    // ── Start IPC control socket ────────────────────────
    let ct = CancellationToken::new();
    let ipc_handle = match spawn_ipc_server(&config.ipc_name, registry.clone(), ct.clone()) {
        Ok(handle) => Some(handle),
        Err(err) => {
            warn!(%err, "control socket unavailable; continuing without it");
            None
        }
    };

    info!("host-relay ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    // ── Drain servers ───────────────────────────────────
    for summary in registry.stop_all(args.force_shutdown).await {
        info!(server = %summary.name, state = ?summary.state, "server shut down");
    }

    if let Some(handle) = ipc_handle {
        let _ = handle.await;
    }
    info!("host-relay shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
