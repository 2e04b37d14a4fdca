#![forbid(unsafe_code)]

//! `worker-cortex`: drive one configured worker from the terminal.
//!
//! Loads the worker through the cache, forwards every line read from stdin
//! as a request, prints each framed response, and unloads the worker on
//! end-of-input or a shutdown signal.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use worker_cortex::{AppError, GlobalConfig, Result, SessionRegistry, WorkerCache, WorkerProfile};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "worker-cortex", about = "Persistent stdio worker driver", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Name of the worker under `[workers.<name>]` to drive.
    #[arg(long)]
    worker: String,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("worker-cortex bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let config = GlobalConfig::load_from_path(&args.config)?;
    let profile = config.profile(&args.worker)?;
    info!(worker = args.worker, key = profile.key, "configuration loaded");

    let registry = Arc::new(SessionRegistry::new(config.registry.registry_config()));
    let cache = WorkerCache::from(Arc::clone(&registry));

    let session_id = profile.load(&cache).await?;
    info!(session_id, "worker ready; reading requests from stdin");

    let outcome = tokio::select! {
        result = serve_stdin(&registry, &profile, &session_id) => result,
        () = shutdown_signal() => {
            info!("shutdown signal received");
            Ok(())
        }
    };

    if let Err(err) = cache.unload_all().await {
        error!(%err, "error unloading workers");
    }
    if let Err(err) = registry.close_all().await {
        error!(%err, "error closing remaining sessions");
    }
    info!("worker-cortex shut down");

    outcome
}

async fn serve_stdin(
    registry: &SessionRegistry,
    profile: &WorkerProfile,
    session_id: &str,
) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match profile.request(registry, session_id, &line).await {
            Ok(response) => println!("{response}"),
            // The worker may still answer a later request.
            Err(err @ AppError::ResponseTimeout { .. }) => error!(%err, "request timed out"),
            Err(err) => return Err(err),
        }
    }

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
    // Logs go to stderr so stdout carries only worker responses.
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
