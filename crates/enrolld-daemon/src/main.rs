//! enrolld - Registration Allocation Daemon
//!
//! Timer-driven allocation cycles over the shared store, plus the
//! Unix-socket control plane for manual cycle triggers and
//! human-verification resumes. External collaborators (submission, payment,
//! notification delivery) are reached over HTTP using the endpoints in the
//! `[collaborators]` config section.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use enrolld_core::config::DaemonConfig;
use enrolld_core::token::TokenService;
use enrolld_daemon::engine::Engine;
use enrolld_daemon::engine::http::{HttpNotifier, HttpPaymentClient, HttpSubmissionClient};
use enrolld_daemon::server;
use enrolld_daemon::store::Store;
use tokio::net::UnixListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio::time::MissedTickBehavior;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// enrolld daemon - camp registration allocation engine
#[derive(Parser, Debug)]
#[command(name = "enrolld")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "enrolld.toml")]
    config: PathBuf,

    /// Override the database path from the config file
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Override the control socket path from the config file
    #[arg(long)]
    control_socket: Option<PathBuf>,

    /// Run a single allocation cycle, print the report, and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = DaemonConfig::from_file(&args.config)
        .with_context(|| format!("loading config from {}", args.config.display()))?;
    config
        .collaborators
        .require_endpoints()
        .context("collaborator endpoints are required to start the daemon")?;

    let db_path = args.db_path.unwrap_or_else(|| config.daemon.db_path.clone());
    let socket_path = args
        .control_socket
        .unwrap_or_else(|| config.daemon.control_socket.clone());

    let store = Store::open(&db_path)
        .with_context(|| format!("opening database at {}", db_path.display()))?;
    let tokens = TokenService::new(&config.daemon.token_secret_hex)
        .context("building the resume token service")?;

    let submission = Arc::new(HttpSubmissionClient::new(
        &config.collaborators.submission_url,
        config.engine.submission_timeout,
    ));
    let payment = Arc::new(HttpPaymentClient::new(
        &config.collaborators.payment_url,
        config.engine.charge_timeout,
    ));
    let notifier = Arc::new(HttpNotifier::new(
        &config.collaborators.notify_url,
        config.engine.submission_timeout,
    ));

    let engine = Arc::new(Engine::new(
        store,
        tokens,
        config.engine.clone(),
        submission,
        payment,
        notifier,
    ));

    if args.once {
        let report = engine.run_cycle(None).await;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    // Replace a stale socket left by an unclean shutdown.
    match std::fs::remove_file(&socket_path) {
        Ok(()) => info!(socket = %socket_path.display(), "removed stale control socket"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {},
        Err(err) => {
            return Err(err)
                .with_context(|| format!("clearing control socket {}", socket_path.display()));
        },
    }
    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("binding control socket {}", socket_path.display()))?;

    let mut server_task = tokio::spawn(server::serve(Arc::clone(&engine), listener));

    let mut interval = tokio::time::interval(config.engine.cycle_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;

    info!(
        db = %db_path.display(),
        socket = %socket_path.display(),
        interval = ?config.engine.cycle_interval,
        "enrolld started"
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {
                engine.run_cycle(None).await;
            },
            _ = sigint.recv() => {
                info!("SIGINT received; shutting down");
                break;
            },
            _ = sigterm.recv() => {
                info!("SIGTERM received; shutting down");
                break;
            },
            joined = &mut server_task => {
                match joined {
                    Ok(Ok(())) => error!("control plane stopped unexpectedly"),
                    Ok(Err(err)) => error!(%err, "control plane failed"),
                    Err(err) => error!(%err, "control plane task panicked"),
                }
                break;
            },
        }
    }

    server_task.abort();
    if let Err(err) = std::fs::remove_file(&socket_path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            error!(%err, "failed to remove control socket");
        }
    }
    Ok(())
}
