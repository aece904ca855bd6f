//! ISX Pulse backend: a license-gated market-data pipeline for the Iraq Stock Exchange.
//!
//! Scrapes daily ticker reports, processes them into per-ticker CSVs, builds sector/market
//! indexes, and scores liquidity — all orchestrated behind an HTTP + WebSocket control surface.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode as ProcessExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use isx_pulse::api::{build_router, AppConfig, AppState};
use isx_pulse::events::Hub;
use isx_pulse::license::{crypto, LicenseManager};
use isx_pulse::manifest::ManifestReader;
use isx_pulse::operation::OperationManager;
use isx_pulse::queue::JobQueue;
use isx_pulse::stages::default_registry;

const DEFAULT_HEARTBEAT_SECS: u64 = 30;
const QUEUE_CAPACITY: usize = 256;
const WORKER_COUNT: usize = 4;

#[derive(Debug, Parser)]
#[command(name = "isx-pulse", version, about = "ISX market-data pipeline")]
struct Cli {
    /// Workspace root holding reports, CSVs, manifests, and the encrypted license (§6).
    #[arg(long, env = "WORKSPACE_DIR", default_value = "./workspace")]
    workspace: PathBuf,

    /// Address the HTTP/WebSocket server binds to.
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    listen: String,

    /// Log verbosity; overridden by `RUST_LOG` filter syntax if set.
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_level: String,

    /// Pretty-printed logs and stack traces in Problem responses, instead of JSON.
    #[arg(long)]
    dev: bool,

    /// Optional hex-encoded secret mixed into the license-record at-rest key (§6); falls back to
    /// a fixed in-binary default if unset. Set this to keep `license.bin` unreadable by a stock
    /// build of this binary.
    #[arg(long, env = "LICENSE_SALT")]
    license_salt: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Default, Subcommand)]
enum Commands {
    /// Run the HTTP/WebSocket server (default).
    #[default]
    Serve,
    /// Recompute every manifest's hash chain under the workspace and report tamper, if any.
    Verify,
}

#[repr(u8)]
enum ExitCode {
    Ok = 0,
    Config = 2,
    License = 3,
    Workspace = 4,
    Internal = 5,
}

#[tokio::main]
async fn main() -> ProcessExitCode {
    dotenv().ok();
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.dev);

    let license_secret = match &cli.license_salt {
        Some(salt) => match hex::decode(salt) {
            Ok(bytes) => bytes,
            Err(_) => {
                error!(salt = %salt, "LICENSE_SALT is not valid hex");
                return exit(ExitCode::Config);
            }
        },
        None => crypto::DEFAULT_SECRET.to_vec(),
    };

    match cli.command.unwrap_or_default() {
        Commands::Serve => run_serve(cli.workspace, cli.listen, cli.dev, license_secret).await,
        Commands::Verify => run_verify(cli.workspace).await,
    }
}

async fn run_verify(workspace: PathBuf) -> ProcessExitCode {
    let results = ManifestReader::verify_workspace(&workspace);
    if results.is_empty() {
        info!(workspace = %workspace.display(), "no manifests found");
        return exit(ExitCode::Ok);
    }

    let mut failed = false;
    for (path, result) in results {
        match result {
            Ok(lines) => info!(manifest = %path.display(), lines, "chain intact"),
            Err(e) => {
                failed = true;
                error!(manifest = %path.display(), error = %e, "chain verification failed");
            }
        }
    }

    if failed {
        exit(ExitCode::Workspace)
    } else {
        exit(ExitCode::Ok)
    }
}

async fn run_serve(workspace: PathBuf, listen: String, dev: bool, license_secret: Vec<u8>) -> ProcessExitCode {
    if let Err(e) = tokio::fs::create_dir_all(&workspace).await {
        error!(workspace = %workspace.display(), error = %e, "failed to create workspace");
        return exit(ExitCode::Workspace);
    }

    let license = Arc::new(LicenseManager::new(&workspace, license_secret));
    match license.validate(false).await {
        Ok(record) => info!(email = %record.email, status = ?record.status, "license valid at startup"),
        Err(e) => warn!(error = %e, "no valid license at startup, waiting for activation"),
    }

    let hub = Hub::new();
    let hub_handle = hub.handle();
    let _heartbeat = hub.spawn_heartbeat_ticker(Duration::from_secs(DEFAULT_HEARTBEAT_SECS));

    let registry = Arc::new(default_registry());
    let queue = JobQueue::new(QUEUE_CAPACITY, WORKER_COUNT);
    let _workers = queue.clone().spawn_workers(WORKER_COUNT);

    let manager = Arc::new(OperationManager::new(
        registry,
        queue,
        hub_handle.clone(),
        workspace.clone(),
    ));

    let prometheus = match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
        Ok(handle) => handle,
        Err(e) => {
            error!(error = %e, "failed to install prometheus recorder");
            return exit(ExitCode::Internal);
        }
    };

    let state = AppState {
        manager: manager.clone(),
        license,
        hub: hub_handle,
        config: AppConfig {
            workspace_root: workspace,
            listen_addr: listen.clone(),
            dev,
        },
        prometheus,
    };

    let app = build_router(state);

    let addr: SocketAddr = match listen.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(listen = %listen, error = %e, "invalid --listen address");
            return exit(ExitCode::Config);
        }
    };

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %addr, error = %e, "failed to bind listener");
            return exit(ExitCode::Internal);
        }
    };

    info!(addr = %addr, "isx-pulse listening");

    let result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(manager.clone()))
    .await
    .context("server error");

    if let Err(e) = result {
        error!(error = %e, "server exited with error");
        return exit(ExitCode::Internal);
    }

    exit(ExitCode::Ok)
}

/// Waits for SIGINT/SIGTERM, then cancels every live operation's root token (§4.10 C12).
async fn shutdown_signal(manager: Arc<OperationManager>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received, canceling live operations");
    manager.shutdown();
}

fn init_tracing(log_level: &str, dev: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("isx_pulse={log_level},tower_http=info").into());

    let registry = tracing_subscriber::registry().with(filter);
    if dev {
        registry.with(tracing_subscriber::fmt::layer().pretty()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    }
}

fn exit(code: ExitCode) -> ProcessExitCode {
    ProcessExitCode::from(code as u8)
}
