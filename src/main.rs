//! Control plane server.
//!
//! ```text
//!                 ┌──────────────────────────────────────────────────────────────┐
//!                 │                        CONTROL PLANE                         │
//!  operator ──────┼─▶ admin API ──▶ orchestrator ──▶ hooks ──▶ managed services │
//!                 │                    ▲                                         │
//!                 │                    │ convergence        ┌───────────────┐    │
//!                 │   health monitor ──┴──▶ event bus ──────▶│ recovery      │    │
//!                 │        │                  │              │ backend pools │    │
//!                 │        ▼                  ▼              └───────────────┘    │
//!                 │     registry        state changes                           │
//!                 │                                                             │
//!  client ────────┼─▶ /route ──▶ router ──▶ cache ──▶ balancer ──▶ breaker ──────┼──▶ backends
//!                 └──────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use control_plane::config::{load_config, ControlPlaneConfig};
use control_plane::lifecycle::shutdown_signal;
use control_plane::observability::{init_logging, init_metrics};
use control_plane::{ApiServer, ControlPlane};

#[derive(Parser)]
#[command(name = "control-plane")]
#[command(about = "Orchestration and routing control plane", long_about = None)]
struct Args {
    /// TOML configuration file. Watched for hot reload.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override `api.bind_address`.
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => ControlPlaneConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.api.bind_address = bind;
    }

    init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), config = ?args.config, "control-plane starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = TcpListener::bind(&config.api.bind_address).await?;
    let auto_startup = config.orchestrator.auto_startup;

    let plane = Arc::new(ControlPlane::new(config)?);
    let tasks = plane.spawn_background(args.config.as_deref())?;

    if auto_startup {
        let orchestrator = plane.orchestrator.clone();
        tokio::spawn(async move {
            match orchestrator.startup(&[]).await {
                Ok(report) => tracing::info!(duration_ms = report.duration_ms, "Initial startup complete"),
                Err(e) => tracing::error!(error = %e, "Initial startup failed"),
            }
        });
    }

    ApiServer::new(plane.clone()).run(listener, shutdown_signal()).await?;

    plane.stop(tasks).await;
    tracing::info!("Shutdown complete");
    Ok(())
}
