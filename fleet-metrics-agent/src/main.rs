//! Fleet Metrics Agent - per-node HTTP metrics endpoint
//!
//! Deployed next to the simulation binary on every fleet node:
//! - Answers the kernel's health checks after each deployment
//! - Reports host metrics and the state of the simulation process
//! - Falls back to the next free port when the requested one is busy

mod config;
mod http;
mod metrics;

use anyhow::{Context, Result};
use clap::Parser;
use config::AgentArgs;
use metrics::{Collector, MetricsSnapshot};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args = AgentArgs::parse();
    let node_id = config::resolve_node_id(args.node_id.as_deref());
    info!("Starting fleet metrics agent v{} (node {})", env!("CARGO_PKG_VERSION"), node_id);

    let (listener, port) = config::bind_with_fallback(&args.bind, args.port)
        .await
        .context("Failed to open the metrics port")?;
    if port != args.port {
        config::write_port_file(&args.port_file, port).await?;
    }

    let snapshot = Arc::new(RwLock::new(MetricsSnapshot::empty(&node_id)));
    let collector = Collector::new(&node_id, &args.process_pattern);
    let every = Duration::from_secs(args.interval_secs.max(1));
    let collector_task = metrics::spawn_collector(snapshot.clone(), collector, every);

    let app = http::build_router(http::AgentState::new(&node_id, snapshot));
    info!("Listening on {}:{}", args.bind, port);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await
        .context("HTTP server failed")?;

    collector_task.abort();
    Ok(())
}
