//! Agent configuration
//!
//! Handles:
//! - CLI arguments with environment fallbacks (clap)
//! - Node identity resolution (explicit id, hostname, placeholder)
//! - Listening port selection with fallback when the requested port is busy

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use tokio::net::TcpListener;
use tracing::{info, warn};

/// How many ports above the requested one are tried before giving up
pub const PORT_SEARCH_SPAN: u16 = 100;

#[derive(Debug, Clone, Parser)]
#[command(name = "node_metrics_api", version, about = "Per-node metrics agent for the fleet kernel")]
pub struct AgentArgs {
    /// Port to listen on
    #[arg(long, env = "METRICS_PORT", default_value_t = 8085)]
    pub port: u16,

    /// Identifier reported to the kernel (defaults to the hostname)
    #[arg(long, env = "NODE_ID")]
    pub node_id: Option<String>,

    /// Substring matched against process names and command lines
    #[arg(long, default_value = "finalvudatasim")]
    pub process_pattern: String,

    /// Seconds between two metric refreshes
    #[arg(long, default_value_t = 1)]
    pub interval_secs: u64,

    #[arg(long, default_value = "0.0.0.0")]
    pub bind: String,

    /// File receiving the effective port when the requested one was busy
    #[arg(long, default_value = "metrics.port")]
    pub port_file: PathBuf,
}

/// Explicit id, then hostname, then a fixed placeholder
pub fn resolve_node_id(explicit: Option<&str>) -> String {
    if let Some(id) = explicit.map(str::trim).filter(|id| !id.is_empty()) {
        return id.to_string();
    }
    let host = gethostname::gethostname().to_string_lossy().trim().to_string();
    if host.is_empty() {
        "unknown-node".to_string()
    } else {
        host
    }
}

/// Binds `port`, or the first free port in the following `PORT_SEARCH_SPAN`
pub async fn bind_with_fallback(host: &str, port: u16) -> Result<(TcpListener, u16)> {
    let last = port.saturating_add(PORT_SEARCH_SPAN);
    for candidate in port..=last {
        match TcpListener::bind((host, candidate)).await {
            Ok(listener) => {
                let bound = listener.local_addr().context("Failed to read bound address")?.port();
                if candidate != port {
                    warn!("Port {} busy, using {} instead", port, bound);
                }
                return Ok((listener, bound));
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => continue,
            Err(e) => return Err(e).with_context(|| format!("Failed to bind {host}:{candidate}")),
        }
    }
    bail!("No free port between {} and {}", port, last)
}

/// Records the effective port so the operator (or the kernel) can find the agent
pub async fn write_port_file(path: &Path, port: u16) -> Result<()> {
    tokio::fs::write(path, format!("{port}\n"))
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    info!("Effective port {} written to {}", port, path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_node_id_wins() {
        assert_eq!(resolve_node_id(Some("  sim-07 ")), "sim-07");
        assert!(!resolve_node_id(Some("   ")).is_empty());
        assert!(!resolve_node_id(None).is_empty());
    }

    #[test]
    fn test_defaults() {
        let args = AgentArgs::parse_from(["node_metrics_api"]);
        assert_eq!(args.process_pattern, "finalvudatasim");
        assert_eq!(args.interval_secs, 1);
        assert_eq!(args.port_file, PathBuf::from("metrics.port"));

        let args = AgentArgs::parse_from(["node_metrics_api", "--port", "9100", "--node-id", "w1"]);
        assert_eq!(args.port, 9100);
        assert_eq!(args.node_id.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn test_busy_port_falls_back() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let (_listener, bound) = bind_with_fallback("127.0.0.1", port).await.unwrap();
        assert_ne!(bound, port);
        assert!(bound > port && bound <= port.saturating_add(PORT_SEARCH_SPAN));
    }

    #[tokio::test]
    async fn test_port_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.port");
        write_port_file(&path, 8086).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "8086\n");
    }
}
