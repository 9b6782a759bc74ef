/**
 * FLEET KERNEL - Point d'entrée : serveur HTTP/WebSocket ou commandes ponctuelles
 *
 * RÔLE : Chargement config (.env + fleet.yaml), logging, construction unique de `Fleet`,
 * puis `serve` (défaut) ou une commande opérateur qui imprime l'ApiResponse en JSON.
 * Code de sortie non nul si `success=false`.
 */

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use fleet_kernel::broadcast::spawn_broadcaster;
use fleet_kernel::config::load_config;
use fleet_kernel::http::{build_router, AppState};
use fleet_kernel::poller::spawn_metrics_poller;
use fleet_kernel::registry::DEFAULT_METRICS_PORT;
use fleet_kernel::state::FleetStateHandle;
use fleet_kernel::{ApiResponse, Fleet, FleetError, NodeRecord};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fleet-kernel", version, about = "Fleet controller for remote simulation nodes")]
struct Cli {
    #[command(subcommand)]
    cmd: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run the HTTP/WebSocket server (default)
    Serve,
    /// Manage registered nodes
    #[command(subcommand)]
    Node(NodeCmd),
    /// Query or control the simulation binary on a node
    #[command(subcommand)]
    Process(ProcessCmd),
    /// Inspect and toggle source modules
    #[command(subcommand)]
    Source(SourceCmd),
    /// Distribute or inspect EPS
    #[command(subcommand)]
    Eps(EpsCmd),
    /// Push the conf.d tree to every enabled node
    #[command(subcommand)]
    Confd(ConfdCmd),
    /// Show or change the cluster-wide settings
    #[command(subcommand)]
    Settings(SettingsCmd),
}

#[derive(Subcommand, Debug)]
enum NodeCmd {
    List,
    Add(AddNodeArgs),
    Remove { name: String },
    Enable { name: String },
    Disable { name: String },
}

#[derive(Args, Debug)]
struct AddNodeArgs {
    name: String,
    #[arg(long)]
    host: String,
    #[arg(long)]
    user: String,
    #[arg(long, default_value = "")]
    key_path: String,
    #[arg(long)]
    conf_dir: String,
    #[arg(long)]
    binary_dir: String,
    #[arg(long, default_value_t = DEFAULT_METRICS_PORT)]
    metrics_port: u16,
    #[arg(long, default_value = "")]
    description: String,
    /// Register the node as enabled
    #[arg(long)]
    enabled: bool,
}

#[derive(Subcommand, Debug)]
enum ProcessCmd {
    Status { name: Option<String> },
    Start {
        name: String,
        /// Auto-stop after this many minutes
        #[arg(long)]
        timeout_minutes: Option<u32>,
    },
    Stop {
        name: String,
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
}

#[derive(Subcommand, Debug)]
enum SourceCmd {
    List,
    Details { name: String },
    Enable { name: String },
    Disable { name: String },
}

#[derive(Subcommand, Debug)]
enum EpsCmd {
    Distribute {
        #[arg(long, value_delimiter = ',', required = true)]
        sources: Vec<String>,
        #[arg(long)]
        total: i64,
        /// Also push conf.d to every enabled node
        #[arg(long)]
        propagate: bool,
    },
    Current,
}

#[derive(Subcommand, Debug)]
enum ConfdCmd {
    Distribute,
}

#[derive(Subcommand, Debug)]
enum SettingsCmd {
    Show,
    /// Only the given values change
    Set(SettingsArgs),
}

#[derive(Args, Debug)]
struct SettingsArgs {
    /// ssh connection timeout, seconds
    #[arg(long)]
    connection_timeout: Option<u64>,
    /// Bound of one remote call, seconds
    #[arg(long)]
    sync_timeout: Option<u64>,
    #[arg(long)]
    max_retries: Option<u32>,
    #[arg(long)]
    backup_retention_days: Option<u32>,
    #[arg(long)]
    conflict_resolution: Option<String>,
}

async fn update_settings(fleet: &Fleet, a: SettingsArgs) -> ApiResponse {
    let mut settings = match fleet.registry().settings().await {
        Ok(settings) => settings,
        Err(e) => return ApiResponse::fail(&e),
    };
    if let Some(v) = a.connection_timeout {
        settings.connection_timeout = v;
    }
    if let Some(v) = a.sync_timeout {
        settings.sync_timeout = v;
    }
    if let Some(v) = a.max_retries {
        settings.max_retries = v;
    }
    if let Some(v) = a.backup_retention_days {
        settings.backup_retention_days = v;
    }
    if let Some(v) = a.conflict_resolution {
        settings.conflict_resolution = v;
    }
    fleet.update_settings(settings).await
}

async fn run_command(fleet: &Fleet, cmd: Cmd) -> ApiResponse {
    match cmd {
        Cmd::Serve => ApiResponse::fail(&FleetError::InvalidRequest("serve is not a one-shot command".into())),
        Cmd::Node(NodeCmd::List) => fleet.list_nodes().await,
        Cmd::Node(NodeCmd::Add(a)) => {
            let record = NodeRecord {
                name: a.name,
                host: a.host,
                user: a.user,
                key_path: a.key_path,
                conf_dir: a.conf_dir,
                binary_dir: a.binary_dir,
                metrics_port: a.metrics_port,
                description: a.description,
                enabled: a.enabled,
            };
            fleet.add_node(record).await
        }
        Cmd::Node(NodeCmd::Remove { name }) => fleet.remove_node(&name).await,
        Cmd::Node(NodeCmd::Enable { name }) => fleet.enable_node(&name).await,
        Cmd::Node(NodeCmd::Disable { name }) => fleet.disable_node(&name).await,
        Cmd::Process(ProcessCmd::Status { name: Some(name) }) => fleet.process_status(&name).await,
        Cmd::Process(ProcessCmd::Status { name: None }) => fleet.process_status_all().await,
        Cmd::Process(ProcessCmd::Start { name, timeout_minutes }) => fleet.start_process(&name, timeout_minutes).await,
        Cmd::Process(ProcessCmd::Stop { name, timeout_secs }) => fleet.stop_process(&name, timeout_secs).await,
        Cmd::Source(SourceCmd::List) => fleet.list_sources().await,
        Cmd::Source(SourceCmd::Details { name }) => fleet.source_details(&name).await,
        Cmd::Source(SourceCmd::Enable { name }) => fleet.enable_source(&name).await,
        Cmd::Source(SourceCmd::Disable { name }) => fleet.disable_source(&name).await,
        Cmd::Eps(EpsCmd::Distribute { sources, total, propagate }) => {
            fleet.distribute_eps(&sources, total, propagate).await
        }
        Cmd::Eps(EpsCmd::Current) => fleet.current_eps().await,
        Cmd::Confd(ConfdCmd::Distribute) => fleet.distribute_confd().await,
        Cmd::Settings(SettingsCmd::Show) => fleet.settings().await,
        Cmd::Settings(SettingsCmd::Set(a)) => update_settings(fleet, a).await,
    }
}

async fn serve(fleet: Arc<Fleet>, listen: &str, poll_every: Duration, poll_timeout: Duration) -> anyhow::Result<()> {
    let tracked = fleet.track_registered().await.context("loading node registry")?;
    tracing::info!("[kernel] {} registered nodes", tracked);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = if poll_every.is_zero() {
        None
    } else {
        Some(spawn_metrics_poller(fleet.clone(), poll_every, poll_timeout, shutdown_rx))
    };

    let app = build_router(AppState { fleet });
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    tracing::info!("[kernel] listening on {}", listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("[kernel] ctrl-c handler failed: {}", e);
            }
            tracing::info!("[kernel] shutting down");
        })
        .await
        .context("http server")?;

    let _ = shutdown_tx.send(true);
    if let Some(handle) = poller {
        let _ = handle.await;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env optionnel
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fleet_kernel=info")))
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let cfg = load_config().await.context("loading kernel configuration")?;

    let state = FleetStateHandle::new(spawn_broadcaster());
    let fleet = Arc::new(
        Fleet::from_config(&cfg, state)
            .await
            .context("initialising fleet")?,
    );

    match cli.cmd.unwrap_or(Cmd::Serve) {
        Cmd::Serve => {
            serve(
                fleet,
                &cfg.listen,
                Duration::from_secs(cfg.metrics_poll_secs),
                cfg.health_timeout(),
            )
            .await
        }
        cmd => {
            let resp = run_command(&fleet, cmd).await;
            println!("{}", serde_json::to_string_pretty(&resp)?);
            if !resp.success {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}
