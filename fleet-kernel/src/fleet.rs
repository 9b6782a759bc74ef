/**
 * FLEET - Façade opérateur : un seul objet construit au démarrage, partagé via Arc
 *
 * RÔLE :
 * Orchestration des composants (registre, déploiement, processus, EPS, conf.d,
 * état partagé). Chaque opération opérateur renvoie une `ApiResponse`.
 *
 * RÈGLES :
 * - add_node    : persiste, pousse ; échec du push => l'entrée est supprimée
 * - enable_node : persiste, pousse, vérifie ; échecs = avertissements, pas de retour arrière
 * - remove_node : refusé pendant un déploiement en cours sur ce nœud
 * - Les I/O distantes ne se font jamais sous le verrou de l'état partagé
 */

use crate::api::ApiResponse;
use crate::config::KernelConfig;
use crate::confd::{ConfdDistributor, DistributionOutcome};
use crate::deploy::{ArtifactSet, DeploymentController};
use crate::error::{FleetError, Result};
use crate::process::ProcessController;
use crate::registry::{ClusterSettings, NodeRecord, NodeRegistry};
use crate::remote::{check_connectivity, Connectivity, RemoteExecutor, SshExecutor};
use crate::sources::{ConfigMutator, DistributionReport, EpsAllocator, MaxEpsTable};
use crate::state::{FleetStateHandle, MetricsUpdate, SimulationConfig};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Données de `distribute_eps`, avec la diffusion conf.d si demandée
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EpsDistribution {
    #[serde(flatten)]
    pub report: DistributionReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confd: Option<DistributionOutcome>,
}

/// Marque un nœud comme "déploiement en cours" jusqu'au drop
struct DeployGuard<'a> {
    in_flight: &'a Mutex<HashSet<String>>,
    name: String,
}

impl Drop for DeployGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.name);
    }
}

pub struct Fleet {
    registry: Arc<NodeRegistry>,
    executor: Arc<dyn RemoteExecutor>,
    deployer: DeploymentController,
    processes: ProcessController,
    allocator: EpsAllocator,
    confd: ConfdDistributor,
    state: FleetStateHandle,
    snapshots_dir: PathBuf,
    backups_dir: PathBuf,
    in_flight: Mutex<HashSet<String>>,
}

impl Fleet {
    /// Construction de production : ssh/scp avec les timeouts du registre
    pub async fn from_config(cfg: &KernelConfig, state: FleetStateHandle) -> Result<Self> {
        let registry = Arc::new(NodeRegistry::new(cfg.registry_file.clone()));
        // lecture anticipée : un registre invalide fait échouer le démarrage
        registry.settings().await?;
        let executor: Arc<dyn RemoteExecutor> = Arc::new(SshExecutor::new(registry.clone()));
        let table = MaxEpsTable::load(&cfg.max_eps_file).await?;
        Ok(Self::assemble(cfg, registry, executor, table, state))
    }

    /// Construction avec un transport fourni (tests, transports alternatifs)
    pub fn with_executor(
        cfg: &KernelConfig,
        executor: Arc<dyn RemoteExecutor>,
        table: MaxEpsTable,
        state: FleetStateHandle,
    ) -> Self {
        let registry = Arc::new(NodeRegistry::new(cfg.registry_file.clone()));
        Self::assemble(cfg, registry, executor, table, state)
    }

    fn assemble(
        cfg: &KernelConfig,
        registry: Arc<NodeRegistry>,
        executor: Arc<dyn RemoteExecutor>,
        table: MaxEpsTable,
        state: FleetStateHandle,
    ) -> Self {
        let artifacts = ArtifactSet {
            main_binary: cfg.artifacts.main_binary.clone(),
            metrics_binary: cfg.artifacts.metrics_binary.clone(),
            confd_dir: cfg.confd_dir.clone(),
        };
        Self {
            deployer: DeploymentController::new(executor.clone(), artifacts, &cfg.health_path, cfg.health_timeout()),
            processes: ProcessController::new(executor.clone(), cfg.settle()),
            allocator: EpsAllocator::new(table, ConfigMutator::new(cfg.confd_dir.clone())),
            confd: ConfdDistributor::new(
                executor.clone(),
                registry.clone(),
                cfg.confd_dir.clone(),
                cfg.archive_dir(),
                cfg.confd_workers,
            ),
            registry,
            executor,
            state,
            snapshots_dir: cfg.snapshots_dir.clone(),
            backups_dir: cfg.backups_dir.clone(),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn state(&self) -> &FleetStateHandle {
        &self.state
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn allocator(&self) -> &EpsAllocator {
        &self.allocator
    }

    pub fn deployer(&self) -> &DeploymentController {
        &self.deployer
    }

    /// Reporte les nœuds déjà enregistrés dans l'état partagé (démarrage)
    pub async fn track_registered(&self) -> Result<usize> {
        let nodes = self.registry.list().await?;
        for node in &nodes {
            self.state.track_node(&node.name);
            if !node.enabled {
                self.state.set_node_status(&node.name, "disabled");
            }
        }
        Ok(nodes.len())
    }

    fn begin_deploy(&self, name: &str) -> Result<DeployGuard<'_>> {
        let mut set = self.in_flight.lock();
        if !set.insert(name.to_string()) {
            return Err(FleetError::Conflict(format!("a deployment to node {name} is already in progress")));
        }
        Ok(DeployGuard {
            in_flight: &self.in_flight,
            name: name.to_string(),
        })
    }

    // ---- nœuds ----------------------------------------------------------

    pub async fn list_nodes(&self) -> ApiResponse {
        ApiResponse::from_result(self.registry.list().await, |nodes| format!("Retrieved {} nodes", nodes.len()))
    }

    pub async fn add_node(&self, record: NodeRecord) -> ApiResponse {
        match self.try_add_node(record).await {
            Ok(record) => ApiResponse::ok_with(format!("Node {} added and deployed", record.name), &record),
            Err(e) => ApiResponse::fail(&e),
        }
    }

    async fn try_add_node(&self, record: NodeRecord) -> Result<NodeRecord> {
        let _deploy = self.begin_deploy(&record.name)?;
        self.registry.insert(record.clone()).await?;

        if let Err(e) = self.deployer.push(&record).await {
            tracing::warn!("[registry] push to new node {} failed, rolling back: {}", record.name, e);
            if let Err(rollback) = self.registry.delete(&record.name).await {
                tracing::error!("[registry] rollback of {} failed: {}", record.name, rollback);
            }
            return Err(e);
        }

        self.state.track_node(&record.name);
        if !record.enabled {
            self.state.set_node_status(&record.name, "disabled");
        }
        Ok(record)
    }

    pub async fn remove_node(&self, name: &str) -> ApiResponse {
        let removed = match self.begin_deploy(name) {
            Ok(_deploy) => self.registry.delete(name).await,
            Err(_) => Err(FleetError::Conflict(format!(
                "node {name} cannot be removed while a deployment is in flight"
            ))),
        };
        let record = match removed {
            Ok(record) => record,
            Err(e) => return ApiResponse::fail(&e),
        };

        self.state.untrack_node(name);
        for dir in [self.snapshots_dir.join(name), self.backups_dir.join(name)] {
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => tracing::info!("[registry] removed {}", dir.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("[registry] failed to clean {}: {}", dir.display(), e),
            }
        }
        ApiResponse::ok_with(format!("Node {name} removed"), &record)
    }

    pub async fn enable_node(&self, name: &str) -> ApiResponse {
        let _deploy = match self.begin_deploy(name) {
            Ok(guard) => guard,
            Err(e) => return ApiResponse::fail(&e),
        };
        let record = match self.registry.set_enabled(name, true).await {
            Ok(record) => record,
            Err(e) => return ApiResponse::fail(&e),
        };
        self.state.track_node(name);

        let mut warnings = Vec::new();
        if let Err(e) = self.deployer.push(&record).await {
            tracing::warn!("[registry] node {} enabled but push failed: {}", name, e);
            warnings.push(e.to_string());
        }
        let node_id = match self.deployer.verify_health(&record).await {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!("[registry] node {} enabled but health check failed: {}", name, e);
                warnings.push(e.to_string());
                None
            }
        };

        let status = if warnings.is_empty() { "healthy" } else { "degraded" };
        self.state.set_node_status(name, status);
        let message = if warnings.is_empty() {
            format!("Node {name} enabled")
        } else {
            format!("Node {name} enabled with warnings")
        };
        ApiResponse::ok_with(
            message,
            &json!({ "node": record, "nodeId": node_id, "status": status, "warnings": warnings }),
        )
    }

    /// Ne touche pas aux processus distants (voir stop_process)
    pub async fn disable_node(&self, name: &str) -> ApiResponse {
        match self.registry.set_enabled(name, false).await {
            Ok(record) => {
                self.state.set_node_status(name, "disabled");
                ApiResponse::ok_with(format!("Node {name} disabled"), &record)
            }
            Err(e) => ApiResponse::fail(&e),
        }
    }

    pub async fn fleet_health(&self) -> ApiResponse {
        let nodes = match self.registry.list_enabled().await {
            Ok(nodes) => nodes,
            Err(e) => return ApiResponse::fail(&e),
        };
        let report = self.deployer.health_all(&nodes).await;
        for h in &report {
            self.state.set_node_status(&h.node_name, if h.healthy { "healthy" } else { "degraded" });
        }
        let healthy = report.iter().filter(|h| h.healthy).count();
        ApiResponse::ok_with(format!("{}/{} nodes healthy", healthy, report.len()), &report)
    }

    pub async fn connectivity_report(&self) -> ApiResponse {
        let nodes = match self.registry.list_enabled().await {
            Ok(nodes) => nodes,
            Err(e) => return ApiResponse::fail(&e),
        };
        let exec = self.executor.as_ref();
        let report = futures::future::join_all(nodes.iter().map(|n| check_connectivity(exec, n))).await;
        let connected = report.iter().filter(|r| r.status == Connectivity::Connected).count();
        ApiResponse::ok_with(format!("{}/{} nodes reachable", connected, report.len()), &report)
    }

    // ---- paramètres du cluster -----------------------------------------

    pub async fn settings(&self) -> ApiResponse {
        ApiResponse::from_result(self.registry.settings().await, |_| "Cluster settings".to_string())
    }

    /// Pris en compte dès l'appel distant suivant (le transport relit le registre)
    pub async fn update_settings(&self, settings: ClusterSettings) -> ApiResponse {
        match self.registry.update_settings(settings.clone()).await {
            Ok(()) => {
                tracing::info!(
                    "[registry] cluster settings updated (connect {}s, sync {}s)",
                    settings.connection_timeout,
                    settings.sync_timeout
                );
                ApiResponse::ok_with("Cluster settings updated", &settings)
            }
            Err(e) => ApiResponse::fail(&e),
        }
    }

    // ---- processus ------------------------------------------------------

    pub async fn process_status(&self, name: &str) -> ApiResponse {
        match self.registry.get(name).await {
            Ok(node) => {
                let status = self.processes.status(&node).await;
                ApiResponse::ok_with(format!("Status of node {name}"), &status)
            }
            Err(e) => ApiResponse::fail(&e),
        }
    }

    pub async fn process_status_all(&self) -> ApiResponse {
        match self.registry.list().await {
            Ok(nodes) => {
                let statuses = self.processes.status_all(&nodes).await;
                ApiResponse::ok_with(format!("Retrieved status for {} nodes", statuses.len()), &statuses)
            }
            Err(e) => ApiResponse::fail(&e),
        }
    }

    pub async fn start_process(&self, name: &str, timeout_minutes: Option<u32>) -> ApiResponse {
        let res = match self.registry.get(name).await {
            Ok(node) => self.processes.start(&node, timeout_minutes).await,
            Err(e) => Err(e),
        };
        match res {
            Ok(outcome) => {
                self.state.set_node_status(name, "active");
                ApiResponse::ok_with(outcome.message.clone(), &outcome)
            }
            Err(e) => ApiResponse::fail(&e),
        }
    }

    pub async fn stop_process(&self, name: &str, timeout_secs: Option<u64>) -> ApiResponse {
        let res = match self.registry.get(name).await {
            Ok(node) => self.processes.stop(&node, timeout_secs.map(Duration::from_secs)).await,
            Err(e) => Err(e),
        };
        match res {
            Ok(outcome) => {
                self.state.set_node_status(name, "idle");
                ApiResponse::ok_with(outcome.message.clone(), &outcome)
            }
            Err(e) => ApiResponse::fail(&e),
        }
    }

    pub async fn start_metrics_agent(&self, name: &str) -> ApiResponse {
        let res = match self.registry.get(name).await {
            Ok(node) => self.processes.start_metrics_agent(&node).await,
            Err(e) => Err(e),
        };
        ApiResponse::from_result(res, |o| o.message.clone())
    }

    // ---- sources / EPS ---------------------------------------------------

    pub async fn list_sources(&self) -> ApiResponse {
        let enabled = match self.allocator.enabled_sources().await {
            Ok(enabled) => enabled,
            Err(e) => return ApiResponse::fail(&e),
        };
        let available = self.allocator.available_sources();
        ApiResponse::ok_with(
            format!("{} sources available, {} enabled", available.len(), enabled.len()),
            &json!({
                "availableSources": available,
                "enabledSources": enabled,
                "maxEps": self.allocator.table().entries(),
            }),
        )
    }

    pub async fn source_details(&self, name: &str) -> ApiResponse {
        ApiResponse::from_result(self.allocator.source_details(name).await, |info| {
            format!("Source {} generates {} EPS", info.source_name, info.assigned_eps)
        })
    }

    pub async fn enable_source(&self, name: &str) -> ApiResponse {
        match self.allocator.enable_source(name).await {
            Ok(()) => ApiResponse::ok(format!("Source {name} enabled")),
            Err(e) => ApiResponse::fail(&e),
        }
    }

    pub async fn disable_source(&self, name: &str) -> ApiResponse {
        match self.allocator.disable_source(name).await {
            Ok(()) => ApiResponse::ok(format!("Source {name} disabled")),
            Err(e) => ApiResponse::fail(&e),
        }
    }

    pub async fn current_eps(&self) -> ApiResponse {
        match self.allocator.breakdown().await {
            Ok(breakdown) => {
                let total: u64 = breakdown.values().map(|i| i.assigned_eps).sum();
                ApiResponse::ok_with(
                    format!("Current total EPS: {total}"),
                    &json!({ "currentEps": total, "sourceBreakdown": breakdown }),
                )
            }
            Err(e) => ApiResponse::fail(&e),
        }
    }

    /// Répartit l'EPS ; `propagate` enchaîne la diffusion conf.d vers les nœuds activés
    pub async fn distribute_eps(&self, selected: &[String], total_eps: i64, propagate: bool) -> ApiResponse {
        let report = match self.allocator.distribute(selected, total_eps).await {
            Ok(report) => report,
            Err(e) => return ApiResponse::fail(&e),
        };
        let message = format!(
            "Successfully distributed {} EPS across {} sources",
            report.total_eps,
            report.selected_sources.len()
        );
        if !propagate {
            return ApiResponse::ok_with(message, &EpsDistribution { report, confd: None });
        }

        match self.confd.distribute_all().await {
            Ok(outcome) => {
                self.record_distribution(&outcome);
                let msg = format!("{message}; {}", outcome.message);
                let success = outcome.success;
                let data = EpsDistribution { report, confd: Some(outcome) };
                if success {
                    ApiResponse::ok_with(msg, &data)
                } else {
                    // la configuration locale est écrite : toujours partiel
                    ApiResponse::incomplete(msg, &data, true)
                }
            }
            Err(e) => {
                tracing::warn!("[eps] allocation persisted but conf.d distribution failed: {}", e);
                ApiResponse::incomplete(
                    format!("{message}; conf.d distribution failed: {e}"),
                    &EpsDistribution { report, confd: None },
                    true,
                )
            }
        }
    }

    // ---- conf.d -----------------------------------------------------------

    pub async fn distribute_confd(&self) -> ApiResponse {
        match self.confd.distribute_all().await {
            Ok(outcome) => {
                self.record_distribution(&outcome);
                if outcome.success {
                    ApiResponse::ok_with(outcome.message.clone(), &outcome)
                } else {
                    ApiResponse::incomplete(outcome.message.clone(), &outcome, outcome.is_partial())
                }
            }
            Err(e) => ApiResponse::fail(&e),
        }
    }

    fn record_distribution(&self, outcome: &DistributionOutcome) {
        for name in &outcome.failed_nodes {
            self.state.set_node_status(name, "config-sync-failed");
        }
    }

    // ---- simulation -------------------------------------------------------

    pub fn start_simulation(&self, cfg: SimulationConfig) -> ApiResponse {
        ApiResponse::from_result(self.state.start_simulation(cfg), |st| {
            format!("Simulation started with profile {}", st.current_profile)
        })
    }

    pub fn stop_simulation(&self) -> ApiResponse {
        ApiResponse::from_result(self.state.stop_simulation(), |_| "Simulation stopped".to_string())
    }

    pub fn update_node_metrics(&self, node_id: &str, update: MetricsUpdate) -> ApiResponse {
        ApiResponse::from_result(self.state.update_node_metrics(node_id, update), |m| {
            format!("Metrics updated for node {}", m.node_id)
        })
    }
}
