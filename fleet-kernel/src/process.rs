/**
 * PROCESS CONTROLLER - Statut / démarrage / arrêt du binaire de simulation sur un nœud
 *
 * FONCTIONNEMENT :
 * - Découverte du PID par recherche de processus distante (pgrep)
 * - Démarrage détaché (nohup) puis délai de stabilisation et re-vérification
 * - Arrêt : signal propre, escalade en kill -9 si échec
 * - Une re-vérification qui échoue = succès avec avertissement (la commande
 *   est partie, le processus peut encore être en train de démarrer)
 */

use crate::deploy::{MAIN_BINARY_NAME, METRICS_BINARY_NAME};
use crate::error::{FleetError, Result};
use crate::registry::NodeRecord;
use crate::remote::{quote, RemoteExecutor};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use time::macros::format_description;
use time::OffsetDateTime;

// Le motif entre crochets empêche le shell distant de se trouver lui-même
const SIM_PROCESS_QUERY: &str = "pgrep -f '[.]/finalvudatasim' || true";
const AGENT_PROCESS_QUERY: &str = "pgrep -f '[n]ode_metrics_api' || true";

/// Horodatage "YYYY-MM-DD HH:MM:SS" utilisé dans les rapports opérateur
pub fn timestamp_now() -> String {
    let fmt = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    OffsetDateTime::now_utc().format(&fmt).unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Running,
    Stopped,
    Disabled,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStatus {
    pub node_name: String,
    pub status: ProcessState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_info: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub last_checked: String,
}

impl ProcessStatus {
    fn new(node: &str, status: ProcessState) -> Self {
        Self {
            node_name: node.to_string(),
            status,
            pid: None,
            start_time: None,
            process_info: None,
            error: None,
            last_checked: timestamp_now(),
        }
    }
}

/// Résultat d'un start/stop : la commande est partie, la vérification peut être non concluante
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessOutcome {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ProcessStatus>,
}

/// Premier PID d'une sortie pgrep ; None si vide ou illisible
fn first_pid(output: &str) -> Option<u32> {
    output.lines().map(str::trim).find(|l| !l.is_empty())?.parse().ok()
}

pub struct ProcessController {
    executor: Arc<dyn RemoteExecutor>,
    settle: Duration,
}

impl ProcessController {
    pub fn new(executor: Arc<dyn RemoteExecutor>, settle: Duration) -> Self {
        Self { executor, settle }
    }

    /// Interroge le nœud ; les erreurs de transport sont propagées
    async fn query_status(&self, node: &NodeRecord) -> Result<ProcessStatus> {
        if !node.enabled {
            return Ok(ProcessStatus::new(&node.name, ProcessState::Disabled));
        }
        let output = self
            .executor
            .exec_captured(node, SIM_PROCESS_QUERY)
            .await
            .map_err(|e| e.at_step("status-check"))?;

        let Some(pid) = first_pid(&output) else {
            return Ok(ProcessStatus::new(&node.name, ProcessState::Stopped));
        };

        let mut status = ProcessStatus::new(&node.name, ProcessState::Running);
        status.pid = Some(pid);
        // détails best-effort : un échec ici ne change pas l'état
        if let Ok(start) = self.executor.exec_captured(node, &format!("ps -p {pid} -o lstart=")).await {
            let start = start.trim();
            if !start.is_empty() {
                status.start_time = Some(start.to_string());
            }
        }
        if let Ok(info) = self
            .executor
            .exec_captured(node, &format!("ps -p {pid} -o pid,ppid,pcpu,pmem,etime,cmd"))
            .await
        {
            let info = info.trim();
            if !info.is_empty() {
                status.process_info = Some(info.to_string());
            }
        }
        Ok(status)
    }

    pub async fn status(&self, node: &NodeRecord) -> ProcessStatus {
        match self.query_status(node).await {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!("[process] status check failed on {}: {}", node.name, e);
                let mut status = ProcessStatus::new(&node.name, ProcessState::Error);
                status.error = Some(e.to_string());
                status
            }
        }
    }

    pub async fn status_all(&self, nodes: &[NodeRecord]) -> Vec<ProcessStatus> {
        futures::future::join_all(nodes.iter().map(|n| self.status(n))).await
    }

    /// Re-vérifie après le délai de stabilisation ; ne produit jamais d'erreur
    async fn settle_and_check(&self, node: &NodeRecord, expect: ProcessState) -> (Option<ProcessStatus>, Option<String>) {
        tokio::time::sleep(self.settle).await;
        match self.query_status(node).await {
            Ok(status) if status.status == expect => (Some(status), None),
            Ok(status) => {
                let warning = format!(
                    "expected process to be {:?} after settle interval, found {:?}",
                    expect, status.status
                );
                (Some(status), Some(warning))
            }
            Err(e) => (None, Some(format!("status check failed: {e}"))),
        }
    }

    /// Démarre le binaire ; `timeout_minutes` programme un kill automatique
    pub async fn start(&self, node: &NodeRecord, timeout_minutes: Option<u32>) -> Result<ProcessOutcome> {
        if !node.enabled {
            return Err(FleetError::NodeDisabled(node.name.clone()));
        }
        let current = self.query_status(node).await?;
        if let (ProcessState::Running, Some(pid)) = (current.status, current.pid) {
            return Err(FleetError::AlreadyRunning { node: node.name.clone(), pid });
        }

        let start_cmd = format!(
            "cd {} && nohup ./{} > /dev/null 2>&1 & echo $!",
            quote(&node.binary_dir),
            MAIN_BINARY_NAME
        );
        let output = self
            .executor
            .exec_captured(node, &start_cmd)
            .await
            .map_err(|e| e.at_step("start"))?;
        let pid = output
            .lines()
            .rev()
            .find_map(|l| l.trim().parse::<u32>().ok())
            .ok_or_else(|| FleetError::transport(&node.name, "start", "failed to read PID of started process"))?;
        tracing::info!("[process] started {} on {} (PID {})", MAIN_BINARY_NAME, node.name, pid);

        if let Some(minutes) = timeout_minutes.filter(|m| *m > 0) {
            let kill_cmd = format!("(sleep {}; kill {}) >/dev/null 2>&1 &", u64::from(minutes) * 60, pid);
            if let Err(e) = self.executor.exec(node, &kill_cmd).await {
                tracing::warn!("[process] failed to schedule auto-stop on {}: {}", node.name, e);
            }
        }

        let (status, warning) = self.settle_and_check(node, ProcessState::Running).await;
        if let Some(w) = &warning {
            tracing::warn!("[process] start on {}: {}", node.name, w);
        }
        let message = match (timeout_minutes.filter(|m| *m > 0), &warning) {
            (_, Some(_)) => format!("Start command sent to node {}, verification inconclusive", node.name),
            (Some(m), None) => format!("Binary started on node {} (PID {}) with timeout {} min", node.name, pid, m),
            (None, None) => format!("Binary started on node {} (PID {})", node.name, pid),
        };
        Ok(ProcessOutcome {
            message,
            pid: Some(pid),
            warning,
            status,
        })
    }

    /// Arrête le binaire ; `deadline` borne la requête entière
    pub async fn stop(&self, node: &NodeRecord, deadline: Option<Duration>) -> Result<ProcessOutcome> {
        match deadline {
            Some(limit) => tokio::time::timeout(limit, self.stop_inner(node))
                .await
                .map_err(|_| FleetError::transport(&node.name, "stop", format!("timed out after {}s", limit.as_secs())))?,
            None => self.stop_inner(node).await,
        }
    }

    async fn stop_inner(&self, node: &NodeRecord) -> Result<ProcessOutcome> {
        if !node.enabled {
            return Err(FleetError::NodeDisabled(node.name.clone()));
        }
        let current = self.query_status(node).await?;
        let Some(pid) = current.pid.filter(|_| current.status == ProcessState::Running) else {
            return Err(FleetError::NotRunning(node.name.clone()));
        };

        if let Err(e) = self.executor.exec(node, &format!("kill {pid}")).await {
            tracing::warn!("[process] graceful kill failed on {} ({}), forcing", node.name, e);
            self.executor
                .exec(node, &format!("kill -9 {pid}"))
                .await
                .map_err(|e| e.at_step("stop"))?;
        }
        tracing::info!("[process] stop signal sent to PID {} on {}", pid, node.name);

        let (status, warning) = self.settle_and_check(node, ProcessState::Stopped).await;
        if let Some(w) = &warning {
            tracing::warn!("[process] stop on {}: {}", node.name, w);
        }
        let message = if warning.is_some() {
            format!("Stop command sent to node {}, verification inconclusive", node.name)
        } else {
            format!("Binary stopped on node {}", node.name)
        };
        Ok(ProcessOutcome {
            message,
            pid: Some(pid),
            warning,
            status,
        })
    }

    /// Lance l'agent de métriques déjà déployé dans binary_dir
    pub async fn start_metrics_agent(&self, node: &NodeRecord) -> Result<ProcessOutcome> {
        if !node.enabled {
            return Err(FleetError::NodeDisabled(node.name.clone()));
        }
        let running = self
            .executor
            .exec_captured(node, AGENT_PROCESS_QUERY)
            .await
            .map_err(|e| e.at_step("metrics-agent-check"))?;
        if let Some(pid) = first_pid(&running) {
            return Err(FleetError::AlreadyRunning { node: node.name.clone(), pid });
        }

        let binary = format!("{}/{}", node.binary_dir.trim_end_matches('/'), METRICS_BINARY_NAME);
        self.executor
            .exec(node, &format!("test -x {}", quote(&binary)))
            .await
            .map_err(|e| e.at_step("metrics-agent-check"))?;

        let start_cmd = format!(
            "cd {} && nohup ./{} --port {} > metrics_api.log 2>&1 & echo $!",
            quote(&node.binary_dir),
            METRICS_BINARY_NAME,
            node.metrics_port
        );
        let output = self
            .executor
            .exec_captured(node, &start_cmd)
            .await
            .map_err(|e| e.at_step("metrics-agent-start"))?;
        let pid = first_pid(output.lines().last().unwrap_or_default());
        tracing::info!("[process] metrics agent launched on {} (port {})", node.name, node.metrics_port);

        Ok(ProcessOutcome {
            message: format!("Metrics agent started on node {} (port {})", node.name, node.metrics_port),
            pid,
            warning: None,
            status: None,
        })
    }
}
