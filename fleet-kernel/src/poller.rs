//! Poller de métriques : interroge l'agent de chaque nœud activé à intervalle fixe
//! et replie CPU/mémoire dans `FleetState.nodeData`.

use crate::fleet::Fleet;
use crate::registry::NodeRecord;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AgentCpu {
    pub used_percent: f64,
    pub cores: f64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AgentMemory {
    pub total_gb: f64,
    pub used_percent: f64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AgentSystem {
    pub cpu: AgentCpu,
    pub memory: AgentMemory,
}

/// Sous-ensemble de `/api/system/metrics` utilisé par le kernel
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AgentMetrics {
    pub running: bool,
    pub system: AgentSystem,
}

async fn fetch(client: &reqwest::Client, node: &NodeRecord, timeout: Duration) -> Result<AgentMetrics, reqwest::Error> {
    let url = format!("http://{}:{}/api/system/metrics", node.host, node.metrics_port);
    client
        .get(url)
        .timeout(timeout)
        .send()
        .await?
        .error_for_status()?
        .json::<AgentMetrics>()
        .await
}

/// Un passage sur tous les nœuds activés
pub async fn poll_once(fleet: &Fleet, client: &reqwest::Client, timeout: Duration) {
    let nodes = match fleet.registry().list_enabled().await {
        Ok(nodes) => nodes,
        Err(e) => {
            tracing::warn!("[poller] cannot list nodes: {}", e);
            return;
        }
    };
    let results = futures::future::join_all(nodes.iter().map(|n| fetch(client, n, timeout))).await;
    for (node, res) in nodes.iter().zip(results) {
        match res {
            Ok(m) => {
                let status = if m.running { "active" } else { "idle" };
                fleet.state().record_system_metrics(
                    &node.name,
                    status,
                    m.system.cpu.used_percent,
                    m.system.memory.used_percent,
                    m.system.cpu.cores,
                    m.system.memory.total_gb,
                );
            }
            Err(e) => {
                tracing::debug!("[poller] {} unreachable: {}", node.name, e);
                fleet.state().set_node_status(&node.name, "unreachable");
            }
        }
    }
}

pub fn spawn_metrics_poller(
    fleet: Arc<Fleet>,
    every: Duration,
    timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let client = reqwest::Client::new();
        let mut tick = tokio::time::interval(every);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!("[poller] polling node metrics every {}s", every.as_secs());
        loop {
            tokio::select! {
                _ = tick.tick() => poll_once(&fleet, &client, timeout).await,
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("[poller] stopped");
    })
}
