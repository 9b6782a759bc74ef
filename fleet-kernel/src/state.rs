/**
 * FLEET STATE - Instantané partagé de la simulation et des nœuds
 *
 * RÔLE :
 * État en mémoire (durée de vie = processus) lu par le dashboard et muté par
 * les handlers HTTP, le poller de métriques et les flux de déploiement.
 *
 * FONCTIONNEMENT :
 * - Un seul verrou lecture/écriture (parking_lot::RwLock)
 * - Le verrou ne couvre que la mutation en mémoire
 * - Chaque mutation publie un instantané au broadcaster APRÈS libération du verrou
 * - `version` est incrémentée sous le verrou : le broadcaster écarte tout
 *   instantané plus ancien que le dernier diffusé
 * - Seul `track_node` ajoute un nœud ; les mises à jour tardives d'un nœud
 *   retiré sont ignorées
 */

use crate::broadcast::BroadcastHandle;
use crate::error::{FleetError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;

pub type Shared<T> = Arc<RwLock<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(RwLock::new(value))
}

pub const MAX_TARGET_EPS: u64 = 100_000;

/// Métriques d'un nœud telles que vues par le dashboard
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetrics {
    pub node_id: String,
    pub status: String,
    pub eps: u64,
    pub kafka_load: u64,
    pub ch_load: u64,
    pub cpu: f64,
    pub memory: f64,
    pub total_cpu: f64,
    pub total_memory: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub last_update: OffsetDateTime,
}

impl NodeMetrics {
    pub fn new(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            status: "registered".to_string(),
            eps: 0,
            kafka_load: 0,
            ch_load: 0,
            cpu: 0.0,
            memory: 0.0,
            total_cpu: 0.0,
            total_memory: 0.0,
            last_update: OffsetDateTime::now_utc(),
        }
    }
}

/// Mise à jour partielle poussée par un nœud (POST /api/nodes/{name}/metrics)
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricsUpdate {
    pub eps: u64,
    pub kafka_load: u64,
    pub ch_load: u64,
    pub cpu: f64,
    pub memory: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationConfig {
    #[serde(default)]
    pub profile: String,
    pub target_eps: u64,
    #[serde(default)]
    pub target_kafka: u64,
    #[serde(default)]
    pub target_click_house: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetState {
    pub version: u64,
    pub is_simulation_running: bool,
    pub current_profile: String,
    pub target_eps: u64,
    pub target_kafka: u64,
    pub target_click_house: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    pub node_data: HashMap<String, NodeMetrics>,
}

impl FleetState {
    /// Nouvelle version, à appeler sous le verrou d'écriture
    fn bump(&mut self) -> FleetState {
        self.version += 1;
        self.clone()
    }
}

impl Default for FleetState {
    fn default() -> Self {
        Self {
            version: 0,
            is_simulation_running: false,
            current_profile: String::new(),
            target_eps: 0,
            target_kafka: 0,
            target_click_house: 0,
            start_time: OffsetDateTime::now_utc(),
            node_data: HashMap::new(),
        }
    }
}

/// Accès à l'état partagé + publication automatique après chaque mutation
#[derive(Clone)]
pub struct FleetStateHandle {
    inner: Shared<FleetState>,
    broadcaster: BroadcastHandle,
}

impl FleetStateHandle {
    pub fn new(broadcaster: BroadcastHandle) -> Self {
        Self {
            inner: new_state(FleetState::default()),
            broadcaster,
        }
    }

    pub fn snapshot(&self) -> FleetState {
        self.inner.read().clone()
    }

    pub fn broadcaster(&self) -> &BroadcastHandle {
        &self.broadcaster
    }

    fn publish(&self, snapshot: &FleetState) {
        self.broadcaster.publish_versioned(snapshot.version, snapshot);
    }

    pub fn start_simulation(&self, cfg: SimulationConfig) -> Result<FleetState> {
        let snapshot = {
            let mut st = self.inner.write();
            if st.is_simulation_running {
                return Err(FleetError::Conflict("Simulation is already running".into()));
            }
            if cfg.target_eps < 1 || cfg.target_eps > MAX_TARGET_EPS {
                return Err(FleetError::InvalidRequest(format!(
                    "Target EPS must be between 1 and {MAX_TARGET_EPS}"
                )));
            }
            st.is_simulation_running = true;
            st.current_profile = cfg.profile;
            st.target_eps = cfg.target_eps;
            st.target_kafka = cfg.target_kafka;
            st.target_click_house = cfg.target_click_house;
            st.start_time = OffsetDateTime::now_utc();
            st.bump()
        };
        tracing::info!(
            "[state] simulation started (profile: {}, target eps: {})",
            snapshot.current_profile,
            snapshot.target_eps
        );
        self.publish(&snapshot);
        Ok(snapshot)
    }

    pub fn stop_simulation(&self) -> Result<FleetState> {
        let snapshot = {
            let mut st = self.inner.write();
            if !st.is_simulation_running {
                return Err(FleetError::Conflict("No simulation is currently running".into()));
            }
            st.is_simulation_running = false;
            st.bump()
        };
        tracing::info!("[state] simulation stopped");
        self.publish(&snapshot);
        Ok(snapshot)
    }

    pub fn update_node_metrics(&self, node_id: &str, update: MetricsUpdate) -> Result<NodeMetrics> {
        let (node, snapshot) = {
            let mut st = self.inner.write();
            let Some(node) = st.node_data.get_mut(node_id) else {
                return Err(FleetError::NotFound(format!("Node {node_id} not found")));
            };
            node.eps = update.eps;
            node.kafka_load = update.kafka_load;
            node.ch_load = update.ch_load;
            node.cpu = update.cpu;
            node.memory = update.memory;
            node.last_update = OffsetDateTime::now_utc();
            let node = node.clone();
            (node, st.bump())
        };
        self.publish(&snapshot);
        Ok(node)
    }

    /// Remplace les métriques système d'un nœud suivi (utilisé par le poller)
    pub fn record_system_metrics(&self, node_id: &str, status: &str, cpu: f64, memory: f64, total_cpu: f64, total_memory: f64) {
        let snapshot = {
            let mut st = self.inner.write();
            let Some(node) = st.node_data.get_mut(node_id) else {
                tracing::debug!("[state] metrics for untracked node {} ignored", node_id);
                return;
            };
            node.status = status.to_string();
            node.cpu = cpu;
            node.memory = memory;
            node.total_cpu = total_cpu;
            node.total_memory = total_memory;
            node.last_update = OffsetDateTime::now_utc();
            st.bump()
        };
        self.publish(&snapshot);
    }

    pub fn track_node(&self, node_id: &str) {
        let snapshot = {
            let mut st = self.inner.write();
            if st.node_data.contains_key(node_id) {
                return;
            }
            st.node_data.insert(node_id.to_string(), NodeMetrics::new(node_id));
            st.bump()
        };
        self.publish(&snapshot);
    }

    pub fn untrack_node(&self, node_id: &str) {
        let snapshot = {
            let mut st = self.inner.write();
            if st.node_data.remove(node_id).is_none() {
                return;
            }
            st.bump()
        };
        self.publish(&snapshot);
    }

    /// Sans effet sur un nœud non suivi (retiré entre-temps)
    pub fn set_node_status(&self, node_id: &str, status: &str) {
        let snapshot = {
            let mut st = self.inner.write();
            let Some(node) = st.node_data.get_mut(node_id) else {
                tracing::debug!("[state] status {} for untracked node {} ignored", status, node_id);
                return;
            };
            if node.status == status {
                return;
            }
            node.status = status.to_string();
            node.last_update = OffsetDateTime::now_utc();
            st.bump()
        };
        self.publish(&snapshot);
    }
}
