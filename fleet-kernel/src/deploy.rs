/**
 * DEPLOYMENT CONTROLLER - Pousse binaires + conf.d vers un nœud et vérifie son agent
 *
 * RÔLE :
 * `push` : copie le binaire de simulation, l'agent de métriques puis l'arbre
 * conf.d. Chaque étape échoue vite et nomme l'étape fautive ; aucun nettoyage
 * distant en cas d'échec (l'opérateur relance).
 * `verify_health` : GET sur l'endpoint health de l'agent, timeout court.
 */

use crate::error::{FleetError, Result};
use crate::registry::NodeRecord;
use crate::remote::{quote, RemoteExecutor};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const MAIN_BINARY_NAME: &str = "finalvudatasim";
pub const METRICS_BINARY_NAME: &str = "node_metrics_api";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeployStep {
    CreateDirs,
    CopyMainBinary,
    CopyMetricsAgent,
    CopyConfTree,
}

impl DeployStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployStep::CreateDirs => "create-dirs",
            DeployStep::CopyMainBinary => "copy-main-binary",
            DeployStep::CopyMetricsAgent => "copy-metrics-agent",
            DeployStep::CopyConfTree => "copy-conf-tree",
        }
    }
}

/// Fichiers locaux poussés sur chaque nœud
#[derive(Debug, Clone)]
pub struct ArtifactSet {
    pub main_binary: PathBuf,
    pub metrics_binary: PathBuf,
    pub confd_dir: PathBuf,
}

/// Corps attendu de l'endpoint health de l'agent
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HealthBody {
    status: Option<String>,
    node_id: Option<String>,
}

/// Résultat de la vérification health d'un nœud dans un contrôle de flotte
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeHealth {
    pub node_name: String,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub message: String,
}

pub struct DeploymentController {
    executor: Arc<dyn RemoteExecutor>,
    artifacts: ArtifactSet,
    http: reqwest::Client,
    health_path: String,
    health_timeout: Duration,
}

fn remote_join(dir: &str, file: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), file)
}

impl DeploymentController {
    pub fn new(executor: Arc<dyn RemoteExecutor>, artifacts: ArtifactSet, health_path: &str, health_timeout: Duration) -> Self {
        let health_path = if health_path.starts_with('/') {
            health_path.to_string()
        } else {
            format!("/{health_path}")
        };
        Self {
            executor,
            artifacts,
            http: reqwest::Client::new(),
            health_path,
            health_timeout,
        }
    }

    pub fn artifacts(&self) -> &ArtifactSet {
        &self.artifacts
    }

    /// Vérifie que les trois artefacts locaux existent avant toute action distante
    pub fn check_artifacts(&self) -> Result<()> {
        let files: [&Path; 2] = [&self.artifacts.main_binary, &self.artifacts.metrics_binary];
        for file in files {
            if !file.is_file() {
                return Err(FleetError::MissingArtifact(file.to_path_buf()));
            }
        }
        if !self.artifacts.confd_dir.is_dir() {
            return Err(FleetError::MissingArtifact(self.artifacts.confd_dir.clone()));
        }
        Ok(())
    }

    pub async fn push(&self, node: &NodeRecord) -> Result<()> {
        self.check_artifacts()?;
        tracing::info!("[deploy] pushing artifacts to {} ({}@{})", node.name, node.user, node.host);

        let mkdir = format!("mkdir -p {} {}", quote(&node.binary_dir), quote(&node.conf_dir));
        self.executor
            .exec(node, &mkdir)
            .await
            .map_err(|e| e.at_step(DeployStep::CreateDirs.as_str()))?;

        self.executor
            .copy(node, &self.artifacts.main_binary, &remote_join(&node.binary_dir, MAIN_BINARY_NAME))
            .await
            .map_err(|e| e.at_step(DeployStep::CopyMainBinary.as_str()))?;

        self.executor
            .copy(node, &self.artifacts.metrics_binary, &remote_join(&node.binary_dir, METRICS_BINARY_NAME))
            .await
            .map_err(|e| e.at_step(DeployStep::CopyMetricsAgent.as_str()))?;

        self.executor
            .copy_dir(node, &self.artifacts.confd_dir, &node.conf_dir)
            .await
            .map_err(|e| e.at_step(DeployStep::CopyConfTree.as_str()))?;

        tracing::info!("[deploy] artifacts pushed to {}", node.name);
        Ok(())
    }

    pub fn health_url(&self, node: &NodeRecord) -> String {
        format!("http://{}:{}{}", node.host, node.metrics_port, self.health_path)
    }

    /// Retourne le nodeId annoncé par l'agent si celui-ci répond `healthy`
    pub async fn verify_health(&self, node: &NodeRecord) -> Result<String> {
        let url = self.health_url(node);
        let resp = self
            .http
            .get(&url)
            .timeout(self.health_timeout)
            .send()
            .await
            .map_err(|e| FleetError::verification(&node.name, format!("request to {url} failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FleetError::verification(&node.name, format!("metrics agent returned HTTP {status}")));
        }

        let body: HealthBody = resp
            .json()
            .await
            .map_err(|e| FleetError::verification(&node.name, format!("invalid health JSON: {e}")))?;

        match body.status.as_deref() {
            Some("healthy") => {}
            other => {
                return Err(FleetError::verification(
                    &node.name,
                    format!("unexpected health status: {}", other.unwrap_or("<missing>")),
                ))
            }
        }
        match body.node_id {
            Some(id) if !id.is_empty() => {
                tracing::info!("[deploy] metrics agent healthy on {} (nodeId {})", node.name, id);
                Ok(id)
            }
            _ => Err(FleetError::verification(&node.name, "missing or empty nodeId in health response")),
        }
    }

    /// Vérifie chaque nœud indépendamment ; un échec n'interrompt pas les autres
    pub async fn health_all(&self, nodes: &[NodeRecord]) -> Vec<NodeHealth> {
        futures::future::join_all(nodes.iter().map(|node| async move {
            match self.verify_health(node).await {
                Ok(id) => NodeHealth {
                    node_name: node.name.clone(),
                    healthy: true,
                    message: format!("metrics agent healthy (nodeId {id})"),
                    node_id: Some(id),
                },
                Err(e) => {
                    tracing::warn!("[deploy] {}", e);
                    NodeHealth {
                        node_name: node.name.clone(),
                        healthy: false,
                        node_id: None,
                        message: e.to_string(),
                    }
                }
            }
        }))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_join_trims_trailing_slash() {
        assert_eq!(remote_join("/opt/sim/bin/", MAIN_BINARY_NAME), "/opt/sim/bin/finalvudatasim");
        assert_eq!(remote_join("bin", METRICS_BINARY_NAME), "bin/node_metrics_api");
    }

    #[test]
    fn test_step_names_are_stable() {
        assert_eq!(DeployStep::CopyConfTree.as_str(), "copy-conf-tree");
        assert_eq!(
            serde_json::to_string(&DeployStep::CopyMetricsAgent).unwrap(),
            "\"copy-metrics-agent\""
        );
    }
}
