/**
 * CONFD DISTRIBUTOR - Diffusion de l'arbre conf.d vers tous les nœuds activés
 *
 * FONCTIONNEMENT :
 * 1. Liste les nœuds activés (registre) ; flotte vide = succès 0/0
 * 2. Archive locale unique : tar -czf <archive_dir>/confd_backup.tar.gz -C <parent> conf.d
 * 3. Par nœud, en parallèle (borné par `workers`) :
 *    rm -rf <confDir>/conf.d -> mkdir -p <confDir> -> copie /tmp/confd_backup_<node>.tar.gz
 *    -> extraction -> test -d ; l'archive distante est supprimée quoi qu'il arrive
 * 4. Agrégat : succès si TOUS les nœuds ont réussi, sinon détail par nœud
 *
 * Un échec sur un nœud n'interrompt jamais les autres.
 */

use crate::error::{FleetError, Result};
use crate::process::timestamp_now;
use crate::registry::{NodeRecord, NodeRegistry};
use crate::remote::{quote, RemoteExecutor};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Mutex;

pub const ARCHIVE_NAME: &str = "confd_backup.tar.gz";
const DEFAULT_TREE_NAME: &str = "conf.d";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDistribution {
    pub node_name: String,
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionOutcome {
    pub success: bool,
    pub message: String,
    pub distributed_nodes: usize,
    pub total_nodes: usize,
    pub success_rate: String,
    pub failed_nodes: Vec<String>,
    pub nodes: BTreeMap<String, NodeDistribution>,
    pub completed_at: String,
}

impl DistributionOutcome {
    pub fn from_results(results: Vec<NodeDistribution>) -> Self {
        let total_nodes = results.len();
        let distributed_nodes = results.iter().filter(|r| r.success).count();
        let success_rate = format!("{distributed_nodes}/{total_nodes}");
        let nodes: BTreeMap<String, NodeDistribution> =
            results.into_iter().map(|r| (r.node_name.clone(), r)).collect();
        let failed_nodes = nodes.values().filter(|r| !r.success).map(|r| r.node_name.clone()).collect();
        let message = if total_nodes == 0 {
            "No enabled nodes found to distribute conf.d to".to_string()
        } else {
            format!("Conf.d distribution completed: {success_rate} nodes successful")
        };
        Self {
            success: distributed_nodes == total_nodes,
            message,
            distributed_nodes,
            total_nodes,
            success_rate,
            failed_nodes,
            nodes,
            completed_at: timestamp_now(),
        }
    }

    /// Au moins un nœud a réussi et au moins un a échoué
    pub fn is_partial(&self) -> bool {
        !self.success && self.distributed_nodes > 0
    }
}

pub struct ConfdDistributor {
    executor: Arc<dyn RemoteExecutor>,
    registry: Arc<NodeRegistry>,
    confd_dir: PathBuf,
    archive_dir: PathBuf,
    workers: usize,
    // une seule archive locale à la fois
    run_lock: Mutex<()>,
}

impl ConfdDistributor {
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        registry: Arc<NodeRegistry>,
        confd_dir: impl Into<PathBuf>,
        archive_dir: impl Into<PathBuf>,
        workers: usize,
    ) -> Self {
        Self {
            executor,
            registry,
            confd_dir: confd_dir.into(),
            archive_dir: archive_dir.into(),
            workers: workers.max(1),
            run_lock: Mutex::new(()),
        }
    }

    fn tree_name(&self) -> String {
        self.confd_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| DEFAULT_TREE_NAME.to_string())
    }

    pub fn archive_path(&self) -> PathBuf {
        self.archive_dir.join(ARCHIVE_NAME)
    }

    pub async fn distribute_all(&self) -> Result<DistributionOutcome> {
        let nodes = self.registry.list_enabled().await?;
        if nodes.is_empty() {
            tracing::info!("[confd] no enabled nodes, nothing to distribute");
            return Ok(DistributionOutcome::from_results(Vec::new()));
        }
        self.distribute_to(nodes).await
    }

    pub async fn distribute_to(&self, nodes: Vec<NodeRecord>) -> Result<DistributionOutcome> {
        if nodes.is_empty() {
            return Ok(DistributionOutcome::from_results(Vec::new()));
        }
        if !self.confd_dir.is_dir() {
            return Err(FleetError::MissingArtifact(self.confd_dir.clone()));
        }

        let _guard = self.run_lock.lock().await;
        let archive = self.archive_path();
        self.build_archive(&archive).await?;
        tracing::info!("[confd] distributing {} to {} nodes", archive.display(), nodes.len());

        let archive_ref = archive.as_path();
        let results: Vec<NodeDistribution> = stream::iter(nodes)
            .map(|node| async move {
                match self.distribute_to_node(&node, archive_ref).await {
                    Ok(()) => {
                        tracing::info!("[confd] conf.d distributed to {}", node.name);
                        NodeDistribution {
                            message: format!("conf.d distributed to {}", node.conf_dir),
                            node_name: node.name,
                            success: true,
                        }
                    }
                    Err(e) => {
                        tracing::warn!("[confd] distribution to {} failed: {}", node.name, e);
                        NodeDistribution {
                            node_name: node.name,
                            success: false,
                            message: e.to_string(),
                        }
                    }
                }
            })
            .buffer_unordered(self.workers)
            .collect()
            .await;

        if let Err(e) = tokio::fs::remove_file(&archive).await {
            tracing::warn!("[confd] failed to remove local archive {}: {}", archive.display(), e);
        }

        let outcome = DistributionOutcome::from_results(results);
        tracing::info!("[confd] {}", outcome.message);
        Ok(outcome)
    }

    async fn build_archive(&self, archive: &Path) -> Result<()> {
        tokio::fs::create_dir_all(&self.archive_dir).await?;
        let parent = match self.confd_dir.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let output = Command::new("tar")
            .arg("-czf")
            .arg(archive)
            .arg("-C")
            .arg(&parent)
            .arg(self.tree_name())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| FleetError::transport("local", "archive", format!("failed to spawn tar: {e}")))?;
        if !output.status.success() {
            return Err(FleetError::transport(
                "local",
                "archive",
                format!("tar exited with {}: {}", output.status, String::from_utf8_lossy(&output.stderr).trim()),
            ));
        }
        Ok(())
    }

    async fn distribute_to_node(&self, node: &NodeRecord, archive: &Path) -> Result<()> {
        let remote_archive = format!("/tmp/confd_backup_{}.tar.gz", node.name);
        let result = self.replace_tree(node, archive, &remote_archive).await;
        if let Err(e) = self.executor.exec(node, &format!("rm -f {}", quote(&remote_archive))).await {
            tracing::warn!("[confd] cleanup of {} on {} failed: {}", remote_archive, node.name, e);
        }
        result
    }

    async fn replace_tree(&self, node: &NodeRecord, archive: &Path, remote_archive: &str) -> Result<()> {
        let target = format!("{}/{}", node.conf_dir.trim_end_matches('/'), self.tree_name());
        let exec = self.executor.as_ref();

        exec.exec(node, &format!("rm -rf {}", quote(&target)))
            .await
            .map_err(|e| e.at_step("remove-old-tree"))?;
        exec.exec(node, &format!("mkdir -p {}", quote(&node.conf_dir)))
            .await
            .map_err(|e| e.at_step("create-parent"))?;
        exec.copy(node, archive, remote_archive)
            .await
            .map_err(|e| e.at_step("transfer-archive"))?;
        exec.exec(node, &format!("cd {} && tar -xzf {}", quote(&node.conf_dir), quote(remote_archive)))
            .await
            .map_err(|e| e.at_step("extract-archive"))?;
        exec.exec(node, &format!("test -d {}", quote(&target)))
            .await
            .map_err(|e| match e {
                FleetError::TransportFailure { node, .. } => {
                    FleetError::transport(&node, "verify-tree", format!("{target} missing after extraction"))
                }
                other => other,
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(name: &str, success: bool) -> NodeDistribution {
        NodeDistribution {
            node_name: name.into(),
            success,
            message: if success { "ok".into() } else { "scp exited with 1".into() },
        }
    }

    #[test]
    fn test_empty_fleet_is_success() {
        let outcome = DistributionOutcome::from_results(Vec::new());
        assert!(outcome.success);
        assert_eq!(outcome.success_rate, "0/0");
        assert_eq!(outcome.total_nodes, 0);
        assert!(!outcome.is_partial());
    }

    #[test]
    fn test_mixed_outcome_lists_failures() {
        let outcome = DistributionOutcome::from_results(vec![
            result("w1", true),
            result("w2", false),
            result("w3", true),
            result("w4", false),
        ]);
        assert!(!outcome.success);
        assert!(outcome.is_partial());
        assert_eq!(outcome.success_rate, "2/4");
        assert_eq!(outcome.failed_nodes, vec!["w2".to_string(), "w4".to_string()]);
        assert_eq!(outcome.nodes.len(), 4);
    }

    #[test]
    fn test_total_failure_is_not_partial() {
        let outcome = DistributionOutcome::from_results(vec![result("w1", false)]);
        assert!(!outcome.success);
        assert!(!outcome.is_partial());
    }
}
