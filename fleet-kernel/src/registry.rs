/**
 * NODE REGISTRY - Registre persistant des nœuds de la flotte
 *
 * RÔLE : Stockage durable des NodeRecord + ClusterSettings (nodes.yaml).
 *
 * FONCTIONNEMENT :
 * - Chaque opération relit le fichier entier, le modifie, le réécrit (atomique)
 * - Un verrou interne sérialise les appelants concurrents
 * - Aucun cache mémoire : le fichier est la seule source de vérité
 *
 * Les flux qui combinent registre + déploiement (ajout avec rollback,
 * activation avec push) vivent dans `fleet.rs`.
 */

use crate::error::{FleetError, Result};
use crate::persist::write_atomic;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;

pub const DEFAULT_METRICS_PORT: u16 = 8085;

/// Paramètres globaux du cluster (bloc `cluster_settings:`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    pub backup_retention_days: u32,
    pub conflict_resolution: String,
    pub connection_timeout: u64, // secondes, timeout de connexion ssh
    pub max_retries: u32,
    pub sync_timeout: u64,       // secondes, borne d'un appel distant complet
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            backup_retention_days: 30,
            conflict_resolution: "manual".into(),
            connection_timeout: 10,
            max_retries: 3,
            sync_timeout: 60,
        }
    }
}

impl ClusterSettings {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout)
    }
}

/// Un nœud de la flotte, tel qu'exposé à l'API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub name: String,
    pub host: String,
    pub user: String,
    pub key_path: String,
    pub conf_dir: String,
    pub binary_dir: String,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub enabled: bool,
}

fn default_metrics_port() -> u16 {
    DEFAULT_METRICS_PORT
}

/// Entrée telle que stockée sur disque (le nom est la clé de la map)
#[derive(Debug, Clone, Serialize, Deserialize)]
struct NodeEntry {
    host: String,
    user: String,
    #[serde(default)]
    key_path: String,
    #[serde(default)]
    conf_dir: String,
    #[serde(default)]
    binary_dir: String,
    #[serde(default = "default_metrics_port")]
    metrics_port: u16,
    #[serde(default)]
    description: String,
    #[serde(default)]
    enabled: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    cluster_settings: ClusterSettings,
    #[serde(default)]
    nodes: BTreeMap<String, NodeEntry>,
}

impl NodeEntry {
    fn into_record(self, name: &str) -> NodeRecord {
        NodeRecord {
            name: name.to_string(),
            host: self.host,
            user: self.user,
            key_path: self.key_path,
            conf_dir: self.conf_dir,
            binary_dir: self.binary_dir,
            metrics_port: self.metrics_port,
            description: self.description,
            enabled: self.enabled,
        }
    }
}

impl From<&NodeRecord> for NodeEntry {
    fn from(r: &NodeRecord) -> Self {
        Self {
            host: r.host.clone(),
            user: r.user.clone(),
            key_path: r.key_path.clone(),
            conf_dir: r.conf_dir.clone(),
            binary_dir: r.binary_dir.clone(),
            metrics_port: r.metrics_port,
            description: r.description.clone(),
            enabled: r.enabled,
        }
    }
}

impl NodeRecord {
    fn validate(&self) -> Result<()> {
        let missing: Vec<&str> = [
            ("name", &self.name),
            ("host", &self.host),
            ("user", &self.user),
            ("binary_dir", &self.binary_dir),
            ("conf_dir", &self.conf_dir),
        ]
        .into_iter()
        .filter(|(_, v)| v.trim().is_empty())
        .map(|(k, _)| k)
        .collect();
        if !missing.is_empty() {
            return Err(FleetError::InvalidRequest(format!(
                "node record is missing required fields: {}",
                missing.join(", ")
            )));
        }
        if self.name.contains('/') || self.name.contains(char::is_whitespace) {
            return Err(FleetError::InvalidRequest(format!("invalid node name: {:?}", self.name)));
        }
        Ok(())
    }
}

pub struct NodeRegistry {
    path: PathBuf,
    lock: Mutex<()>,
}

impl NodeRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_file(&self) -> Result<RegistryFile> {
        if !self.path.exists() {
            return Ok(RegistryFile::default());
        }
        let content = tokio::fs::read_to_string(&self.path).await?;
        if content.trim().is_empty() {
            return Ok(RegistryFile::default());
        }
        serde_yaml::from_str(&content).map_err(|e| FleetError::config(&self.path, e.to_string()))
    }

    async fn write_file(&self, file: &RegistryFile) -> Result<()> {
        let content = serde_yaml::to_string(file)?;
        write_atomic(&self.path, content.as_bytes()).await?;
        Ok(())
    }

    /// Ajoute un nœud ; `AlreadyExists` si le nom est pris
    pub async fn insert(&self, record: NodeRecord) -> Result<()> {
        record.validate()?;
        let _guard = self.lock.lock().await;
        let mut file = self.read_file().await?;
        if file.nodes.contains_key(&record.name) {
            return Err(FleetError::AlreadyExists(format!("node {} already exists", record.name)));
        }
        file.nodes.insert(record.name.clone(), NodeEntry::from(&record));
        self.write_file(&file).await?;
        tracing::info!("[registry] added node {} ({}@{})", record.name, record.user, record.host);
        Ok(())
    }

    /// Supprime un nœud ; le fichier n'est pas touché si le nœud est absent
    pub async fn delete(&self, name: &str) -> Result<NodeRecord> {
        let _guard = self.lock.lock().await;
        let mut file = self.read_file().await?;
        let Some(entry) = file.nodes.remove(name) else {
            return Err(FleetError::NotFound(format!("node {name} not found")));
        };
        self.write_file(&file).await?;
        tracing::info!("[registry] removed node {}", name);
        Ok(entry.into_record(name))
    }

    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<NodeRecord> {
        let _guard = self.lock.lock().await;
        let mut file = self.read_file().await?;
        let Some(entry) = file.nodes.get_mut(name) else {
            return Err(FleetError::NotFound(format!("node {name} not found")));
        };
        entry.enabled = enabled;
        let record = entry.clone().into_record(name);
        self.write_file(&file).await?;
        tracing::info!("[registry] node {} {}", name, if enabled { "enabled" } else { "disabled" });
        Ok(record)
    }

    pub async fn get(&self, name: &str) -> Result<NodeRecord> {
        let _guard = self.lock.lock().await;
        let mut file = self.read_file().await?;
        file.nodes
            .remove(name)
            .map(|e| e.into_record(name))
            .ok_or_else(|| FleetError::NotFound(format!("node {name} not found")))
    }

    pub async fn list(&self) -> Result<Vec<NodeRecord>> {
        let _guard = self.lock.lock().await;
        let file = self.read_file().await?;
        Ok(file
            .nodes
            .into_iter()
            .map(|(name, e)| e.into_record(&name))
            .collect())
    }

    pub async fn list_enabled(&self) -> Result<Vec<NodeRecord>> {
        Ok(self.list().await?.into_iter().filter(|n| n.enabled).collect())
    }

    pub async fn settings(&self) -> Result<ClusterSettings> {
        let _guard = self.lock.lock().await;
        Ok(self.read_file().await?.cluster_settings)
    }

    pub async fn update_settings(&self, settings: ClusterSettings) -> Result<()> {
        if settings.connection_timeout == 0 || settings.sync_timeout == 0 {
            return Err(FleetError::InvalidRequest("timeouts must be greater than 0".into()));
        }
        let _guard = self.lock.lock().await;
        let mut file = self.read_file().await?;
        file.cluster_settings = settings;
        self.write_file(&file).await
    }
}
