use crate::error::{FleetError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// Configuration du kernel (fleet.yaml)
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct KernelConfig {
    pub listen: String,
    pub registry_file: PathBuf,
    pub max_eps_file: PathBuf,
    pub confd_dir: PathBuf,
    pub artifacts: ArtifactsConf,
    pub snapshots_dir: PathBuf,
    pub backups_dir: PathBuf,
    pub health_path: String,
    pub health_timeout_secs: u64,
    pub settle_secs: u64,
    pub confd_workers: usize,
    pub metrics_poll_secs: u64,
    pub archive_dir: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ArtifactsConf {
    pub main_binary: PathBuf,    // ex: "bin/finalvudatasim"
    pub metrics_binary: PathBuf, // ex: "bin/node_metrics_api"
}

impl Default for ArtifactsConf {
    fn default() -> Self {
        Self {
            main_binary: PathBuf::from("bin/finalvudatasim"),
            metrics_binary: PathBuf::from("bin/node_metrics_api"),
        }
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".into(),
            registry_file: PathBuf::from("configs/nodes.yaml"),
            max_eps_file: PathBuf::from("configs/max_eps.yaml"),
            confd_dir: PathBuf::from("conf.d"),
            artifacts: ArtifactsConf::default(),
            snapshots_dir: PathBuf::from("snapshots"),
            backups_dir: PathBuf::from("backups"),
            health_path: "/health".into(),
            health_timeout_secs: 5,
            settle_secs: 2,
            confd_workers: 4,
            metrics_poll_secs: 0,
            archive_dir: None,
        }
    }
}

impl KernelConfig {
    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.archive_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Ré-ancre tous les chemins relatifs sous `base`
    pub fn rooted_at(mut self, base: &Path) -> Self {
        let root = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        root(&mut self.registry_file);
        root(&mut self.max_eps_file);
        root(&mut self.confd_dir);
        root(&mut self.artifacts.main_binary);
        root(&mut self.artifacts.metrics_binary);
        root(&mut self.snapshots_dir);
        root(&mut self.backups_dir);
        if let Some(dir) = self.archive_dir.as_mut() {
            root(dir);
        }
        self
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(listen) = std::env::var("FLEET_LISTEN") {
            self.listen = listen;
        }
        if let Ok(dir) = std::env::var("FLEET_CONFD_DIR") {
            self.confd_dir = PathBuf::from(dir);
        }
    }
}

pub async fn load_config_from(path: &Path) -> Result<KernelConfig> {
    let mut cfg = if path.exists() {
        let txt = fs::read_to_string(path).await?;
        if txt.trim().is_empty() {
            KernelConfig::default()
        } else {
            serde_yaml::from_str(&txt).map_err(|e| FleetError::config(path, e.to_string()))?
        }
    } else {
        tracing::warn!("[kernel] pas de {}, usage config par défaut", path.display());
        KernelConfig::default()
    };
    cfg.apply_env_overrides();
    if cfg.confd_workers == 0 {
        cfg.confd_workers = 1;
    }
    Ok(cfg)
}

pub async fn load_config() -> Result<KernelConfig> {
    let path = std::env::var("FLEET_KERNEL_CONFIG").unwrap_or_else(|_| "fleet.yaml".into());
    load_config_from(Path::new(&path)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config_from(&dir.path().join("absent.yaml")).await.unwrap();
        assert_eq!(cfg.health_timeout_secs, 5);
        assert_eq!(cfg.artifacts.main_binary, PathBuf::from("bin/finalvudatasim"));
    }

    #[tokio::test]
    async fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.yaml");
        std::fs::write(&path, "confd_workers: 0\nsettle_secs: 0\nhealth_path: /api/system/health\n").unwrap();

        let cfg = load_config_from(&path).await.unwrap();
        assert_eq!(cfg.confd_workers, 1);
        assert_eq!(cfg.settle_secs, 0);
        assert_eq!(cfg.health_path, "/api/system/health");
        assert_eq!(cfg.max_eps_file, PathBuf::from("configs/max_eps.yaml"));
    }

    #[tokio::test]
    async fn test_invalid_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.yaml");
        std::fs::write(&path, "confd_workers: [nope").unwrap();
        assert!(matches!(load_config_from(&path).await, Err(FleetError::Config { .. })));
    }

    #[test]
    fn test_rooted_at_only_touches_relative_paths() {
        let mut cfg = KernelConfig::default();
        cfg.backups_dir = PathBuf::from("/var/backups");
        let cfg = cfg.rooted_at(Path::new("/srv/fleet"));
        assert_eq!(cfg.confd_dir, PathBuf::from("/srv/fleet/conf.d"));
        assert_eq!(cfg.backups_dir, PathBuf::from("/var/backups"));
    }
}
