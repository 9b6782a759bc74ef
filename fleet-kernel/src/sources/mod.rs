/**
 * SOURCES O11Y - Modules sources, table de capacité max-EPS, répartition EPS
 *
 * RÔLE :
 * - `mutator`   : lecture/écriture de l'arbre conf.d (carte d'activation + conf.yml par source)
 * - `allocator` : répartition proportionnelle d'un EPS total entre sources sélectionnées
 * - `document`  : mise à jour ciblée d'un champ YAML (préserve commentaires)
 *
 * LAYOUT conf.d :
 * ```text
 * conf.d/conf.yml                  include_module_dirs: { <source>: { enabled: bool } }
 * conf.d/<source>/conf.yml         enabled, uniquekey{..., NumUniqKey}, Include_sub_modules
 * conf.d/<source>/<sub>.yml        uniquekey{NumUniqKey}
 * configs/max_eps.yaml             max_eps_config: { <source>: int }
 * ```
 */

pub mod allocator;
pub mod document;
pub mod mutator;

use crate::error::{FleetError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

pub use allocator::{AllocationResult, DistributionReport, EpsAllocator, SourceAllocation};
pub use document::YamlDocument;
pub use mutator::{ConfigMutator, EnablementMap, SourceEdit};

/// Bloc `uniquekey` d'une source ou d'un sous-module
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UniqueKey {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "DataType", default)]
    pub data_type: String,
    #[serde(rename = "ValueType", default)]
    pub value_type: String,
    #[serde(rename = "Value", default)]
    pub value: serde_yaml::Value,
    #[serde(rename = "NumUniqKey", default)]
    pub num_uniq_key: i64,
}

/// conf.d/<source>/conf.yml (champs lus par le kernel uniquement)
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct SourceFile {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub uniquekey: UniqueKey,
    #[serde(rename = "Include_sub_modules", default)]
    pub include_sub_modules: Vec<String>,
}

/// conf.d/<source>/<sub>.yml
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct SubModuleFile {
    #[serde(default)]
    pub uniquekey: Option<UniqueKey>,
}

/// Sous-module référencé par une source, avec son poids effectif
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubModuleRef {
    pub name: String,
    /// NumUniqKey lu sur disque ; None si fichier absent ou illisible
    pub num_uniq_key: Option<i64>,
}

impl SubModuleRef {
    /// Poids dans le total des sous-clés : max(1, n), 1 si fichier absent/illisible
    pub fn weight(&self) -> u64 {
        match self.num_uniq_key {
            Some(n) if n > 0 => n as u64,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceModule {
    pub name: String,
    pub enabled: bool,
    pub unique_key: UniqueKey,
    pub sub_modules: Vec<SubModuleRef>,
}

impl SourceModule {
    /// Σ max(1, sous-module) ; une source sans sous-module compte pour 1
    pub fn total_sub_keys(&self) -> u64 {
        let total: u64 = self.sub_modules.iter().map(SubModuleRef::weight).sum();
        total.max(1)
    }

    pub fn main_keys(&self) -> u64 {
        self.unique_key.num_uniq_key.max(0) as u64
    }

    /// EPS re-dérivé : NumUniqKey × total des sous-clés
    pub fn current_eps(&self) -> u64 {
        self.main_keys() * self.total_sub_keys()
    }

    pub fn eps_info(&self) -> SourceEpsInfo {
        let main = self.main_keys();
        let sub_module_keys = self
            .sub_modules
            .iter()
            .map(|s| (s.name.clone(), main * s.weight()))
            .collect();
        SourceEpsInfo {
            source_name: self.name.clone(),
            assigned_eps: self.current_eps(),
            main_unique_keys: main,
            total_sub_keys: self.total_sub_keys(),
            sub_module_keys,
        }
    }
}

/// Détail EPS d'une source, tel que renvoyé à l'opérateur
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceEpsInfo {
    pub source_name: String,
    pub assigned_eps: u64,
    pub main_unique_keys: u64,
    pub total_sub_keys: u64,
    pub sub_module_keys: BTreeMap<String, u64>,
}

#[derive(Debug, Default, Deserialize)]
struct MaxEpsFile {
    #[serde(default)]
    max_eps_config: BTreeMap<String, i64>,
}

/// Capacité déclarée de chaque source ; poids de la répartition, jamais muté
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MaxEpsTable {
    entries: BTreeMap<String, u64>,
}

impl MaxEpsTable {
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, u64)>,
        S: Into<String>,
    {
        Self {
            entries: entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn parse(text: &str, origin: &Path) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let file: MaxEpsFile = serde_yaml::from_str(text).map_err(|e| FleetError::config(origin, e.to_string()))?;
        let mut entries = BTreeMap::new();
        for (name, max) in file.max_eps_config {
            if max < 0 {
                return Err(FleetError::config(origin, format!("negative max EPS for source {name}")));
            }
            entries.insert(name, max as u64);
        }
        Ok(Self { entries })
    }

    /// Charge la table ; fichier absent = table vide (avertissement)
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::warn!("[eps] max EPS table {} not found, no source can be allocated", path.display());
            return Ok(Self::default());
        }
        let text = tokio::fs::read_to_string(path).await?;
        let table = Self::parse(&text, path)?;
        tracing::info!("[eps] loaded max EPS for {} sources", table.len());
        Ok(table)
    }

    pub fn weight(&self, source: &str) -> Option<u64> {
        self.entries.get(source).copied()
    }

    pub fn contains(&self, source: &str) -> bool {
        self.entries.contains_key(source)
    }

    /// Noms triés
    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &BTreeMap<String, u64> {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(main: i64, subs: &[Option<i64>]) -> SourceModule {
        SourceModule {
            name: "MongoDB".into(),
            enabled: true,
            unique_key: UniqueKey { num_uniq_key: main, ..Default::default() },
            sub_modules: subs
                .iter()
                .enumerate()
                .map(|(i, n)| SubModuleRef { name: format!("sub{i}"), num_uniq_key: *n })
                .collect(),
        }
    }

    #[test]
    fn test_total_sub_keys_defaults() {
        assert_eq!(source(10, &[]).total_sub_keys(), 1);
        assert_eq!(source(10, &[Some(0), None, Some(4)]).total_sub_keys(), 6);
        assert_eq!(source(10, &[Some(-3)]).total_sub_keys(), 1);
    }

    #[test]
    fn test_eps_info_multiplies_sub_modules() {
        let info = source(25, &[Some(4), None]).eps_info();
        assert_eq!(info.assigned_eps, 125);
        assert_eq!(info.total_sub_keys, 5);
        assert_eq!(info.sub_module_keys["sub0"], 100);
        assert_eq!(info.sub_module_keys["sub1"], 25);
    }

    #[test]
    fn test_parse_max_eps_table() {
        let table = MaxEpsTable::parse(
            "max_eps_config:\n  MongoDB: 3000\n  LinuxMonitor: 1000\n",
            Path::new("max_eps.yaml"),
        )
        .unwrap();
        assert_eq!(table.weight("MongoDB"), Some(3000));
        assert_eq!(table.names(), vec!["LinuxMonitor".to_string(), "MongoDB".to_string()]);
        assert!(MaxEpsTable::parse("max_eps_config:\n  X: -1\n", Path::new("m")).is_err());
    }
}
