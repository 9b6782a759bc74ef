/**
 * CONFIG MUTATOR - Lecture/écriture de l'arbre conf.d
 *
 * DEUX CHEMINS EXPLICITES :
 * - Carte d'activation (conf.d/conf.yml) : réécriture complète, les autres clés
 *   de premier niveau sont conservées
 * - conf.yml d'une source (maintenu à la main) : mise à jour ciblée d'un champ
 *   via `YamlDocument`, le reste du fichier est préservé à l'octet près
 *
 * Toute écriture est atomique et fsync avant de rendre la main.
 * Les modifications d'une source peuvent être préparées en mémoire
 * (`SourceEdit`) puis écrites d'un bloc par `commit` : un champ absent est
 * détecté avant toute écriture.
 */

use super::document::YamlDocument;
use super::{SourceFile, SourceModule, SubModuleFile, SubModuleRef};
use crate::error::{FleetError, Result};
use crate::persist::write_atomic;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const MODULES_KEY: &str = "include_module_dirs";
const MAIN_CONF: &str = "conf.yml";

/// Carte d'activation des modules + toutes les autres clés du fichier
#[derive(Debug, Clone, Default)]
pub struct EnablementMap {
    doc: Mapping,
}

impl EnablementMap {
    fn modules(&self) -> Option<&Mapping> {
        self.doc.get(MODULES_KEY).and_then(Value::as_mapping)
    }

    pub fn get(&self, name: &str) -> Option<bool> {
        let entry = self.modules()?.get(name)?;
        Some(entry.get("enabled").and_then(Value::as_bool).unwrap_or(false))
    }

    pub fn set(&mut self, name: &str, enabled: bool) {
        if !matches!(self.doc.get(MODULES_KEY), Some(Value::Mapping(_))) {
            self.doc.insert(Value::from(MODULES_KEY), Value::Mapping(Mapping::new()));
        }
        let Some(Value::Mapping(modules)) = self.doc.get_mut(MODULES_KEY) else { return };
        match modules.get_mut(name) {
            Some(Value::Mapping(entry)) => {
                entry.insert(Value::from("enabled"), Value::Bool(enabled));
            }
            _ => {
                let mut entry = Mapping::new();
                entry.insert(Value::from("enabled"), Value::Bool(enabled));
                modules.insert(Value::from(name), Value::Mapping(entry));
            }
        }
    }

    pub fn entries(&self) -> BTreeMap<String, bool> {
        let Some(modules) = self.modules() else { return BTreeMap::new() };
        modules
            .iter()
            .filter_map(|(k, v)| {
                let name = k.as_str()?;
                Some((name.to_string(), v.get("enabled").and_then(Value::as_bool).unwrap_or(false)))
            })
            .collect()
    }

    pub fn enabled_names(&self) -> Vec<String> {
        self.entries().into_iter().filter(|(_, on)| *on).map(|(n, _)| n).collect()
    }

    /// Clé de premier niveau hors carte d'activation (lecture seule)
    pub fn extra(&self, key: &str) -> Option<&Value> {
        if key == MODULES_KEY {
            return None;
        }
        self.doc.get(key)
    }
}

/// Refuse les noms qui sortiraient de conf.d
fn checked_name(name: &str) -> Result<&str> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name == "." || name == ".." {
        return Err(FleetError::InvalidRequest(format!("invalid source name: {name:?}")));
    }
    Ok(name)
}

fn sub_module_name(raw: &str) -> &str {
    raw.trim().trim_matches(|c| c == '[' || c == ']').trim()
}

/// conf.yml d'une source modifié en mémoire, pas encore écrit
#[derive(Debug, Clone)]
pub struct SourceEdit {
    source: String,
    path: PathBuf,
    doc: YamlDocument,
    changed: bool,
}

impl SourceEdit {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_changed(&self) -> bool {
        self.changed
    }

    /// Erreur si le fichier n'a pas de champ `uniquekey.NumUniqKey`
    pub fn set_num_uniq_key(&mut self, value: u64) -> Result<()> {
        if !self.doc.set_scalar(&["uniquekey", "NumUniqKey"], &value.to_string()) {
            return Err(FleetError::config(&self.path, "no uniquekey.NumUniqKey field to update"));
        }
        self.changed = true;
        Ok(())
    }

    /// Aligne le champ `enabled:` s'il existe ; false si le champ est absent
    pub fn set_flag(&mut self, enabled: bool) -> bool {
        let wanted = if enabled { "true" } else { "false" };
        if self.doc.get_scalar(&["enabled"]).as_deref() == Some(wanted) {
            return true;
        }
        if !self.doc.set_scalar(&["enabled"], wanted) {
            return false;
        }
        self.changed = true;
        true
    }
}

#[derive(Debug, Clone)]
pub struct ConfigMutator {
    confd_dir: PathBuf,
}

impl ConfigMutator {
    pub fn new(confd_dir: impl Into<PathBuf>) -> Self {
        Self { confd_dir: confd_dir.into() }
    }

    pub fn confd_dir(&self) -> &Path {
        &self.confd_dir
    }

    pub fn main_conf_path(&self) -> PathBuf {
        self.confd_dir.join(MAIN_CONF)
    }

    pub fn source_conf_path(&self, source: &str) -> PathBuf {
        self.confd_dir.join(source).join(MAIN_CONF)
    }

    pub async fn read_enablement(&self) -> Result<EnablementMap> {
        let path = self.main_conf_path();
        if !path.exists() {
            return Ok(EnablementMap::default());
        }
        let text = tokio::fs::read_to_string(&path).await?;
        if text.trim().is_empty() {
            return Ok(EnablementMap::default());
        }
        let doc: Mapping = serde_yaml::from_str(&text).map_err(|e| FleetError::config(&path, e.to_string()))?;
        Ok(EnablementMap { doc })
    }

    /// Réécriture complète : la carte est la seule raison d'être du fichier
    pub async fn write_enablement(&self, map: &EnablementMap) -> Result<()> {
        let text = serde_yaml::to_string(&map.doc)?;
        write_atomic(&self.main_conf_path(), text.as_bytes()).await?;
        Ok(())
    }

    async fn read_source_text(&self, source: &str) -> Result<(PathBuf, String)> {
        let path = self.source_conf_path(checked_name(source)?);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok((path, text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(FleetError::config(&path, "source config file not found"))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// NumUniqKey d'un sous-module ; None (avec avertissement) si absent/illisible
    async fn load_sub_module(&self, source: &str, sub: &str) -> Option<i64> {
        let path = self.confd_dir.join(source).join(format!("{sub}.yml"));
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("[eps] sub-module {} unreadable ({}), counting as 1", path.display(), e);
                return None;
            }
        };
        match serde_yaml::from_str::<SubModuleFile>(&text) {
            Ok(file) => Some(file.uniquekey.map(|k| k.num_uniq_key).unwrap_or(0)),
            Err(e) => {
                tracing::warn!("[eps] sub-module {} unparseable ({}), counting as 1", path.display(), e);
                None
            }
        }
    }

    pub async fn load_source(&self, source: &str) -> Result<SourceModule> {
        let (path, text) = self.read_source_text(source).await?;
        let file: SourceFile = serde_yaml::from_str(&text).map_err(|e| FleetError::config(&path, e.to_string()))?;

        let mut sub_modules = Vec::with_capacity(file.include_sub_modules.len());
        for raw in &file.include_sub_modules {
            let name = sub_module_name(raw);
            if name.is_empty() || checked_name(name).is_err() {
                continue;
            }
            let num_uniq_key = self.load_sub_module(source, name).await;
            sub_modules.push(SubModuleRef { name: name.to_string(), num_uniq_key });
        }

        Ok(SourceModule {
            name: source.to_string(),
            enabled: file.enabled,
            unique_key: file.uniquekey,
            sub_modules,
        })
    }

    /// Charge le conf.yml d'une source pour modification en mémoire
    pub async fn edit_source(&self, source: &str) -> Result<SourceEdit> {
        let (path, text) = self.read_source_text(source).await?;
        Ok(SourceEdit {
            source: source.to_string(),
            path,
            doc: YamlDocument::new(text),
            changed: false,
        })
    }

    /// Écrit une modification préparée ; rien n'est écrit si elle est vide
    pub async fn commit(&self, edit: SourceEdit) -> Result<()> {
        if !edit.changed {
            return Ok(());
        }
        write_atomic(&edit.path, edit.doc.as_str().as_bytes()).await?;
        tracing::debug!("[eps] {} written", edit.path.display());
        Ok(())
    }

    /// Mise à jour ciblée de `uniquekey.NumUniqKey`
    pub async fn set_num_uniq_key(&self, source: &str, value: u64) -> Result<()> {
        let mut edit = self.edit_source(source).await?;
        edit.set_num_uniq_key(value)?;
        self.commit(edit).await?;
        tracing::debug!("[eps] {} NumUniqKey -> {}", source, value);
        Ok(())
    }

    /// Aligne le champ `enabled:` du conf.yml de la source s'il existe.
    /// Retourne false si le fichier ou le champ est absent (rien n'est écrit).
    pub async fn set_source_flag(&self, source: &str, enabled: bool) -> Result<bool> {
        let mut edit = match self.edit_source(source).await {
            Ok(edit) => edit,
            Err(FleetError::Config { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };
        let found = edit.set_flag(enabled);
        self.commit(edit).await?;
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, rel: &str, body: &str) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    #[tokio::test]
    async fn test_enablement_rewrite_keeps_other_keys() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "conf.yml",
            "global:\n  interval: 5\ninclude_module_dirs:\n  MongoDB:\n    enabled: true\n    path: mongo\n",
        );
        let mutator = ConfigMutator::new(dir.path());

        let mut map = mutator.read_enablement().await.unwrap();
        assert_eq!(map.get("MongoDB"), Some(true));
        map.set("MongoDB", false);
        map.set("Redis", true);
        mutator.write_enablement(&map).await.unwrap();

        let reread = mutator.read_enablement().await.unwrap();
        assert_eq!(reread.get("MongoDB"), Some(false));
        assert_eq!(reread.get("Redis"), Some(true));
        assert_eq!(reread.enabled_names(), vec!["Redis".to_string()]);
        assert!(reread.extra("global").is_some());
        let raw = std::fs::read_to_string(dir.path().join("conf.yml")).unwrap();
        assert!(raw.contains("path: mongo"));
    }

    #[tokio::test]
    async fn test_load_source_defaults_bad_sub_modules() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "MongoDB/conf.yml",
            "enabled: true\nuniquekey:\n  name: host\n  NumUniqKey: 10\nInclude_sub_modules: [replset, oplog, broken]\n",
        );
        write(dir.path(), "MongoDB/replset.yml", "uniquekey:\n  NumUniqKey: 3\n");
        write(dir.path(), "MongoDB/broken.yml", "uniquekey: [not, a, map\n");
        let mutator = ConfigMutator::new(dir.path());

        let source = mutator.load_source("MongoDB").await.unwrap();
        assert_eq!(source.sub_modules.len(), 3);
        assert_eq!(source.sub_modules[0].num_uniq_key, Some(3));
        assert_eq!(source.sub_modules[1].num_uniq_key, None);
        assert_eq!(source.sub_modules[2].num_uniq_key, None);
        assert_eq!(source.total_sub_keys(), 5);
    }

    #[tokio::test]
    async fn test_set_num_uniq_key_preserves_comments() {
        let dir = tempfile::tempdir().unwrap();
        let body = "# owned by ops\nenabled: false\nuniquekey:\n  name: host # label\n  NumUniqKey: 10\n";
        write(dir.path(), "Redis/conf.yml", body);
        let mutator = ConfigMutator::new(dir.path());

        mutator.set_num_uniq_key("Redis", 420).await.unwrap();
        assert!(mutator.set_source_flag("Redis", true).await.unwrap());

        let after = std::fs::read_to_string(dir.path().join("Redis/conf.yml")).unwrap();
        assert_eq!(after, "# owned by ops\nenabled: true\nuniquekey:\n  name: host # label\n  NumUniqKey: 420\n");
    }

    #[tokio::test]
    async fn test_missing_source_and_bad_names() {
        let dir = tempfile::tempdir().unwrap();
        let mutator = ConfigMutator::new(dir.path());
        assert!(matches!(mutator.load_source("Nope").await, Err(FleetError::Config { .. })));
        assert!(matches!(mutator.load_source("../etc").await, Err(FleetError::InvalidRequest(_))));
        assert!(!mutator.set_source_flag("Nope", true).await.unwrap());
    }

    #[tokio::test]
    async fn test_staged_edit_writes_only_on_commit() {
        let dir = tempfile::tempdir().unwrap();
        let body = "enabled: false\nuniquekey:\n  name: host\n";
        write(dir.path(), "Kafka/conf.yml", body);
        let mutator = ConfigMutator::new(dir.path());

        let mut edit = mutator.edit_source("Kafka").await.unwrap();
        assert!(edit.set_flag(true));
        assert!(matches!(edit.set_num_uniq_key(12), Err(FleetError::Config { .. })));
        assert!(edit.is_changed());
        let raw = std::fs::read_to_string(dir.path().join("Kafka/conf.yml")).unwrap();
        assert_eq!(raw, body);

        mutator.commit(edit).await.unwrap();
        let raw = std::fs::read_to_string(dir.path().join("Kafka/conf.yml")).unwrap();
        assert!(raw.starts_with("enabled: true\n"));

        // aucun changement : rien n'est réécrit
        let mut edit = mutator.edit_source("Kafka").await.unwrap();
        assert!(edit.set_flag(true));
        assert!(!edit.is_changed());
    }
}
