/*!
Fixtures disque : arbre conf.d, table max-EPS et artefacts locaux dans un répertoire temporaire

Layout produit :
```text
<tmp>/conf.d/conf.yml
<tmp>/conf.d/<source>/conf.yml (+ <sub>.yml)
<tmp>/configs/max_eps.yaml
<tmp>/configs/nodes.yaml       (écrit par le registre)
<tmp>/bin/finalvudatasim, <tmp>/bin/node_metrics_api
```
*/

use anyhow::Result;
use fleet_kernel::config::KernelConfig;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Description d'une source à écrire
#[derive(Debug, Clone)]
pub struct SourceSpec {
    pub name: String,
    pub max_eps: u64,
    pub enabled: bool,
    pub num_uniq_key: i64,
    /// (nom, NumUniqKey) ; None = fichier du sous-module absent
    pub sub_modules: Vec<(String, Option<i64>)>,
}

impl SourceSpec {
    pub fn new(name: &str, max_eps: u64) -> Self {
        Self {
            name: name.to_string(),
            max_eps,
            enabled: false,
            num_uniq_key: 1,
            sub_modules: Vec::new(),
        }
    }

    pub fn enabled(mut self) -> Self {
        self.enabled = true;
        self
    }

    pub fn keys(mut self, n: i64) -> Self {
        self.num_uniq_key = n;
        self
    }

    pub fn sub(mut self, name: &str, keys: Option<i64>) -> Self {
        self.sub_modules.push((name.to_string(), keys));
        self
    }
}

pub struct ConfdFixture {
    dir: TempDir,
    sources: BTreeMap<String, SourceSpec>,
}

impl ConfdFixture {
    /// Fixture vide (artefacts présents, aucune source)
    pub fn empty() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let fixture = Self {
            dir,
            sources: BTreeMap::new(),
        };
        fs::create_dir_all(fixture.confd_dir())?;
        fs::create_dir_all(fixture.path().join("bin"))?;
        fs::write(fixture.path().join("bin/finalvudatasim"), b"#!/bin/sh\n")?;
        fs::write(fixture.path().join("bin/node_metrics_api"), b"#!/bin/sh\n")?;
        fixture.write_tables()?;
        Ok(fixture)
    }

    /// MongoDB (3000, sous-modules replset=3 + oplog absent), LinuxMonitor (1000), Redis (500)
    pub fn standard() -> Result<Self> {
        let mut fixture = Self::empty()?;
        fixture.add_source(
            SourceSpec::new("MongoDB", 3000)
                .enabled()
                .keys(10)
                .sub("replset", Some(3))
                .sub("oplog", None),
        )?;
        fixture.add_source(SourceSpec::new("LinuxMonitor", 1000).keys(5))?;
        fixture.add_source(SourceSpec::new("Redis", 500).enabled().keys(2))?;
        Ok(fixture)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn confd_dir(&self) -> PathBuf {
        self.path().join("conf.d")
    }

    pub fn add_source(&mut self, spec: SourceSpec) -> Result<()> {
        let dir = self.confd_dir().join(&spec.name);
        fs::create_dir_all(&dir)?;
        let subs: Vec<&str> = spec.sub_modules.iter().map(|(n, _)| n.as_str()).collect();
        let body = format!(
            "# {name} generator, maintained by hand\nenabled: {enabled}\nuniquekey:\n  name: host\n  DataType: string\n  ValueType: random\n  NumUniqKey: {keys} # cardinality\nInclude_sub_modules: [{subs}]\n",
            name = spec.name,
            enabled = spec.enabled,
            keys = spec.num_uniq_key,
            subs = subs.join(", "),
        );
        fs::write(dir.join("conf.yml"), body)?;
        for (sub, keys) in &spec.sub_modules {
            if let Some(k) = keys {
                fs::write(dir.join(format!("{sub}.yml")), format!("uniquekey:\n  name: {sub}_id\n  NumUniqKey: {k}\n"))?;
            }
        }
        self.sources.insert(spec.name.clone(), spec);
        self.write_tables()
    }

    fn write_tables(&self) -> Result<()> {
        let mut main = String::from("global:\n  output: kafka\ninclude_module_dirs:\n");
        let mut max = String::from("max_eps_config:\n");
        for spec in self.sources.values() {
            main.push_str(&format!("  {}:\n    enabled: {}\n", spec.name, spec.enabled));
            max.push_str(&format!("  {}: {}\n", spec.name, spec.max_eps));
        }
        if self.sources.is_empty() {
            main = String::from("global:\n  output: kafka\n");
            max = String::from("max_eps_config: {}\n");
        }
        fs::write(self.confd_dir().join("conf.yml"), main)?;
        fs::create_dir_all(self.path().join("configs"))?;
        fs::write(self.path().join("configs/max_eps.yaml"), max)?;
        Ok(())
    }

    pub fn remove_artifact(&self, rel: &str) -> Result<()> {
        fs::remove_file(self.path().join(rel))?;
        Ok(())
    }

    /// Écrit (ou remplace) un fichier relatif à la fixture
    pub fn write(&self, rel: &str, body: &str) -> Result<()> {
        let path = self.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, body)?;
        Ok(())
    }

    pub fn read(&self, rel: &str) -> Result<String> {
        Ok(fs::read_to_string(self.path().join(rel))?)
    }

    pub fn source_conf(&self, source: &str) -> Result<String> {
        self.read(&format!("conf.d/{source}/conf.yml"))
    }

    /// Configuration kernel ancrée dans la fixture (stabilisation instantanée)
    pub fn config(&self) -> KernelConfig {
        let mut cfg = KernelConfig {
            settle_secs: 0,
            health_timeout_secs: 2,
            confd_workers: 2,
            archive_dir: Some(PathBuf::from("tmp")),
            ..KernelConfig::default()
        }
        .rooted_at(self.path());
        cfg.listen = "127.0.0.1:0".into();
        cfg
    }
}
