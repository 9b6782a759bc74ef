/**
 * EPS ALLOCATOR - Répartition proportionnelle d'un EPS total entre sources
 *
 * ALGORITHME :
 * 1. Rejets : total <= 0, sélection vide ou dupliquée, source inconnue, poids total nul
 * 2. Chaque source sauf la dernière (ordre de la requête) reçoit
 *    floor(total * poids / poids_total) ; la dernière reçoit le reste.
 *    La somme est donc exactement égale au total demandé.
 * 3. NumUniqKey = max(1, floor(eps_assigné / total_sous_clés))
 * 4. Persistance : seules les sources sélectionnées restent activées.
 *    Toutes les modifications sont préparées en mémoire avant la première
 *    écriture ; la carte d'activation est écrite en dernier.
 *
 * L'EPS courant est toujours re-dérivé de l'état disque, jamais mis en cache.
 */

use super::mutator::{ConfigMutator, SourceEdit};
use super::{MaxEpsTable, SourceEpsInfo};
use crate::error::{FleetError, Result};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceAllocation {
    pub source_name: String,
    pub weight: u64,
    pub assigned_eps: u64,
}

/// Sortie éphémère de la répartition, dans l'ordre de la requête
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct AllocationResult {
    pub sources: Vec<SourceAllocation>,
}

impl AllocationResult {
    pub fn total(&self) -> u64 {
        self.sources.iter().map(|s| s.assigned_eps).sum()
    }

    pub fn get(&self, source: &str) -> Option<u64> {
        self.sources.iter().find(|s| s.source_name == source).map(|s| s.assigned_eps)
    }

    pub fn as_map(&self) -> BTreeMap<String, u64> {
        self.sources.iter().map(|s| (s.source_name.clone(), s.assigned_eps)).collect()
    }
}

/// Données renvoyées par `distribute`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionReport {
    pub total_eps: u64,
    pub selected_sources: Vec<String>,
    pub allocation: BTreeMap<String, u64>,
    pub source_breakdown: BTreeMap<String, SourceEpsInfo>,
    pub new_total_eps: u64,
    pub updated_configs: BTreeMap<String, u64>,
}

/// Calcul pur de la répartition (aucune I/O)
pub fn proportional_split(selected: &[String], total_eps: i64, table: &MaxEpsTable) -> Result<AllocationResult> {
    if total_eps <= 0 {
        return Err(FleetError::InvalidRequest("Total EPS must be greater than 0".into()));
    }
    if selected.is_empty() {
        return Err(FleetError::InvalidRequest("At least one source must be selected".into()));
    }
    let mut seen = HashSet::with_capacity(selected.len());
    for name in selected {
        if !seen.insert(name.as_str()) {
            return Err(FleetError::InvalidRequest(format!("source {name} selected more than once")));
        }
    }

    let mut weights = Vec::with_capacity(selected.len());
    for name in selected {
        let weight = table.weight(name).ok_or_else(|| FleetError::UnknownSource(name.clone()))?;
        weights.push(weight);
    }
    let total_weight: u128 = weights.iter().map(|w| u128::from(*w)).sum();
    if total_weight == 0 {
        return Err(FleetError::InvalidRequest(
            "selected sources have a total max EPS of 0, cannot split proportionally".into(),
        ));
    }

    let total = total_eps as u64;
    let mut assigned_so_far: u64 = 0;
    let last = selected.len() - 1;
    let sources = selected
        .iter()
        .zip(weights)
        .enumerate()
        .map(|(i, (name, weight))| {
            let assigned_eps = if i == last {
                total - assigned_so_far
            } else {
                // floor(total * poids / poids_total) en u128 : pas de débordement
                let share = (u128::from(total) * u128::from(weight) / total_weight) as u64;
                assigned_so_far += share;
                share
            };
            SourceAllocation {
                source_name: name.clone(),
                weight,
                assigned_eps,
            }
        })
        .collect();

    Ok(AllocationResult { sources })
}

/// max(1, floor(eps / total_sous_clés))
pub fn num_uniq_key_for(assigned_eps: u64, total_sub_keys: u64) -> u64 {
    (assigned_eps / total_sub_keys.max(1)).max(1)
}

pub struct EpsAllocator {
    table: MaxEpsTable,
    mutator: ConfigMutator,
    // sérialise les mutations de conf.d (distribute / enable / disable)
    write_lock: Mutex<()>,
}

impl EpsAllocator {
    pub fn new(table: MaxEpsTable, mutator: ConfigMutator) -> Self {
        Self {
            table,
            mutator,
            write_lock: Mutex::new(()),
        }
    }

    pub fn table(&self) -> &MaxEpsTable {
        &self.table
    }

    pub fn mutator(&self) -> &ConfigMutator {
        &self.mutator
    }

    pub async fn distribute(&self, selected: &[String], total_eps: i64) -> Result<DistributionReport> {
        let allocation = proportional_split(selected, total_eps, &self.table)?;
        let _guard = self.write_lock.lock().await;

        // tout préparer en mémoire : une source illisible ou sans NumUniqKey
        // fait échouer la requête avant la moindre écriture
        let mut edits: Vec<SourceEdit> = Vec::with_capacity(allocation.sources.len());
        let mut updated_configs = BTreeMap::new();
        for alloc in &allocation.sources {
            let source = self.mutator.load_source(&alloc.source_name).await?;
            let keys = num_uniq_key_for(alloc.assigned_eps, source.total_sub_keys());
            let mut edit = self.mutator.edit_source(&alloc.source_name).await?;
            edit.set_num_uniq_key(keys)?;
            edit.set_flag(true);
            edits.push(edit);
            updated_configs.insert(alloc.source_name.clone(), keys);
        }

        let selected_set: HashSet<&str> = selected.iter().map(String::as_str).collect();
        let mut enablement = self.mutator.read_enablement().await?;
        let mut known: Vec<String> = self.table.names();
        known.extend(enablement.entries().into_keys());
        known.sort();
        known.dedup();
        for name in &known {
            enablement.set(name, selected_set.contains(name.as_str()));
        }

        // sources désélectionnées : drapeau best-effort, fichier absent ignoré
        let mut cleared: Vec<SourceEdit> = Vec::new();
        for name in known.iter().filter(|n| !selected_set.contains(n.as_str())) {
            match self.mutator.edit_source(name).await {
                Ok(mut edit) => {
                    edit.set_flag(false);
                    cleared.push(edit);
                }
                Err(FleetError::Config { .. }) => {}
                Err(e) => tracing::warn!("[eps] could not clear enabled flag of {}: {}", name, e),
            }
        }

        for edit in edits {
            self.mutator.commit(edit).await?;
        }
        for edit in cleared {
            let name = edit.source().to_string();
            if let Err(e) = self.mutator.commit(edit).await {
                tracing::warn!("[eps] could not clear enabled flag of {}: {}", name, e);
            }
        }
        self.mutator.write_enablement(&enablement).await?;

        let source_breakdown = self.breakdown().await?;
        let new_total_eps = source_breakdown.values().map(|i| i.assigned_eps).sum();
        tracing::info!(
            "[eps] distributed {} EPS across {} sources (re-derived total {})",
            total_eps,
            selected.len(),
            new_total_eps
        );

        Ok(DistributionReport {
            total_eps: total_eps as u64,
            selected_sources: selected.to_vec(),
            allocation: allocation.as_map(),
            source_breakdown,
            new_total_eps,
            updated_configs,
        })
    }

    /// Active une source indépendamment de toute répartition
    pub async fn enable_source(&self, name: &str) -> Result<()> {
        self.set_enabled(name, true).await
    }

    pub async fn disable_source(&self, name: &str) -> Result<()> {
        self.set_enabled(name, false).await
    }

    async fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        if !self.table.contains(name) {
            return Err(FleetError::UnknownSource(name.to_string()));
        }
        let _guard = self.write_lock.lock().await;
        let mut enablement = self.mutator.read_enablement().await?;
        enablement.set(name, enabled);
        self.mutator.write_enablement(&enablement).await?;
        self.mutator.set_source_flag(name, enabled).await?;
        tracing::info!("[eps] source {} {}", name, if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    pub fn available_sources(&self) -> Vec<String> {
        self.table.names()
    }

    pub async fn enabled_sources(&self) -> Result<Vec<String>> {
        Ok(self.mutator.read_enablement().await?.enabled_names())
    }

    pub async fn source_details(&self, name: &str) -> Result<SourceEpsInfo> {
        if !self.table.contains(name) {
            return Err(FleetError::UnknownSource(name.to_string()));
        }
        Ok(self.mutator.load_source(name).await?.eps_info())
    }

    /// Détail par source activée ; une source illisible est ignorée (avertissement)
    pub async fn breakdown(&self) -> Result<BTreeMap<String, SourceEpsInfo>> {
        let enablement = self.mutator.read_enablement().await?;
        let mut out = BTreeMap::new();
        for name in enablement.enabled_names() {
            match self.mutator.load_source(&name).await {
                Ok(source) => {
                    out.insert(name, source.eps_info());
                }
                Err(e) => tracing::warn!("[eps] skipping {} in breakdown: {}", name, e),
            }
        }
        Ok(out)
    }

    /// Σ NumUniqKey × total_sous_clés sur les sources activées
    pub async fn current_eps(&self) -> Result<u64> {
        Ok(self.breakdown().await?.values().map(|i| i.assigned_eps).sum())
    }
}
