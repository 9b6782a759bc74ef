/**
 * REMOTE EXECUTOR - Commandes distantes et transferts de fichiers vers un nœud
 *
 * RÔLE :
 * Contrat unique `exec / exec_captured / copy / copy_dir` consommé par le
 * déploiement, le contrôle de processus et la diffusion conf.d.
 *
 * FONCTIONNEMENT :
 * - `SshExecutor` : binaires ssh/scp via tokio::process, borné par timeout ;
 *   ClusterSettings relus à chaque appel (une mise à jour s'applique aussitôt)
 * - Toute implémentation (lib ssh native, mock de test) peut se substituer
 *   sans toucher aux appelants
 */

use crate::error::{FleetError, Result};
use crate::registry::{ClusterSettings, NodeRecord, NodeRegistry};
use crate::process::timestamp_now;
use async_trait::async_trait;
use serde::Serialize;
use std::borrow::Cow;
use std::path::Path;
use std::process::{Output, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Exécute une commande, retourne stdout + stderr combinés
    async fn exec(&self, node: &NodeRecord, command: &str) -> Result<String>;
    /// Exécute une commande, retourne uniquement stdout
    async fn exec_captured(&self, node: &NodeRecord, command: &str) -> Result<String>;
    async fn copy(&self, node: &NodeRecord, local: &Path, remote: &str) -> Result<()>;
    async fn copy_dir(&self, node: &NodeRecord, local_dir: &Path, remote_dir: &str) -> Result<()>;
}

/// Quote un argument pour la ligne de commande distante
pub fn quote(arg: &str) -> Cow<'_, str> {
    shell_words::quote(arg)
}

const CONNECTIVITY_PROBE: &str = "SSH connection test";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    Connected,
    Disconnected,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityStatus {
    pub node_name: String,
    pub status: Connectivity,
    pub message: String,
    pub last_checked: String,
}

/// `echo` aller-retour ; ne retourne jamais d'erreur
pub async fn check_connectivity(executor: &dyn RemoteExecutor, node: &NodeRecord) -> ConnectivityStatus {
    let (status, message) = match executor
        .exec_captured(node, &format!("echo {}", quote(CONNECTIVITY_PROBE)))
        .await
    {
        Ok(out) if out.trim() == CONNECTIVITY_PROBE => (Connectivity::Connected, "SSH connection successful".to_string()),
        Ok(out) => (Connectivity::Error, format!("unexpected check output: {}", out.trim())),
        Err(e) => {
            tracing::warn!("[remote] {} unreachable: {}", node.name, e);
            (Connectivity::Disconnected, e.to_string())
        }
    };
    ConnectivityStatus {
        node_name: node.name.clone(),
        status,
        message,
        last_checked: timestamp_now(),
    }
}

/// Programme + arguments d'un appel ssh/scp, avec sa borne de durée
#[derive(Debug, Clone)]
struct Invocation {
    program: &'static str,
    args: Vec<String>,
    call_timeout: Duration,
}

/// Transport ssh/scp ; les timeouts sont relus dans le registre à chaque appel
pub struct SshExecutor {
    registry: Arc<NodeRegistry>,
}

impl SshExecutor {
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        Self { registry }
    }

    fn common_options(settings: &ClusterSettings, node: &NodeRecord) -> Vec<String> {
        let mut args = Vec::with_capacity(10);
        if !node.key_path.is_empty() {
            args.push("-i".to_string());
            args.push(node.key_path.clone());
        }
        for opt in [
            "StrictHostKeyChecking=no".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            format!("ConnectTimeout={}", settings.connection_timeout),
            "LogLevel=ERROR".to_string(),
        ] {
            args.push("-o".to_string());
            args.push(opt);
        }
        args
    }

    async fn ssh_invocation(&self, node: &NodeRecord, command: &str) -> Result<Invocation> {
        let settings = self.registry.settings().await?;
        let mut args = Self::common_options(&settings, node);
        args.push(format!("{}@{}", node.user, node.host));
        args.push(command.to_string());
        Ok(Invocation {
            program: "ssh",
            args,
            call_timeout: settings.sync_timeout(),
        })
    }

    async fn scp_invocation(&self, node: &NodeRecord, local: &Path, remote: &str, recursive: bool) -> Result<Invocation> {
        let settings = self.registry.settings().await?;
        let mut args = Vec::new();
        if recursive {
            args.push("-r".to_string());
        }
        args.extend(Self::common_options(&settings, node));
        args.push(local.display().to_string());
        // scp développe le chemin distant dans le shell distant
        args.push(format!("{}@{}:{}", node.user, node.host, quote(remote)));
        Ok(Invocation {
            program: "scp",
            args,
            call_timeout: settings.sync_timeout(),
        })
    }

    /// Pas de kill_on_drop : une requête abandonnée n'interrompt pas la commande distante
    async fn run(&self, node: &NodeRecord, step: &str, inv: Invocation) -> Result<Output> {
        let Invocation { program, args, call_timeout } = inv;
        tracing::debug!("[remote] {} on {}: {} {:?}", step, node.name, program, args.last());
        let mut cmd = Command::new(program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = match tokio::time::timeout(call_timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(FleetError::transport(&node.name, step, format!("failed to spawn {program}: {e}"))),
            Err(_) => {
                return Err(FleetError::transport(
                    &node.name,
                    step,
                    format!("timed out after {}s", call_timeout.as_secs()),
                ))
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = if stderr.trim().is_empty() {
                String::from_utf8_lossy(&output.stdout).trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            return Err(FleetError::transport(
                &node.name,
                step,
                format!("{program} exited with {}: {detail}", output.status),
            ));
        }
        Ok(output)
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn exec(&self, node: &NodeRecord, command: &str) -> Result<String> {
        let inv = self.ssh_invocation(node, command).await?;
        let output = self.run(node, "exec", inv).await?;
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(combined)
    }

    async fn exec_captured(&self, node: &NodeRecord, command: &str) -> Result<String> {
        let inv = self.ssh_invocation(node, command).await?;
        let output = self.run(node, "exec", inv).await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn copy(&self, node: &NodeRecord, local: &Path, remote: &str) -> Result<()> {
        let inv = self.scp_invocation(node, local, remote, false).await?;
        self.run(node, "copy", inv).await?;
        Ok(())
    }

    async fn copy_dir(&self, node: &NodeRecord, local_dir: &Path, remote_dir: &str) -> Result<()> {
        let inv = self.scp_invocation(node, local_dir, remote_dir, true).await?;
        self.run(node, "copy-dir", inv).await?;
        Ok(())
    }
}
