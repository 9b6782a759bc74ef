/*!
Mock RemoteExecutor pour tester sans ssh

Enregistre chaque appel (exec, exec_captured, copy, copy_dir) et répond selon des
règles scriptées : échec ou sortie fixe quand la commande contient un motif.
La règle ajoutée en dernier l'emporte. Sans règle : sortie vide, sauf `echo`
qui renvoie son argument.
*/

use async_trait::async_trait;
use fleet_kernel::error::{FleetError, Result};
use fleet_kernel::registry::NodeRecord;
use fleet_kernel::remote::RemoteExecutor;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    Exec { node: String, command: String },
    ExecCaptured { node: String, command: String },
    Copy { node: String, local: String, remote: String },
    CopyDir { node: String, local: String, remote: String },
}

impl MockCall {
    pub fn node(&self) -> &str {
        match self {
            MockCall::Exec { node, .. }
            | MockCall::ExecCaptured { node, .. }
            | MockCall::Copy { node, .. }
            | MockCall::CopyDir { node, .. } => node,
        }
    }

    /// Texte comparé aux motifs des règles
    pub fn text(&self) -> String {
        match self {
            MockCall::Exec { command, .. } | MockCall::ExecCaptured { command, .. } => command.clone(),
            MockCall::Copy { local, remote, .. } => format!("copy {local} {remote}"),
            MockCall::CopyDir { local, remote, .. } => format!("copy-dir {local} {remote}"),
        }
    }

    fn step(&self) -> &'static str {
        match self {
            MockCall::Exec { .. } | MockCall::ExecCaptured { .. } => "exec",
            MockCall::Copy { .. } => "copy",
            MockCall::CopyDir { .. } => "copy-dir",
        }
    }
}

#[derive(Debug, Clone)]
enum Action {
    Fail(String),
    Respond(String),
}

#[derive(Debug, Clone)]
struct Rule {
    node: Option<String>,
    pattern: String,
    action: Action,
    once: bool,
}

impl Rule {
    fn matches(&self, call: &MockCall) -> bool {
        self.node.as_deref().map_or(true, |n| n == call.node()) && call.text().contains(&self.pattern)
    }
}

#[derive(Clone, Default)]
pub struct MockExecutor {
    calls: Arc<Mutex<Vec<MockCall>>>,
    rules: Arc<Mutex<Vec<Rule>>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_rule(&self, node: Option<&str>, pattern: &str, action: Action) -> &Self {
        self.push(node, pattern, action, false)
    }

    fn push(&self, node: Option<&str>, pattern: &str, action: Action, once: bool) -> &Self {
        self.rules.lock().push(Rule {
            node: node.map(str::to_string),
            pattern: pattern.to_string(),
            action,
            once,
        });
        self
    }

    /// Tout appel dont le texte contient `pattern` échoue (TransportFailure)
    pub fn fail_on(&self, pattern: &str, reason: &str) -> &Self {
        self.push_rule(None, pattern, Action::Fail(reason.to_string()))
    }

    pub fn fail_on_node(&self, node: &str, pattern: &str, reason: &str) -> &Self {
        self.push_rule(Some(node), pattern, Action::Fail(reason.to_string()))
    }

    /// Tout appel dont le texte contient `pattern` renvoie `stdout`
    pub fn respond(&self, pattern: &str, stdout: &str) -> &Self {
        self.push_rule(None, pattern, Action::Respond(stdout.to_string()))
    }

    pub fn respond_on_node(&self, node: &str, pattern: &str, stdout: &str) -> &Self {
        self.push_rule(Some(node), pattern, Action::Respond(stdout.to_string()))
    }

    /// Comme `respond`, mais la règle est consommée au premier appel correspondant
    pub fn respond_once(&self, pattern: &str, stdout: &str) -> &Self {
        self.push(None, pattern, Action::Respond(stdout.to_string()), true)
    }

    pub fn clear_rules(&self) {
        self.rules.lock().clear();
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Textes des appels reçus par un nœud, dans l'ordre
    pub fn commands_for(&self, node: &str) -> Vec<String> {
        self.calls.lock().iter().filter(|c| c.node() == node).map(MockCall::text).collect()
    }

    pub fn count_matching(&self, pattern: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.text().contains(pattern)).count()
    }

    fn resolve(&self, call: MockCall) -> Result<String> {
        let rule = {
            let mut rules = self.rules.lock();
            match rules.iter().rposition(|r| r.matches(&call)) {
                Some(i) if rules[i].once => Some(rules.remove(i)),
                Some(i) => Some(rules[i].clone()),
                None => None,
            }
        };
        let outcome = match rule.map(|r| r.action) {
            Some(Action::Fail(reason)) => Err(FleetError::transport(call.node(), call.step(), reason)),
            Some(Action::Respond(stdout)) => Ok(stdout),
            None => Ok(default_output(&call)),
        };
        self.calls.lock().push(call);
        outcome
    }
}

fn default_output(call: &MockCall) -> String {
    match call {
        MockCall::Exec { command, .. } | MockCall::ExecCaptured { command, .. } => match command.strip_prefix("echo ") {
            Some(arg) => format!("{}\n", arg.trim().trim_matches('\'')),
            None => String::new(),
        },
        _ => String::new(),
    }
}

#[async_trait]
impl RemoteExecutor for MockExecutor {
    async fn exec(&self, node: &NodeRecord, command: &str) -> Result<String> {
        self.resolve(MockCall::Exec {
            node: node.name.clone(),
            command: command.to_string(),
        })
    }

    async fn exec_captured(&self, node: &NodeRecord, command: &str) -> Result<String> {
        self.resolve(MockCall::ExecCaptured {
            node: node.name.clone(),
            command: command.to_string(),
        })
    }

    async fn copy(&self, node: &NodeRecord, local: &Path, remote: &str) -> Result<()> {
        self.resolve(MockCall::Copy {
            node: node.name.clone(),
            local: local.display().to_string(),
            remote: remote.to_string(),
        })
        .map(|_| ())
    }

    async fn copy_dir(&self, node: &NodeRecord, local_dir: &Path, remote_dir: &str) -> Result<()> {
        self.resolve(MockCall::CopyDir {
            node: node.name.clone(),
            local: local_dir.display().to_string(),
            remote: remote_dir.to_string(),
        })
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> NodeRecord {
        NodeRecord {
            name: name.into(),
            host: "127.0.0.1".into(),
            user: "sim".into(),
            key_path: String::new(),
            conf_dir: "/srv/sim".into(),
            binary_dir: "/srv/sim/bin".into(),
            metrics_port: 8085,
            description: String::new(),
            enabled: true,
        }
    }

    #[tokio::test]
    async fn test_rules_and_recording() {
        let mock = MockExecutor::new();
        mock.respond("pgrep", "4242\n").fail_on_node("w2", "mkdir", "permission denied");

        assert_eq!(mock.exec_captured(&node("w1"), "pgrep -f x").await.unwrap(), "4242\n");
        assert!(mock.exec(&node("w1"), "mkdir -p /a").await.is_ok());
        let err = mock.exec(&node("w2"), "mkdir -p /a").await.unwrap_err();
        assert!(err.to_string().contains("permission denied"));
        assert_eq!(mock.exec_captured(&node("w1"), "echo 'SSH connection test'").await.unwrap(), "SSH connection test\n");

        assert_eq!(mock.calls().len(), 4);
        assert_eq!(mock.commands_for("w2"), vec!["mkdir -p /a".to_string()]);
    }

    #[tokio::test]
    async fn test_latest_rule_wins() {
        let mock = MockExecutor::new();
        mock.fail_on("copy", "scp exited with 1");
        mock.respond("copy", "");
        assert!(mock.copy(&node("w1"), Path::new("/tmp/a"), "/b").await.is_ok());
    }

    #[tokio::test]
    async fn test_respond_once_is_consumed() {
        let mock = MockExecutor::new();
        mock.respond("pgrep", "4242\n").respond_once("pgrep", "");
        assert_eq!(mock.exec_captured(&node("w1"), "pgrep -f x").await.unwrap(), "");
        assert_eq!(mock.exec_captured(&node("w1"), "pgrep -f x").await.unwrap(), "4242\n");
        assert_eq!(mock.count_matching("pgrep"), 2);
    }
}
