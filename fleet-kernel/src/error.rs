/**
 * ERREURS FLEET - Type d'erreur unique partagé par tous les composants du kernel
 *
 * RÔLE :
 * Chaque opération du kernel (registre, déploiement, processus, EPS, conf.d)
 * remonte un `FleetError`. La couche HTTP traduit `ErrorKind` en code de statut,
 * la façade `Fleet` le traduit en `ApiResponse { success: false, .. }`.
 */

use serde::Serialize;
use std::path::PathBuf;

/// Erreurs possibles lors des opérations sur la flotte
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Already exists: {0}")]
    AlreadyExists(String),
    #[error("Missing local artifact: {}", .0.display())]
    MissingArtifact(PathBuf),
    #[error("Transport failure on node {node} during {step}: {reason}")]
    TransportFailure {
        node: String,
        step: String,
        reason: String,
    },
    #[error("Health verification failed on node {node}: {reason}")]
    VerificationFailed { node: String, reason: String },
    #[error("Unknown source: {0}")]
    UnknownSource(String),
    #[error("Process already running on node {node} (PID {pid})")]
    AlreadyRunning { node: String, pid: u32 },
    #[error("Process not running on node {0}")]
    NotRunning(String),
    #[error("Node {0} is disabled")]
    NodeDisabled(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Invalid configuration in {}: {reason}", path.display())]
    Config { path: PathBuf, reason: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, FleetError>;

/// Catégorie stable d'une erreur, exposée dans les réponses API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequest,
    NotFound,
    AlreadyExists,
    MissingArtifact,
    TransportFailure,
    VerificationFailed,
    UnknownSource,
    AlreadyRunning,
    NotRunning,
    NodeDisabled,
    Conflict,
    Config,
    Internal,
}

impl FleetError {
    pub fn transport(node: &str, step: &str, reason: impl Into<String>) -> Self {
        FleetError::TransportFailure {
            node: node.to_string(),
            step: step.to_string(),
            reason: reason.into(),
        }
    }

    pub fn verification(node: &str, reason: impl Into<String>) -> Self {
        FleetError::VerificationFailed {
            node: node.to_string(),
            reason: reason.into(),
        }
    }

    pub fn config(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        FleetError::Config {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Renomme l'étape d'un échec de transport (ex: "exec" -> "create-dirs")
    pub fn at_step(self, step: &str) -> Self {
        match self {
            FleetError::TransportFailure { node, reason, .. } => FleetError::TransportFailure {
                node,
                step: step.to_string(),
                reason,
            },
            other => other,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FleetError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            FleetError::NotFound(_) => ErrorKind::NotFound,
            FleetError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            FleetError::MissingArtifact(_) => ErrorKind::MissingArtifact,
            FleetError::TransportFailure { .. } => ErrorKind::TransportFailure,
            FleetError::VerificationFailed { .. } => ErrorKind::VerificationFailed,
            FleetError::UnknownSource(_) => ErrorKind::UnknownSource,
            FleetError::AlreadyRunning { .. } => ErrorKind::AlreadyRunning,
            FleetError::NotRunning(_) => ErrorKind::NotRunning,
            FleetError::NodeDisabled(_) => ErrorKind::NodeDisabled,
            FleetError::Conflict(_) => ErrorKind::Conflict,
            FleetError::Config { .. } => ErrorKind::Config,
            FleetError::Io(_) | FleetError::Yaml(_) => ErrorKind::Internal,
        }
    }
}
