/**
 * FLEET KERNEL - Contrôleur de flotte de nœuds de simulation
 *
 * RÔLE : Déploiement/activation des nœuds distants, contrôle du binaire de simulation,
 * répartition proportionnelle de l'EPS entre sources, diffusion de l'arbre conf.d.
 *
 * ARCHITECTURE : composants explicites assemblés une fois dans `Fleet`, exposés en
 * HTTP/WebSocket (`http`) et en CLI (binaire `fleet-kernel`).
 */

pub mod api;
pub mod broadcast;
pub mod confd;
pub mod config;
pub mod deploy;
pub mod error;
pub mod fleet;
pub mod http;
pub mod persist;
pub mod poller;
pub mod process;
pub mod registry;
pub mod remote;
pub mod sources;
pub mod state;

pub use api::ApiResponse;
pub use error::{ErrorKind, FleetError, Result};
pub use fleet::Fleet;
pub use registry::{ClusterSettings, NodeRecord, NodeRegistry};
pub use remote::RemoteExecutor;
