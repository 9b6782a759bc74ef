/**
 * BROADCASTER - Diffusion des instantanés FleetState vers les clients WebSocket
 *
 * RÔLE :
 * Une tâche unique possède l'ensemble des clients et reçoit les commandes
 * (enregistrement, désinscription, publication) via un channel.
 *
 * FONCTIONNEMENT :
 * - Seule la tâche mute la map des clients : aucune course possible
 * - Publication = try_send vers chaque client
 * - Client fermé ou saturé = retiré par la tâche elle-même
 * - Publication versionnée : ignorée si elle n'est pas plus récente que la
 *   dernière diffusée (les éditeurs publient hors verrou, l'ordre d'arrivée
 *   peut différer de l'ordre des mutations)
 */

use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};
use uuid::Uuid;

/// Taille du buffer par client avant qu'il soit considéré non réactif
pub const CLIENT_BUFFER: usize = 32;

enum BroadcastCommand {
    Register { id: Uuid, tx: mpsc::Sender<String> },
    Unregister(Uuid),
    Publish { version: Option<u64>, payload: String },
    ClientCount(oneshot::Sender<usize>),
}

#[derive(Clone)]
pub struct BroadcastHandle {
    tx: mpsc::UnboundedSender<BroadcastCommand>,
}

/// Abonnement d'un client ; se désinscrit automatiquement au drop
pub struct Subscription {
    pub id: Uuid,
    rx: mpsc::Receiver<String>,
    handle: BroadcastHandle,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.handle.tx.send(BroadcastCommand::Unregister(self.id));
    }
}

/// Démarre la tâche propriétaire des clients et retourne son handle
pub fn spawn_broadcaster() -> BroadcastHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run(rx));
    BroadcastHandle { tx }
}

async fn run(mut rx: mpsc::UnboundedReceiver<BroadcastCommand>) {
    let mut clients: HashMap<Uuid, mpsc::Sender<String>> = HashMap::new();
    let mut last_version: u64 = 0;

    while let Some(cmd) = rx.recv().await {
        match cmd {
            BroadcastCommand::Register { id, tx } => {
                clients.insert(id, tx);
                debug!("[broadcast] client {} registered ({} total)", id, clients.len());
            }
            BroadcastCommand::Unregister(id) => {
                if clients.remove(&id).is_some() {
                    debug!("[broadcast] client {} left ({} total)", id, clients.len());
                }
            }
            BroadcastCommand::Publish { version, payload } => {
                if let Some(v) = version {
                    if v <= last_version {
                        debug!("[broadcast] stale snapshot v{} dropped (last v{})", v, last_version);
                        continue;
                    }
                    last_version = v;
                }
                clients.retain(|id, tx| match tx.try_send(payload.clone()) {
                    Ok(()) => true,
                    Err(TrySendError::Full(_)) => {
                        warn!("[broadcast] dropping unresponsive client {}", id);
                        false
                    }
                    Err(TrySendError::Closed(_)) => false,
                });
            }
            BroadcastCommand::ClientCount(reply) => {
                let _ = reply.send(clients.len());
            }
        }
    }
}

impl BroadcastHandle {
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(CLIENT_BUFFER);
        let id = Uuid::new_v4();
        let _ = self.tx.send(BroadcastCommand::Register { id, tx });
        Subscription {
            id,
            rx,
            handle: self.clone(),
        }
    }

    pub fn publish<T: Serialize>(&self, value: &T) {
        self.send_payload(None, value);
    }

    /// Publication d'un instantané versionné ; une version déjà dépassée n'est pas diffusée
    pub fn publish_versioned<T: Serialize>(&self, version: u64, value: &T) {
        self.send_payload(Some(version), value);
    }

    fn send_payload<T: Serialize>(&self, version: Option<u64>, value: &T) {
        match serde_json::to_string(value) {
            Ok(payload) => {
                let _ = self.tx.send(BroadcastCommand::Publish { version, payload });
            }
            Err(e) => warn!("[broadcast] failed to serialize snapshot: {}", e),
        }
    }

    pub async fn client_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(BroadcastCommand::ClientCount(reply)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let handle = spawn_broadcaster();
        let mut a = handle.subscribe();
        let mut b = handle.subscribe();

        handle.publish(&serde_json::json!({"eps": 10}));

        assert_eq!(a.recv().await.unwrap(), r#"{"eps":10}"#);
        assert_eq!(b.recv().await.unwrap(), r#"{"eps":10}"#);
        assert_eq!(handle.client_count().await, 2);
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_removed() {
        let handle = spawn_broadcaster();
        let sub = handle.subscribe();
        assert_eq!(handle.client_count().await, 1);
        drop(sub);
        assert_eq!(handle.client_count().await, 0);
    }

    #[tokio::test]
    async fn test_slow_client_is_pruned() {
        let handle = spawn_broadcaster();
        let _slow = handle.subscribe();
        for i in 0..=CLIENT_BUFFER {
            handle.publish(&i);
        }
        assert_eq!(handle.client_count().await, 0);
    }

    #[tokio::test]
    async fn test_older_snapshot_is_not_delivered_after_newer() {
        let handle = spawn_broadcaster();
        let mut sub = handle.subscribe();

        handle.publish_versioned(2, &serde_json::json!({"version": 2}));
        handle.publish_versioned(1, &serde_json::json!({"version": 1}));
        handle.publish_versioned(2, &serde_json::json!({"version": 2, "dup": true}));
        handle.publish_versioned(3, &serde_json::json!({"version": 3}));

        assert_eq!(sub.recv().await.unwrap(), r#"{"version":2}"#);
        assert_eq!(sub.recv().await.unwrap(), r#"{"version":3}"#);
    }
}
