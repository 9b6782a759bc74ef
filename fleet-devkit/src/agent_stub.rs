/*!
Stub de l'agent de métriques d'un nœud

Serveur axum sur 127.0.0.1:<port éphémère> qui sert `/health` et
`/api/system/metrics` avec des corps configurables pendant le test.
*/

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[derive(Clone)]
struct Canned {
    health: Arc<Mutex<(u16, Value)>>,
    metrics: Arc<Mutex<Value>>,
}

pub struct StubAgent {
    addr: SocketAddr,
    canned: Canned,
    handle: JoinHandle<()>,
}

async fn health(State(c): State<Canned>) -> (StatusCode, Json<Value>) {
    let (code, body) = c.health.lock().clone();
    (StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR), Json(body))
}

async fn metrics(State(c): State<Canned>) -> Json<Value> {
    Json(c.metrics.lock().clone())
}

impl StubAgent {
    /// Démarre un agent sain annonçant `node_id`
    pub async fn start(node_id: &str) -> Result<Self> {
        let canned = Canned {
            health: Arc::new(Mutex::new((200, json!({ "status": "healthy", "nodeId": node_id })))),
            metrics: Arc::new(Mutex::new(json!({
                "nodeId": node_id,
                "running": false,
                "system": {
                    "cpu": { "used_percent": 12.5, "cores": 4, "load_1m": 0.3 },
                    "memory": { "used_gb": 2.0, "available_gb": 6.0, "total_gb": 8.0, "used_percent": 25.0 },
                    "uptime_seconds": 3600
                }
            }))),
        };
        let app = Router::new()
            .route("/health", get(health))
            .route("/api/system/health", get(health))
            .route("/api/system/metrics", get(metrics))
            .with_state(canned.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok(Self { addr, canned, handle })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn set_health(&self, status: u16, body: Value) {
        *self.canned.health.lock() = (status, body);
    }

    pub fn set_unhealthy(&self) {
        self.set_health(503, json!({ "status": "unhealthy" }));
    }

    pub fn set_metrics(&self, body: Value) {
        *self.canned.metrics.lock() = body;
    }
}

impl Drop for StubAgent {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
