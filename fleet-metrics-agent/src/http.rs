//! HTTP surface consumed by the fleet kernel
//!
//! - `/`                   : agent identity
//! - `/health`             : liveness, checked after every deployment
//! - `/api/system/health`  : same payload, kept for dashboards
//! - `/api/system/metrics` : latest collected snapshot

use crate::metrics::SharedSnapshot;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct AgentState {
    pub node_id: Arc<str>,
    pub started: Instant,
    pub snapshot: SharedSnapshot,
}

impl AgentState {
    pub fn new(node_id: &str, snapshot: SharedSnapshot) -> Self {
        Self {
            node_id: Arc::from(node_id),
            started: Instant::now(),
            snapshot,
        }
    }
}

pub fn build_router(state: AgentState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/api/system/health", get(health))
        .route("/api/system/metrics", get(metrics))
        .with_state(state)
}

async fn root(State(state): State<AgentState>) -> Json<Value> {
    Json(json!({
        "status": "running",
        "nodeId": &*state.node_id,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn health(State(state): State<AgentState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "nodeId": &*state.node_id,
        "timestamp": Utc::now().to_rfc3339(),
        "uptime": state.started.elapsed().as_secs(),
    }))
}

async fn metrics(State(state): State<AgentState>) -> Json<Value> {
    let snapshot = state.snapshot.read().await.clone();
    Json(serde_json::to_value(snapshot).unwrap_or_else(|e| json!({ "error": e.to_string() })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsSnapshot;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tokio::sync::RwLock;
    use tower::ServiceExt;

    fn app(snapshot: MetricsSnapshot) -> Router {
        build_router(AgentState::new("sim-07", Arc::new(RwLock::new(snapshot))))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health_contract() {
        for uri in ["/health", "/api/system/health"] {
            let (status, body) = get_json(app(MetricsSnapshot::empty("sim-07")), uri).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["status"], "healthy");
            assert_eq!(body["nodeId"], "sim-07");
            assert!(body["uptime"].is_u64());
        }
    }

    #[tokio::test]
    async fn test_metrics_serves_latest_snapshot() {
        let mut snap = MetricsSnapshot::empty("sim-07");
        snap.running = true;
        snap.pid = Some(4242);
        snap.system.cpu.cores = 8;
        snap.system.memory.total_gb = 16.0;

        let (status, body) = get_json(app(snap), "/api/system/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["nodeId"], "sim-07");
        assert_eq!(body["running"], true);
        assert_eq!(body["pid"], 4242);
        assert_eq!(body["system"]["cpu"]["cores"], 8);
        assert_eq!(body["system"]["memory"]["total_gb"], 16.0);
    }

    #[tokio::test]
    async fn test_root_identity() {
        let (_, body) = get_json(app(MetricsSnapshot::empty("sim-07")), "/").await;
        assert_eq!(body["nodeId"], "sim-07");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }
}
