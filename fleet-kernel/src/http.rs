/**
 * API REST FLEET - Serveur HTTP + WebSocket du kernel
 *
 * RÔLE :
 * Expose les opérations de la façade `Fleet` (nœuds, processus, sources/EPS,
 * conf.d, simulation) et le flux WebSocket des instantanés d'état.
 *
 * FONCTIONNEMENT :
 * - Serveur Axum, middleware auth API key
 * - Chaque handler renvoie une `ApiResponse` ; le code HTTP découle de son type d'erreur
 *   (206 pour un fan-out partiel)
 * - /ws : instantané courant à la connexion, puis chaque publication du broadcaster
 *
 * SÉCURITÉ :
 * - Header x-api-key obligatoire sauf /health et /ws
 * - FLEET_API_KEY absente = accès refusé
 */

use crate::api::ApiResponse;
use crate::error::ErrorKind;
use crate::fleet::Fleet;
use crate::registry::{ClusterSettings, NodeRecord};
use crate::state::{FleetState, MetricsUpdate, SimulationConfig};
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;

pub const API_KEY_ENV: &str = "FLEET_API_KEY";

#[derive(Clone)]
pub struct AppState {
    pub fleet: Arc<Fleet>,
}

type Reply = (StatusCode, Json<ApiResponse>);

fn status_for(resp: &ApiResponse) -> StatusCode {
    if resp.success {
        return StatusCode::OK;
    }
    if resp.partial {
        return StatusCode::PARTIAL_CONTENT;
    }
    match resp.error_kind {
        Some(ErrorKind::InvalidRequest | ErrorKind::UnknownSource | ErrorKind::NodeDisabled) => StatusCode::BAD_REQUEST,
        Some(ErrorKind::NotFound) => StatusCode::NOT_FOUND,
        Some(ErrorKind::AlreadyExists | ErrorKind::AlreadyRunning | ErrorKind::NotRunning | ErrorKind::Conflict) => {
            StatusCode::CONFLICT
        }
        Some(ErrorKind::TransportFailure | ErrorKind::VerificationFailed) | None => StatusCode::BAD_GATEWAY,
        Some(ErrorKind::MissingArtifact | ErrorKind::Config | ErrorKind::Internal) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reply(resp: ApiResponse) -> Reply {
    (status_for(&resp), Json(resp))
}

/// Corps JSON optionnel : vide = valeurs par défaut
fn optional_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, Reply> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| {
        reply(ApiResponse::fail(&crate::error::FleetError::InvalidRequest(format!(
            "invalid JSON body: {e}"
        ))))
    })
}

async fn require_api_key(req: Request, next: Next) -> Result<Response, StatusCode> {
    let path = req.uri().path();
    if path == "/health" || path == "/ws" {
        return Ok(next.run(req).await);
    }

    let expected = std::env::var(API_KEY_ENV).unwrap_or_default();
    if expected.is_empty() {
        tracing::warn!("[http] {} not set - API access denied", API_KEY_ENV);
        return Err(StatusCode::UNAUTHORIZED);
    }

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);
    if !ok {
        tracing::warn!("[http] rejected unauthenticated request to {}", path);
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/ws", get(ws_handler))
        .route("/api/dashboard", get(dashboard))
        .route("/api/simulation/start", post(start_simulation))
        .route("/api/simulation/stop", post(stop_simulation))
        .route("/api/nodes", get(list_nodes).post(add_node))
        .route("/api/nodes/health", get(fleet_health))
        .route("/api/nodes/{name}", axum::routing::delete(remove_node))
        .route("/api/nodes/{name}/enable", post(enable_node))
        .route("/api/nodes/{name}/disable", post(disable_node))
        .route("/api/nodes/{name}/metrics", post(update_metrics))
        .route("/api/ssh/status", get(ssh_status))
        .route("/api/settings", get(get_settings).put(update_settings))
        .route("/api/process", get(process_status_all))
        .route("/api/process/{name}", get(process_status))
        .route("/api/process/{name}/start", post(start_process))
        .route("/api/process/{name}/stop", post(stop_process))
        .route("/api/process/{name}/metrics-agent", post(start_metrics_agent))
        .route("/api/sources", get(list_sources))
        .route("/api/sources/{name}", get(source_details))
        .route("/api/sources/{name}/enable", post(enable_source))
        .route("/api/sources/{name}/disable", post(disable_source))
        .route("/api/eps/distribute", post(distribute_eps))
        .route("/api/eps/current", get(current_eps))
        .route("/api/confd/distribute", post(distribute_confd))
        .with_state(app_state)
        .layer(middleware::from_fn(require_api_key))
}

// ---- dashboard / simulation ------------------------------------------------

async fn dashboard(State(app): State<AppState>) -> Json<FleetState> {
    Json(app.fleet.state().snapshot())
}

async fn start_simulation(State(app): State<AppState>, Json(cfg): Json<SimulationConfig>) -> Reply {
    reply(app.fleet.start_simulation(cfg))
}

async fn stop_simulation(State(app): State<AppState>) -> Reply {
    reply(app.fleet.stop_simulation())
}

// ---- nœuds -----------------------------------------------------------------

async fn list_nodes(State(app): State<AppState>) -> Reply {
    reply(app.fleet.list_nodes().await)
}

async fn add_node(State(app): State<AppState>, Json(record): Json<NodeRecord>) -> Reply {
    reply(app.fleet.add_node(record).await)
}

async fn remove_node(State(app): State<AppState>, Path(name): Path<String>) -> Reply {
    reply(app.fleet.remove_node(&name).await)
}

async fn enable_node(State(app): State<AppState>, Path(name): Path<String>) -> Reply {
    reply(app.fleet.enable_node(&name).await)
}

async fn disable_node(State(app): State<AppState>, Path(name): Path<String>) -> Reply {
    reply(app.fleet.disable_node(&name).await)
}

async fn update_metrics(
    State(app): State<AppState>,
    Path(name): Path<String>,
    Json(update): Json<MetricsUpdate>,
) -> Reply {
    reply(app.fleet.update_node_metrics(&name, update))
}

async fn fleet_health(State(app): State<AppState>) -> Reply {
    reply(app.fleet.fleet_health().await)
}

async fn ssh_status(State(app): State<AppState>) -> Reply {
    reply(app.fleet.connectivity_report().await)
}

async fn get_settings(State(app): State<AppState>) -> Reply {
    reply(app.fleet.settings().await)
}

async fn update_settings(State(app): State<AppState>, Json(settings): Json<ClusterSettings>) -> Reply {
    reply(app.fleet.update_settings(settings).await)
}

// ---- processus -------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartBody {
    timeout_minutes: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StopBody {
    timeout_secs: Option<u64>,
}

async fn process_status_all(State(app): State<AppState>) -> Reply {
    reply(app.fleet.process_status_all().await)
}

async fn process_status(State(app): State<AppState>, Path(name): Path<String>) -> Reply {
    reply(app.fleet.process_status(&name).await)
}

async fn start_process(State(app): State<AppState>, Path(name): Path<String>, body: Bytes) -> Reply {
    let body: StartBody = match optional_body(&body) {
        Ok(b) => b,
        Err(r) => return r,
    };
    reply(app.fleet.start_process(&name, body.timeout_minutes).await)
}

async fn stop_process(State(app): State<AppState>, Path(name): Path<String>, body: Bytes) -> Reply {
    let body: StopBody = match optional_body(&body) {
        Ok(b) => b,
        Err(r) => return r,
    };
    reply(app.fleet.stop_process(&name, body.timeout_secs).await)
}

async fn start_metrics_agent(State(app): State<AppState>, Path(name): Path<String>) -> Reply {
    reply(app.fleet.start_metrics_agent(&name).await)
}

// ---- sources / EPS / conf.d ------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DistributeBody {
    #[serde(default)]
    selected_sources: Vec<String>,
    total_eps: i64,
    #[serde(default)]
    propagate: bool,
}

async fn list_sources(State(app): State<AppState>) -> Reply {
    reply(app.fleet.list_sources().await)
}

async fn source_details(State(app): State<AppState>, Path(name): Path<String>) -> Reply {
    reply(app.fleet.source_details(&name).await)
}

async fn enable_source(State(app): State<AppState>, Path(name): Path<String>) -> Reply {
    reply(app.fleet.enable_source(&name).await)
}

async fn disable_source(State(app): State<AppState>, Path(name): Path<String>) -> Reply {
    reply(app.fleet.disable_source(&name).await)
}

async fn distribute_eps(State(app): State<AppState>, Json(body): Json<DistributeBody>) -> Reply {
    reply(
        app.fleet
            .distribute_eps(&body.selected_sources, body.total_eps, body.propagate)
            .await,
    )
}

async fn current_eps(State(app): State<AppState>) -> Reply {
    reply(app.fleet.current_eps().await)
}

async fn distribute_confd(State(app): State<AppState>) -> Reply {
    reply(app.fleet.distribute_confd().await)
}

// ---- WebSocket -------------------------------------------------------------

async fn ws_handler(ws: WebSocketUpgrade, State(app): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| client_session(socket, app))
}

async fn client_session(mut socket: WebSocket, app: AppState) {
    // abonnement avant l'instantané : aucune publication ne peut être manquée
    let mut sub = app.fleet.state().broadcaster().subscribe();
    let initial = match serde_json::to_string(&app.fleet.state().snapshot()) {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!("[http] snapshot serialization failed: {}", e);
            return;
        }
    };
    if socket.send(Message::Text(initial.into())).await.is_err() {
        return;
    }
    tracing::debug!("[http] websocket client {} attached", sub.id);

    loop {
        tokio::select! {
            outgoing = sub.recv() => match outgoing {
                Some(json) => {
                    if socket.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    tracing::debug!("[http] websocket client {} detached", sub.id);
}
