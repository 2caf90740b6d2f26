use std::sync::Arc;
use std::time::Duration;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use discovery_client::{DiscoveryClient, PollingMode, UpstreamAction};
use serde::{Deserialize, Serialize};
use shared::protocol::API_PREFIX;
use shared::types::{Address, RobotRecord};
use tokio::sync::watch;

#[derive(Clone)]
pub struct AppState {
    pub client: Arc<DiscoveryClient>,
    /// Digest of the last robot list delivered to subscribers
    pub hash_rx: watch::Receiver<String>,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub mode: PollingMode,
    pub poll_interval_ms: Option<u64>,
    pub addresses: Vec<Address>,
}

#[derive(Deserialize, Default)]
pub struct DiscoveryStartRequest {
    pub timeout_secs: Option<u64>,
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/robots", get(get_robots))
        .route("/robots/hash", get(get_hash))
        .route("/robots/:name", get(get_robot).delete(delete_robot))
        .route("/status", get(get_status))
        .route("/discovery/start", post(discovery_start))
        .route("/discovery/finish", post(discovery_finish))
        .route("/cache/clear", post(clear_cache));

    Router::new().nest(API_PREFIX, api).with_state(state)
}

async fn get_robots(State(state): State<AppState>) -> Json<Vec<RobotRecord>> {
    Json(state.client.robots().to_vec())
}

async fn get_hash(State(state): State<AppState>) -> String {
    state.hash_rx.borrow().clone()
}

async fn get_robot(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<RobotRecord>, StatusCode> {
    state
        .client
        .robots()
        .iter()
        .find(|r| r.name == name)
        .cloned()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn delete_robot(State(state): State<AppState>, Path(name): Path<String>) -> StatusCode {
    if !state.client.robots().iter().any(|r| r.name == name) {
        return StatusCode::NOT_FOUND;
    }
    state.client.handle(UpstreamAction::RemoveRobot(name)).await;
    StatusCode::NO_CONTENT
}

async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let polling = state.client.polling();
    Json(StatusResponse {
        mode: state.client.mode(),
        poll_interval_ms: polling.map(|(interval, _)| interval.as_millis() as u64),
        addresses: state.client.addresses().to_vec(),
    })
}

async fn discovery_start(
    State(state): State<AppState>,
    body: Option<Json<DiscoveryStartRequest>>,
) -> StatusCode {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let timeout = request.timeout_secs.map(Duration::from_secs);
    state.client.handle(UpstreamAction::DiscoveryStart { timeout }).await;
    StatusCode::ACCEPTED
}

async fn discovery_finish(State(state): State<AppState>) -> StatusCode {
    state.client.handle(UpstreamAction::DiscoveryFinish).await;
    StatusCode::ACCEPTED
}

async fn clear_cache(State(state): State<AppState>) -> StatusCode {
    state.client.handle(UpstreamAction::ClearCache).await;
    StatusCode::NO_CONTENT
}
