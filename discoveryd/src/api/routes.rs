use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use robot_discovery::{healthy_addresses, representative, AddressStatus, DiscoveryClient};
use shared::types::{AddressRecord, Candidate, Service};

#[derive(Clone)]
pub struct AppState {
    pub client: DiscoveryClient,
}

/// A service plus the status the UI should show for it
#[derive(Serialize)]
pub struct RobotView {
    #[serde(flatten)]
    pub service: Service,
    pub status: AddressStatus,
    pub ip: Option<String>,
    pub port: Option<u16>,
}

impl From<Service> for RobotView {
    fn from(service: Service) -> Self {
        let best = representative(&service);
        let status = best.map_or(AddressStatus::Unreachable, AddressStatus::of);
        let ip = best.and_then(|r| r.ip.clone());
        let port = best.map(|r| r.port);
        Self {
            service,
            status,
            ip,
            port,
        }
    }
}

#[derive(Deserialize)]
pub struct AddCandidateRequest {
    pub ip: String,
    pub port: Option<u16>,
}

#[derive(Serialize)]
pub struct AddCandidateResponse {
    pub added: bool,
}

#[derive(Deserialize)]
pub struct PollIntervalRequest {
    pub ms: u64,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/robots", get(get_robots))
        .route("/v1/robots/healthy", get(get_healthy))
        .route("/v1/robots/hash", get(get_hash))
        .route("/v1/robots/:name", get(get_robot).delete(delete_robot))
        .route("/v1/candidates", get(get_candidates).post(add_candidate))
        .route("/v1/poll-interval", put(set_poll_interval))
        .with_state(state)
}

async fn get_robots(State(state): State<AppState>) -> Json<Vec<RobotView>> {
    Json(state.client.services().into_iter().map(RobotView::from).collect())
}

async fn get_healthy(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(healthy_addresses(&state.client.services()))
}

async fn get_hash(State(state): State<AppState>) -> String {
    state.client.fingerprint()
}

async fn get_robot(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<RobotView>, StatusCode> {
    state
        .client
        .services()
        .into_iter()
        .find(|s| s.name == name)
        .map(|s| Json(RobotView::from(s)))
        .ok_or(StatusCode::NOT_FOUND)
}

async fn delete_robot(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Vec<AddressRecord>>, StatusCode> {
    state
        .client
        .remove(name)
        .await
        .map_err(|e| {
            tracing::error!("Failed to remove robot: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn get_candidates(State(state): State<AppState>) -> Json<Vec<Candidate>> {
    Json(state.client.candidates())
}

async fn add_candidate(
    State(state): State<AppState>,
    Json(req): Json<AddCandidateRequest>,
) -> Result<(StatusCode, Json<AddCandidateResponse>), StatusCode> {
    let added = state.client.add(req.ip, req.port).await.map_err(|e| {
        tracing::error!("Failed to add candidate: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let status = if added { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(AddCandidateResponse { added })))
}

async fn set_poll_interval(
    State(state): State<AppState>,
    Json(req): Json<PollIntervalRequest>,
) -> StatusCode {
    match state.client.set_poll_interval(req.ms).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(e) => {
            tracing::error!("Failed to set poll interval: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
