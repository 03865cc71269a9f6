use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::middleware::request_logging;
use crate::registry::{VaultListing, VaultRegistry};
use crate::vault::error::VaultError;
use crate::vault::instance::UserSummary;
use crate::vault::types::{Address, StrategyInfo, UnlockRequest};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<VaultRegistry>,
}

/// Create the read-only query router
pub fn create_router(registry: Arc<VaultRegistry>) -> Router {
    let state = AppState { registry };

    Router::new()
        .route("/health", get(health_check))
        .route("/api/vaults", get(list_vaults))
        .route("/api/vaults/:symbol", get(get_vault_info))
        .route("/api/vaults/:symbol/users/:user", get(get_vault_user))
        .route(
            "/api/vaults/:symbol/unlock-requests/pending",
            get(get_pending_unlocks),
        )
        .route("/api/users/:user/vault", get(get_user_vault))
        .layer(middleware::from_fn(request_logging))
        .with_state(state)
}

// ===== Route Handlers =====

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// All vaults in creation order with their TVL
async fn list_vaults(State(state): State<AppState>) -> Json<VaultsResponse> {
    let vaults = state.registry.listings();
    Json(VaultsResponse {
        count: vaults.len(),
        implementation: state.registry.vault_implementation(),
        vaults,
    })
}

async fn get_vault_info(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> Result<Json<StrategyInfo>, ApiError> {
    let handle = state.registry.require_vault(&symbol)?;
    let info = handle.lock().get_strategy_info();
    Ok(Json(info))
}

async fn get_vault_user(
    State(state): State<AppState>,
    Path((symbol, user)): Path<(String, String)>,
) -> Result<Json<UserSummary>, ApiError> {
    let user = parse_address(&user)?;
    let handle = state.registry.require_vault(&symbol)?;
    let summary = handle.lock().user_summary(&user);
    Ok(Json(summary))
}

/// Eligible pending unlock requests, FIFO
async fn get_pending_unlocks(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
    Query(params): Query<PendingQuery>,
) -> Result<Json<PendingResponse>, ApiError> {
    let max = params.max.unwrap_or(100);
    if max == 0 {
        return Err(ApiError::BadRequest("max must be greater than zero".to_string()));
    }
    let handle = state.registry.require_vault(&symbol)?;
    let requests = handle.lock().get_pending_unlock_requests(max);
    Ok(Json(PendingResponse {
        count: requests.len(),
        request_ids: requests.iter().map(|r| r.id).collect(),
        requests,
    }))
}

async fn get_user_vault(
    State(state): State<AppState>,
    Path(user): Path<String>,
) -> Result<Json<UserVaultResponse>, ApiError> {
    let user = parse_address(&user)?;
    let vault = state.registry.get_user_vault(&user);
    Ok(Json(UserVaultResponse { user, vault }))
}

fn parse_address(raw: &str) -> Result<Address, ApiError> {
    let address = Address::new(raw);
    if address.is_zero() {
        return Err(ApiError::BadRequest(format!("invalid address '{}'", raw)));
    }
    Ok(address)
}

// ===== Request/Response Types =====

#[derive(Deserialize)]
struct PendingQuery {
    /// Maximum number of requests (clamped by the vault's page limit)
    max: Option<usize>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct VaultsResponse {
    count: usize,
    implementation: Address,
    vaults: Vec<VaultListing>,
}

#[derive(Serialize)]
struct PendingResponse {
    count: usize,
    request_ids: Vec<u64>,
    requests: Vec<UnlockRequest>,
}

#[derive(Serialize)]
struct UserVaultResponse {
    user: Address,
    vault: Option<Address>,
}

// ===== Error Handling =====

#[derive(Debug)]
enum ApiError {
    NotFound(String),
    BadRequest(String),
}

impl From<VaultError> for ApiError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::InvalidStrategyId { reference } => {
                ApiError::NotFound(format!("vault '{}' not found", reference))
            }
            other => ApiError::BadRequest(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
        };

        let body = Json(json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}
