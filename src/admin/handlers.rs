use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::cache::WarmReport;
use crate::config::{CacheSample, LoadBalancingStrategy};
use crate::health::{HealthSnapshot, HealthStatus};
use crate::http::response::ApiError;
use crate::http::server::AppState;
use crate::lifecycle::{OperationReport, RecoveryStatus};
use crate::registry::{ServiceDescriptor, ServiceState};
use crate::routing::RouterMetrics;

const DEFAULT_WARM_SAMPLE: usize = 10;

/// Empty body means defaults.
pub(crate) fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("invalid JSON body: {e}")))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StartupRequest {
    pub targets: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ShutdownRequest {
    pub targets: Vec<String>,
    pub graceful: bool,
}

impl Default for ShutdownRequest {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            graceful: true,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RestartRequest {
    pub service: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct StrategyRequest {
    pub strategy: String,
}

#[derive(Debug, Serialize)]
pub struct StrategyResponse {
    pub previous: LoadBalancingStrategy,
    pub strategy: LoadBalancingStrategy,
}

#[derive(Debug, Default, Deserialize)]
pub struct InvalidateRequest {
    pub pattern: String,
}

#[derive(Debug, Serialize)]
pub struct InvalidateResponse {
    pub pattern: String,
    pub removed: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct WarmRequest {
    pub service: String,
    pub sample_size: Option<usize>,
    pub queries: Option<Vec<CacheSample>>,
}

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub services: BTreeMap<String, ServiceState>,
    pub quarantined: Vec<String>,
    pub recovery: Vec<RecoveryStatus>,
    pub last_operation: Option<Arc<OperationReport>>,
}

pub async fn list_services(State(state): State<AppState>) -> Json<Vec<ServiceDescriptor>> {
    Json(state.plane.registry.list())
}

pub async fn get_health(State(state): State<AppState>) -> (StatusCode, Json<HealthSnapshot>) {
    let snapshot = state.plane.monitor.snapshot();
    let status = match snapshot.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (status, Json(snapshot))
}

pub async fn get_status(State(state): State<AppState>) -> Json<SystemStatus> {
    let services = state.plane.registry.list();
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        quarantined: services.iter().filter(|s| s.quarantined).map(|s| s.name.clone()).collect(),
        services: services.into_iter().map(|s| (s.name, s.state)).collect(),
        recovery: state.plane.recovery.status(),
        last_operation: state.plane.orchestrator.last_report(),
    })
}

pub async fn startup(State(state): State<AppState>, body: Bytes) -> Result<Json<OperationReport>, ApiError> {
    let request: StartupRequest = parse_body(&body)?;
    let report = state.plane.orchestrator.startup(&request.targets).await?;
    Ok(Json(report))
}

pub async fn shutdown(State(state): State<AppState>, body: Bytes) -> Result<Json<OperationReport>, ApiError> {
    let request: ShutdownRequest = parse_body(&body)?;
    let report = state
        .plane
        .orchestrator
        .shutdown(&request.targets, request.graceful)
        .await?;
    Ok(Json(report))
}

pub async fn restart(State(state): State<AppState>, body: Bytes) -> Result<Json<OperationReport>, ApiError> {
    let request: RestartRequest = parse_body(&body)?;
    if request.service.is_empty() {
        return Err(ApiError::bad_request("'service' is required"));
    }
    let report = state.plane.orchestrator.restart(&request.service).await?;
    Ok(Json(report))
}

pub async fn router_metrics(State(state): State<AppState>) -> Json<RouterMetrics> {
    Json(state.plane.router.metrics().await)
}

pub async fn set_strategy(State(state): State<AppState>, body: Bytes) -> Result<Json<StrategyResponse>, ApiError> {
    let request: StrategyRequest = parse_body(&body)?;
    let strategy: LoadBalancingStrategy = request
        .strategy
        .parse()
        .map_err(|e: String| ApiError::bad_request(e).with_target(request.strategy.clone()))?;

    let previous = state.plane.router.pools().strategy();
    state.plane.router.set_strategy(strategy);
    Ok(Json(StrategyResponse { previous, strategy }))
}

pub async fn invalidate_cache(State(state): State<AppState>, body: Bytes) -> Result<Json<InvalidateResponse>, ApiError> {
    let request: InvalidateRequest = parse_body(&body)?;
    if request.pattern.is_empty() {
        return Err(ApiError::bad_request("'pattern' is required"));
    }
    let removed = state.plane.router.cache().invalidate(&request.pattern).await?;
    Ok(Json(InvalidateResponse {
        pattern: request.pattern,
        removed,
    }))
}

pub async fn warm_cache(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let request: WarmRequest = parse_body(&body)?;
    if !state.plane.router.pools().contains(&request.service) {
        return Err(ApiError::not_found("service_not_found", &request.service));
    }
    let router = state.plane.router.clone();
    let report: WarmReport = router
        .cache()
        .warm(
            &*router,
            &request.service,
            request.sample_size.unwrap_or(DEFAULT_WARM_SAMPLE),
            request.queries,
        )
        .await?;
    Ok(Json(report).into_response())
}
