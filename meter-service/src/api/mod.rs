//! Operator-facing JSON API over the metering engine.

use std::{net::SocketAddr, sync::Arc, time::SystemTime};

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use meter_client::{
    domain::{Sample, Settings},
    engine::{CalibrationRequest, CalibrationSummary, MetricsSnapshot},
    MeteringEngine, SendError, StorageError,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{pipeline::Envelope, sources::IncomingSample, transform::validate_sample};

pub const DEFAULT_RECENT_LIMIT: usize = 100;
pub const MAX_RECENT_LIMIT: usize = 1000;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<MeteringEngine>,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Storage(StorageError),
    Notify(SendError),
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        Self::BadRequest(e.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Storage(e) => {
                tracing::error!(error = %e, "storage failure while serving request");
                metrics::counter!("api_storage_errors_total").increment(1);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "temporarily unavailable".to_string(),
                )
            }
            Self::Notify(SendError::NotConfigured(msg)) => (StatusCode::BAD_REQUEST, msg),
            Self::Notify(e) => {
                tracing::warn!(error = %e, "test notification failed");
                (StatusCode::BAD_GATEWAY, e.to_string())
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/metrics", get(get_metrics))
        .route("/api/hourly", get(get_hourly))
        .route("/api/monthly", get(get_monthly))
        .route("/api/recent", get(get_recent))
        .route("/api/settings", get(get_settings).put(put_settings))
        .route("/api/samples", post(post_sample))
        .route("/api/calibrate", post(post_calibrate))
        .route("/api/notify/test", post(post_notify_test))
        .with_state(state)
}

/// Serves the API until `shutdown` fires.
pub async fn serve(bind_addr: &str, state: AppState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr: SocketAddr = bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid api bind address '{bind_addr}': {e}"))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "api listening");

    axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct Buckets {
    pub labels: Vec<String>,
    pub pulses: Vec<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RecentParams {
    pub limit: Option<usize>,
}

pub fn recent_limit(requested: Option<usize>) -> usize {
    requested
        .unwrap_or(DEFAULT_RECENT_LIMIT)
        .clamp(1, MAX_RECENT_LIMIT)
}

async fn get_metrics(State(state): State<AppState>) -> ApiResult<MetricsSnapshot> {
    Ok(Json(state.engine.metrics().await?))
}

async fn get_hourly(State(state): State<AppState>) -> ApiResult<Buckets> {
    let buckets = state.engine.hourly_buckets_today(state.engine.now()).await?;
    Ok(Json(Buckets {
        labels: (0..24).map(|h| format!("{h:02}:00")).collect(),
        pulses: buckets.to_vec(),
    }))
}

async fn get_monthly(State(state): State<AppState>) -> ApiResult<Buckets> {
    let buckets = state
        .engine
        .monthly_buckets_this_year(state.engine.now())
        .await?;
    Ok(Json(Buckets {
        labels: (1..=12).map(|m| format!("{m:02}")).collect(),
        pulses: buckets.to_vec(),
    }))
}

async fn get_recent(
    State(state): State<AppState>,
    Query(params): Query<RecentParams>,
) -> ApiResult<Vec<Sample>> {
    let limit = recent_limit(params.limit);
    Ok(Json(state.engine.recent_samples(limit).await?))
}

async fn get_settings(State(state): State<AppState>) -> ApiResult<Settings> {
    Ok(Json(state.engine.load_settings().await?))
}

pub fn check_settings(settings: &Settings) -> Result<(), ApiError> {
    if settings.gas_per_pulse <= Decimal::ZERO {
        return Err(ApiError::BadRequest("gas_per_pulse must be positive".to_string()));
    }
    if settings.notify.max_count < 0 {
        return Err(ApiError::BadRequest("notify max_count must not be negative".to_string()));
    }
    if settings.notify.interval_hours < Decimal::ZERO {
        return Err(ApiError::BadRequest(
            "notify interval_hours must not be negative".to_string(),
        ));
    }
    Ok(())
}

async fn put_settings(
    State(state): State<AppState>,
    body: Result<Json<Settings>, JsonRejection>,
) -> ApiResult<Settings> {
    let Json(settings) = body?;
    check_settings(&settings)?;
    state.engine.save_settings(&settings).await?;
    tracing::info!("settings updated");
    Ok(Json(state.engine.load_settings().await?))
}

async fn post_sample(
    State(state): State<AppState>,
    body: Result<Json<IncomingSample>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(incoming) = body?;
    let env = validate_sample(Envelope::now(incoming.into_sample(SystemTime::now())))
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    state.engine.record_sample(env.payload).await?;
    Ok(StatusCode::CREATED)
}

async fn post_calibrate(
    State(state): State<AppState>,
    body: Result<Json<CalibrationRequest>, JsonRejection>,
) -> ApiResult<CalibrationSummary> {
    let Json(request) = body?;
    Ok(Json(state.engine.calibrate(&request).await?))
}

async fn post_notify_test(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let settings = state.engine.load_settings().await?;
    state
        .engine
        .send_test_notification(&settings)
        .await
        .map_err(ApiError::Notify)?;
    Ok(Json(serde_json::json!({ "status": "sent" })))
}
