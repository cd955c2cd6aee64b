//! Dashboard API route handlers.
//!
//! All endpoints return JSON. State is shared via `Arc<DashboardState>`.
//! Amounts are rendered as decimal strings in whole tokens.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, warn};

use crate::engine::controller::ReallocationReport;
use crate::engine::keeper::CycleReport;
use crate::engine::LiquidityManager;
use crate::math;
use crate::oracle::format_price;
use crate::storage::StateStore;
use crate::types::EngineError;

/// Cycles kept in memory for `/api/cycles`.
const CYCLE_LOG_LIMIT: usize = 100;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Shared state accessible by all route handlers.
pub struct DashboardState {
    pub manager: Arc<LiquidityManager>,
    pub cycle_log: RwLock<Vec<CycleLogEntry>>,
    pub started_at: DateTime<Utc>,
    /// Where mutating requests save state. `None` keeps everything in memory.
    pub store: Option<StateStore>,
}

impl DashboardState {
    pub fn new(manager: Arc<LiquidityManager>) -> Self {
        Self {
            manager,
            cycle_log: RwLock::new(Vec::new()),
            started_at: Utc::now(),
            store: None,
        }
    }

    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    pub async fn record_cycle(&self, report: &CycleReport) {
        self.push(CycleLogEntry {
            cycle_number: report.cycle_number,
            timestamp: report.finished_at.to_rfc3339(),
            windows_closed: report.windows_closed(),
            failed_updates: report.failed_updates(),
            outcome: serde_json::to_value(&report.reallocation.outcome).ok(),
            total_value: Some(math::format_amount(report.total_value)),
            error: None,
        })
        .await;
    }

    pub async fn record_failure(&self, cycle_number: u64, error: &EngineError) {
        self.push(CycleLogEntry {
            cycle_number,
            timestamp: Utc::now().to_rfc3339(),
            windows_closed: 0,
            failed_updates: 0,
            outcome: None,
            total_value: None,
            error: Some(error.to_string()),
        })
        .await;
    }

    async fn push(&self, entry: CycleLogEntry) {
        let mut log = self.cycle_log.write().await;
        log.push(entry);
        let excess = log.len().saturating_sub(CYCLE_LOG_LIMIT);
        log.drain(..excess);
    }
}

pub type AppState = Arc<DashboardState>;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub allocation: String,
    pub active_pair: Option<String>,
    pub idle: String,
    pub position_liquidity: Option<String>,
    pub residuals: usize,
    pub total_value: String,
    pub total_supply: String,
    pub share_price: String,
    pub cycles: usize,
    pub uptime_secs: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PairResponse {
    pub index: usize,
    pub address: String,
    pub token0: String,
    pub token1: String,
    pub reserve0: Option<String>,
    pub reserve1: Option<String>,
    pub twap: Option<String>,
    pub growth: Option<String>,
    pub rating: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleLogEntry {
    pub cycle_number: u64,
    pub timestamp: String,
    pub windows_closed: usize,
    pub failed_updates: usize,
    pub outcome: Option<serde_json::Value>,
    pub total_value: Option<String>,
    pub error: Option<String>,
}

/// Engine errors as HTTP responses.
pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::ReentrantCall { .. } => StatusCode::CONFLICT,
            EngineError::UnknownPair(_) => StatusCode::NOT_FOUND,
            EngineError::StalePair { .. }
            | EngineError::ObservationNotFresh { .. }
            | EngineError::NoLiquidity(_)
            | EngineError::NoRoute { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::Amm(_)
            | EngineError::Ledger(_)
            | EngineError::DeadlineExceeded { .. }
            | EngineError::SlippageExceeded { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        warn!(status = status.as_u16(), error = %self.0, "API request failed");
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// GET /health
pub async fn health() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

/// GET /api/status
pub async fn get_status(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let status = state.manager.status().await?;
    let cycles = state.cycle_log.read().await.len();

    Ok(Json(StatusResponse {
        allocation: status.allocation.to_string(),
        active_pair: status.active_pair.map(|(a, b)| format!("{a}/{b}")),
        idle: math::format_amount(status.idle),
        position_liquidity: status.position.map(|p| math::format_amount(p.liquidity)),
        residuals: status.residuals.len(),
        total_value: math::format_amount(status.total_value),
        total_supply: math::format_amount(status.total_supply),
        share_price: math::format_amount(status.share_price),
        cycles,
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
    }))
}

/// GET /api/pairs
pub async fn get_pairs(State(state): State<AppState>) -> Result<Json<Vec<PairResponse>>, ApiError> {
    let reports = state.manager.pair_reports().await?;
    let pairs = reports
        .into_iter()
        .map(|r| PairResponse {
            index: r.pair.index,
            address: r.pair.address.to_string(),
            token0: r.pair.token0.to_string(),
            token1: r.pair.token1.to_string(),
            reserve0: r.reserves.map(|x| math::format_amount(x.reserve0)),
            reserve1: r.reserves.map(|x| math::format_amount(x.reserve1)),
            twap: r.twap.map(format_price),
            growth: r.rating.as_ref().map(|x| format_price(x.growth)),
            rating: r.rating.as_ref().map(|x| x.rating.to_string()),
            status: r.status,
        })
        .collect();
    Ok(Json(pairs))
}

/// GET /api/cycles
pub async fn get_cycles(State(state): State<AppState>) -> Json<Vec<CycleLogEntry>> {
    Json(state.cycle_log.read().await.clone())
}

/// POST /api/reallocate
///
/// State is saved whether or not the reallocation succeeded: a failed one
/// may still have committed its withdrawal.
pub async fn post_reallocate(State(state): State<AppState>) -> Result<Json<ReallocationReport>, ApiError> {
    let result = state.manager.reallocate_liquidity().await;
    if let Some(store) = &state.store {
        if let Err(e) = store.persist(&state.manager).await {
            error!(path = store.path(), error = %e, "Failed to save state after reallocation");
            return Err(ApiError(EngineError::Storage(e.to_string())));
        }
    }
    Ok(Json(result?))
}
