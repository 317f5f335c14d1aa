//! REST API handlers for the scanner control surface.
//!
//! All endpoints are under `/api/v1/` and return JSON.

use crate::AppState;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use scanner_core::config::{ResourceThresholdsUpdate, ScannerConfigUpdate};
use scanner_core::{Detection, FrequencyEntry, ResourceThresholds, ScanOutcome, ScannerConfig, StopOutcome};
use serde::{Deserialize, Serialize};

type ApiError = (StatusCode, String);

/// POST /api/v1/start_scan
#[derive(Deserialize)]
pub struct StartScanRequest {
    #[serde(default)]
    pub frequency_groups: Vec<String>,
    #[serde(default)]
    pub custom_frequencies: Vec<FrequencyEntry>,
    pub dwell_seconds: Option<f64>,
    pub squelch_db: Option<f64>,
}

#[derive(Serialize)]
pub struct StartScanResponse {
    pub status: &'static str,
}

pub async fn start_scan(
    State(state): State<AppState>,
    Json(req): Json<StartScanRequest>,
) -> Result<Json<StartScanResponse>, ApiError> {
    for entry in &req.custom_frequencies {
        entry
            .validate()
            .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    }

    match state.engine.start_scan(
        &req.frequency_groups,
        req.custom_frequencies,
        req.dwell_seconds,
        req.squelch_db,
    ) {
        ScanOutcome::Started => Ok(Json(StartScanResponse { status: "started" })),
        ScanOutcome::AlreadyRunning => Err((StatusCode::CONFLICT, "scan already running".to_string())),
        ScanOutcome::NoFrequencies => Err((
            StatusCode::BAD_REQUEST,
            "no frequencies resolved from groups or custom_frequencies".to_string(),
        )),
    }
}

/// POST /api/v1/stop_scan
#[derive(Serialize)]
pub struct StopScanResponse {
    pub status: &'static str,
}

pub async fn stop_scan(State(state): State<AppState>) -> Json<StopScanResponse> {
    let status = match state.engine.stop_scan().await {
        StopOutcome::Stopped => "stopped",
        StopOutcome::NotRunning => "not_running",
    };
    Json(StopScanResponse { status })
}

/// GET /api/v1/detections
pub async fn detections(State(state): State<AppState>) -> Json<Vec<Detection>> {
    Json(state.engine.get_detections())
}

/// GET /api/v1/config
pub async fn get_config(State(state): State<AppState>) -> Json<ScannerConfig> {
    Json(state.engine.config())
}

/// PATCH /api/v1/config
pub async fn update_config(
    State(state): State<AppState>,
    Json(update): Json<ScannerConfigUpdate>,
) -> Result<Json<ScannerConfig>, ApiError> {
    state
        .engine
        .update_config(&update)
        .map(Json)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))
}

/// GET /api/v1/thresholds
pub async fn get_thresholds(State(state): State<AppState>) -> Json<ResourceThresholds> {
    Json(state.engine.thresholds())
}

/// PATCH /api/v1/thresholds
pub async fn update_thresholds(
    State(state): State<AppState>,
    Json(update): Json<ResourceThresholdsUpdate>,
) -> Result<Json<ResourceThresholds>, ApiError> {
    state
        .engine
        .update_thresholds(&update)
        .map(Json)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))
}

/// GET /api/v1/status
#[derive(Serialize)]
pub struct StatusResponse {
    pub version: String,
    pub scan_active: bool,
    pub throttle_active: bool,
    pub throttle_reason: String,
    pub usb_errors: u64,
    pub active_detections: usize,
    pub total_recordings: u64,
    pub cpu_pct: f64,
    pub memory_pct: f64,
    pub io_wait_pct: f64,
    pub disk_free_bytes: u64,
    pub recordings_dir_bytes: u64,
    pub ip_address: String,
}

pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let throttle = state.engine.throttle_snapshot();
    let usage = state.engine.resource_usage();
    let ip_address = local_ip_address::local_ip()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|_| "localhost".to_string());

    Json(StatusResponse {
        version: scanner_core::VERSION.to_string(),
        scan_active: state.engine.is_running(),
        throttle_active: throttle.active,
        throttle_reason: throttle.reason,
        usb_errors: state.engine.usb_error_count(),
        active_detections: state.engine.get_detections().len(),
        total_recordings: state.engine.total_recordings(),
        cpu_pct: usage.cpu_pct,
        memory_pct: usage.memory_pct,
        io_wait_pct: usage.io_wait_pct,
        disk_free_bytes: usage.disk_free_bytes,
        recordings_dir_bytes: usage.recordings_dir_bytes,
        ip_address,
    })
}

/// Query parameters for GET /api/v1/logs
#[derive(Deserialize)]
pub struct LogsQuery {
    pub tail: Option<usize>,
    pub filter: Option<String>,
}

/// GET /api/v1/logs — tails the most recently modified log file, matching
/// the read-only diagnostic access the filesystem layout grants.
pub async fn get_logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> Result<String, ApiError> {
    let log_dir = state
        .log_dir
        .as_ref()
        .ok_or((StatusCode::NOT_FOUND, "logging not configured".to_string()))?;

    let mut entries: Vec<_> = std::fs::read_dir(log_dir)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().map(|ext| ext == "log").unwrap_or(false))
        .collect();
    entries.sort_by_key(|e| std::cmp::Reverse(e.metadata().ok().and_then(|m| m.modified().ok())));

    let log_file = entries
        .first()
        .ok_or((StatusCode::NOT_FOUND, "no log files found".to_string()))?;

    let content = std::fs::read_to_string(log_file.path())
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let tail = query.tail.unwrap_or(200);
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(tail);
    let mut result: Vec<&str> = lines[start..].to_vec();

    if let Some(ref filter) = query.filter {
        result.retain(|line| line.contains(filter.as_str()));
    }

    Ok(result.join("\n"))
}
