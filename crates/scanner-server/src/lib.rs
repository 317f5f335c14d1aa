//! Scanner Server - Axum HTTP boundary
//!
//! Exposes the scan/stop/detections/config/status control surface over
//! JSON. Holds no scanning logic of its own; every handler delegates to a
//! shared `scanner_core::ScannerEngine`.

pub mod api;

use axum::http::{header, HeaderValue};
use axum::Router;
use scanner_core::ScannerEngine;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;

/// Server-specific settings, separate from `scanner_core::ScannerConfig`.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub port: u16,
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8920,
            bind_addr: "0.0.0.0".to_string(),
        }
    }
}

/// Shared application state accessible from all handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ScannerEngine>,
    pub config: ServerConfig,
    pub log_dir: Option<PathBuf>,
}

impl AppState {
    pub fn new(engine: Arc<ScannerEngine>, config: ServerConfig, log_dir: Option<PathBuf>) -> Self {
        AppState { engine, config, log_dir }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/start_scan", axum::routing::post(api::start_scan))
        .route("/api/v1/stop_scan", axum::routing::post(api::stop_scan))
        .route("/api/v1/detections", axum::routing::get(api::detections))
        .route(
            "/api/v1/config",
            axum::routing::get(api::get_config).patch(api::update_config),
        )
        .route(
            "/api/v1/thresholds",
            axum::routing::get(api::get_thresholds).patch(api::update_thresholds),
        )
        .route("/api/v1/status", axum::routing::get(api::status))
        .route("/api/v1/logs", axum::routing::get(api::get_logs))
        .layer(CorsLayer::permissive())
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .with_state(state)
}

pub async fn start_server(state: AppState) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.config.bind_addr, state.config.port);
    let app = build_router(state);

    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "scanner web server listening");

    axum::serve(listener, app).await?;
    Ok(())
}
