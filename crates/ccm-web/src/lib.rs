//! HTTP entry point for generation syncs.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ccm_core::SyncReport;
use ccm_sync::{orchestrator_from_config, SyncConfig, SyncOrchestrator};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "ccm-web";

#[derive(Clone)]
pub struct AppState {
    /// `None` when the sync backend could not be wired at startup.
    pub sync: Option<Arc<SyncOrchestrator>>,
}

impl AppState {
    pub fn new(sync: SyncOrchestrator) -> Self {
        Self {
            sync: Some(Arc::new(sync)),
        }
    }

    pub fn unavailable() -> Self {
        Self { sync: None }
    }
}

#[derive(Debug, Deserialize)]
pub struct SyncRequest {
    pub fecha_generacion: String,
    pub drive_folder_id: String,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize)]
pub struct SyncResponse {
    pub success: bool,
    pub report: SyncReport,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/extraccion_generacion", post(extraccion_generacion_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("CCM_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let config = SyncConfig::from_env();
    let state = match orchestrator_from_config(&config).await {
        Ok(orchestrator) => AppState::new(orchestrator),
        Err(err) => {
            error!(error = %err, "sync backend unavailable; serving without it");
            AppState::unavailable()
        }
    };
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn extraccion_generacion_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SyncRequest>,
) -> Response {
    let Some(sync) = state.sync.as_ref() else {
        return server_error("database sync service is not initialized");
    };

    let report = sync
        .sync(&payload.fecha_generacion, &payload.drive_folder_id, payload.force)
        .await;
    info!(
        stage = "extraccion_generacion",
        fecha_generacion = %payload.fecha_generacion,
        drive_folder_id = %payload.drive_folder_id,
        force = payload.force,
        errors = report.errors.len(),
        "generation extraction finished"
    );
    Json(SyncResponse {
        success: true,
        report,
    })
    .into_response()
}

fn server_error(detail: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "success": false, "detail": detail })),
    )
        .into_response()
}
