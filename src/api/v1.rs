use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::error::ApiError;
use super::ws;
use crate::controller::AppState;
use crate::domain::load_devices;
use crate::ingest::MessageIngestor;
use crate::repo::{HistoryPoint, HistoryWindow};
use crate::schema::ReconcileReport;

pub const DEFAULT_HISTORY_MINUTES: u32 = 60;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ingest", post(ingest))
        .route("/history", get(history))
        .route(
            "/devices/:name/table",
            post(create_device_table).delete(delete_device_table),
        )
        .route("/devices/reconcile", post(reconcile_devices))
        .route("/ws", get(ws::ws_handler))
}

#[derive(Debug, Serialize)]
pub struct IngestAccepted {
    pub queued: bool,
    pub entries: usize,
}

/// POST /api/v1/ingest - queue one bus message for processing
pub async fn ingest(State(st): State<AppState>, body: Bytes) -> Result<impl IntoResponse, ApiError> {
    let message = MessageIngestor::decode(&body)?;
    let entries = message.data.len();
    st.ingest.enqueue(message)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(IngestAccepted {
            queued: true,
            entries,
        }),
    ))
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct HistoryQuery {
    #[validate(range(min = 1, max = 525_600))]
    pub minutes: Option<u32>,
    #[validate(range(min = 1, max = 8_760))]
    pub hours: Option<u32>,
}

impl HistoryQuery {
    pub fn window(&self) -> Result<HistoryWindow, ApiError> {
        match (self.minutes, self.hours) {
            (Some(_), Some(_)) => Err(ApiError::BadRequest(
                "use either minutes or hours, not both".to_string(),
            )),
            (Some(m), None) => Ok(HistoryWindow::Minutes(m)),
            (None, Some(h)) => Ok(HistoryWindow::Hours(h)),
            (None, None) => Ok(HistoryWindow::Minutes(DEFAULT_HISTORY_MINUTES)),
        }
    }
}

/// GET /api/v1/history?minutes=N | ?hours=N - aggregate history, oldest first
pub async fn history(
    State(st): State<AppState>,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<Vec<HistoryPoint>>, ApiError> {
    q.validate()?;
    let window = q.window()?;
    Ok(Json(st.store.history(window).await?))
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateTableRequest {
    #[validate(length(min = 1, max = 128))]
    pub reference: String,
}

#[derive(Debug, Serialize)]
pub struct DeviceTableResponse {
    pub device: String,
    pub table: String,
}

/// POST /api/v1/devices/:name/table - provision a device table (idempotent)
pub async fn create_device_table(
    State(st): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<CreateTableRequest>,
) -> Result<impl IntoResponse, ApiError> {
    req.validate()?;
    let table = st.schema.create_table(&name, &req.reference).await?;
    Ok((
        StatusCode::CREATED,
        Json(DeviceTableResponse {
            device: name,
            table,
        }),
    ))
}

/// DELETE /api/v1/devices/:name/table
pub async fn delete_device_table(
    State(st): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    if st.schema.delete_table(&name).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("no table registered for device '{}'", name)))
    }
}

/// POST /api/v1/devices/reconcile - re-read the device list and provision missing tables
pub async fn reconcile_devices(State(st): State<AppState>) -> Result<Json<ReconcileReport>, ApiError> {
    let devices = load_devices(&st.cfg.devices.config_file)?;
    Ok(Json(st.schema.reconcile(&devices).await))
}
