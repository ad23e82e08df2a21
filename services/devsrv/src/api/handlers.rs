//! HTTP handlers wrapping the polling registry
//!
//! Status code convention: failures attributable to the device itself come
//! back as HTTP 200 with `success: false` so the UI always receives the
//! structured body; 400 covers malformed ids, disabled devices and bad
//! definitions; 404 unknown ids; 500 faults of the gateway itself.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use std::time::Duration;

use super::models::*;
use super::routes::AppState;
use crate::error::DevSrvError;
use crate::model::Snapshot;

/// 24 hex characters in the current deployment
fn valid_device_id(id: &str) -> bool {
    id.len() == 24 && id.bytes().all(|b| b.is_ascii_hexdigit())
}

async fn device_info(state: &AppState, id: &str) -> DeviceInfo {
    match state.registry.device_summary(id).await {
        Some((name, connection_type, address)) => DeviceInfo {
            id: id.to_string(),
            name: Some(name),
            connection_type: Some(connection_type),
            address: Some(address),
        },
        None => DeviceInfo::bare(id),
    }
}

/// Translate a service error into the conventional status code and body
async fn error_response(state: &AppState, id: &str, error: &DevSrvError) -> Response {
    let info = device_info(state, id).await;
    let error_type = ErrorType::from_service(error);

    let status = match error {
        DevSrvError::DeviceNotFound(_) => StatusCode::NOT_FOUND,
        DevSrvError::DeviceDisabled(_)
        | DevSrvError::InvalidDefinition(_)
        | DevSrvError::InvalidParameter(_) => StatusCode::BAD_REQUEST,
        DevSrvError::Repository(_) | DevSrvError::Internal(_) | DevSrvError::Config(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        },
        DevSrvError::PollerLimit(_) => StatusCode::INTERNAL_SERVER_ERROR,
        // Device-attributable failures keep HTTP 200
        DevSrvError::Transport(_) | DevSrvError::Cancelled => StatusCode::OK,
    };

    let body = ErrorBody::new(
        user_message(error),
        error.to_string(),
        error_type,
        info,
    );
    (status, Json(body)).into_response()
}

fn user_message(error: &DevSrvError) -> String {
    match error {
        DevSrvError::DeviceNotFound(id) => format!("Device {id} is not configured"),
        DevSrvError::DeviceDisabled(_) => "Device is disabled".to_string(),
        DevSrvError::InvalidDefinition(detail) => format!("Device definition is invalid: {detail}"),
        DevSrvError::InvalidParameter(detail) => format!("Invalid request: {detail}"),
        DevSrvError::Transport(kind) => format!("Communication with the device failed: {kind}"),
        DevSrvError::Cancelled => "Operation was cancelled".to_string(),
        other => format!("Request failed: {other}"),
    }
}

fn invalid_id_response(id: &str) -> Response {
    let body = ErrorBody::new(
        "Device id must be 24 hex characters".to_string(),
        format!("invalid device id: {id}"),
        ErrorType::UnknownError,
        DeviceInfo::bare(id),
    );
    (StatusCode::BAD_REQUEST, Json(body)).into_response()
}

/// `GET /health`
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// `GET /status`
pub async fn service_status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok".to_string(),
        registry: state.registry.registry_status(),
    })
}

/// `POST /devices/{id}/test`
pub async fn test_device(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if !valid_device_id(&id) {
        return invalid_id_response(&id);
    }

    match state.registry.test_connection(&id).await {
        Ok(outcome) => {
            let info = device_info(&state, &id).await;
            let body = TestResponse {
                success: outcome.success,
                message: outcome.message,
                error_type: outcome.error.as_ref().map(ErrorType::from_transport),
                device_info: info,
                timestamp: Utc::now(),
                status: if outcome.success { "CONNECTED" } else { "ERROR" }.to_string(),
            };
            (StatusCode::OK, Json(body)).into_response()
        },
        Err(error) => error_response(&state, &id, &error).await,
    }
}

/// `GET /devices/{id}/read`
pub async fn read_device(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if !valid_device_id(&id) {
        return invalid_id_response(&id);
    }

    match state.registry.read_once(&id).await {
        Ok(snapshot) => {
            let body = ReadResponse {
                device_id: snapshot.device_id.clone(),
                device_name: snapshot.device_name.clone(),
                timestamp: snapshot.timestamp,
                readings: snapshot.values.clone(),
            };
            (StatusCode::OK, Json(body)).into_response()
        },
        Err(error) => error_response(&state, &id, &error).await,
    }
}

/// `POST /devices/{id}/polling/start`
pub async fn start_polling(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<StartPollingRequest>>,
) -> Response {
    if !valid_device_id(&id) {
        return invalid_id_response(&id);
    }

    let interval = body
        .and_then(|Json(request)| request.interval_ms)
        .map(Duration::from_millis);

    match state.registry.start(&id, interval).await {
        Ok(()) => {
            let status = state.registry.status(&id);
            let body = StartPollingResponse {
                success: true,
                message: "Polling started".to_string(),
                device_id: id,
                interval_ms: status.interval_ms,
            };
            (StatusCode::OK, Json(body)).into_response()
        },
        // Unreachable devices land here as Transport errors: body with
        // success=false, HTTP 200 per the status-code convention
        Err(error) => error_response(&state, &id, &error).await,
    }
}

/// `POST /devices/{id}/polling/stop`
pub async fn stop_polling(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if !valid_device_id(&id) {
        return invalid_id_response(&id);
    }

    match state.registry.stop(&id).await {
        Ok(()) => {
            let body = StopPollingResponse {
                success: true,
                message: "Polling stopped".to_string(),
                device_id: id,
            };
            (StatusCode::OK, Json(body)).into_response()
        },
        Err(error) => error_response(&state, &id, &error).await,
    }
}

/// `GET /devices/{id}/data?forceRefresh=bool`
pub async fn device_data(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<DataQuery>,
) -> Response {
    if !valid_device_id(&id) {
        return invalid_id_response(&id);
    }

    match state.registry.snapshot(&id, query.force_refresh).await {
        Ok(snapshot) => (StatusCode::OK, Json(data_response(&snapshot))).into_response(),
        Err(error) => error_response(&state, &id, &error).await,
    }
}

fn data_response(snapshot: &Snapshot) -> DataResponse {
    let failed = snapshot
        .values
        .iter()
        .filter(|reading| reading.value.is_none())
        .count();

    DataResponse {
        // A true success carries no unreadable values
        success: failed == 0,
        device_id: snapshot.device_id.clone(),
        device_name: snapshot.device_name.clone(),
        timestamp: snapshot.timestamp,
        readings: snapshot.values.clone(),
        has_data: snapshot.has_data,
        stale: snapshot.stale,
        message: (failed > 0).then(|| {
            format!("{failed} of {} readings are unreadable", snapshot.values.len())
        }),
    }
}

/// `POST /devices/{id}/control`
pub async fn control_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<ControlRequest>>,
) -> Response {
    if !valid_device_id(&id) {
        return invalid_id_response(&id);
    }

    let Some(Json(request)) = body else {
        let error = DevSrvError::InvalidParameter("control body is required".to_string());
        return error_response(&state, &id, &error).await;
    };

    match state.registry.write(&id, &request.parameters).await {
        Ok(report) => {
            let succeeded = report.results.iter().filter(|result| result.success).count();
            let info = device_info(&state, &id).await;
            let body = ControlResponse {
                success: report.success,
                device_id: id,
                device_name: info.name.unwrap_or_default(),
                timestamp: Utc::now(),
                summary: format!("{succeeded}/{} parameters written", report.results.len()),
                results: report.results,
            };
            (StatusCode::OK, Json(body)).into_response()
        },
        Err(error @ DevSrvError::Transport(_)) => {
            // Whole-operation wire failure on the control path
            let info = device_info(&state, &id).await;
            let body = ErrorBody::new(
                user_message(&error),
                error.to_string(),
                ErrorType::ControlError,
                info,
            );
            (StatusCode::OK, Json(body)).into_response()
        },
        Err(error) => error_response(&state, &id, &error).await,
    }
}
