//! API data transfer objects
//!
//! Shapes are stable: a running dashboard consumes them. Device-attributable
//! failures travel in a 200 body with `success: false` and an `errorType`
//! from the fixed vocabulary below.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::registry::RegistryStatus;
use crate::core::transport::{ExceptionCode, TransportError};
use crate::core::WriteResult;
use crate::error::DevSrvError;
use crate::model::Reading;

/// Closed error vocabulary consumed by the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorType {
    ConnectionRefused,
    ConnectionTimeout,
    PortNotFound,
    PermissionDenied,
    PortBusy,
    DeviceNoResponse,
    IllegalFunction,
    IllegalAddress,
    ControlError,
    ServerError,
    UnknownError,
}

impl ErrorType {
    /// Map a classified transport failure into the UI vocabulary
    pub fn from_transport(error: &TransportError) -> Self {
        match error {
            TransportError::ConnRefused => ErrorType::ConnectionRefused,
            TransportError::Timeout(_) => ErrorType::ConnectionTimeout,
            TransportError::PortMissing => ErrorType::PortNotFound,
            TransportError::PermissionDenied => ErrorType::PermissionDenied,
            TransportError::PortBusy => ErrorType::PortBusy,
            TransportError::ClosedByPeer
            | TransportError::Protocol(_)
            | TransportError::NotConnected => ErrorType::DeviceNoResponse,
            TransportError::ModbusException(code) => match code {
                ExceptionCode::IllegalFunction => ErrorType::IllegalFunction,
                ExceptionCode::IllegalAddress => ErrorType::IllegalAddress,
                _ => ErrorType::UnknownError,
            },
            TransportError::Io(_) => ErrorType::UnknownError,
        }
    }

    pub fn from_service(error: &DevSrvError) -> Self {
        match error {
            DevSrvError::Transport(kind) => Self::from_transport(kind),
            DevSrvError::Internal(_) | DevSrvError::Repository(_) | DevSrvError::Config(_) => {
                ErrorType::ServerError
            },
            _ => ErrorType::UnknownError,
        }
    }

    /// Operator hint attached to error payloads
    pub fn troubleshooting(&self) -> Option<&'static str> {
        match self {
            ErrorType::ConnectionRefused => {
                Some("Check that the device is powered and listening on the configured IP and port")
            },
            ErrorType::ConnectionTimeout => {
                Some("Check network reachability and consider raising the request timeout")
            },
            ErrorType::PortNotFound => {
                Some("Check that the serial adapter is plugged in and the configured port path exists")
            },
            ErrorType::PermissionDenied => {
                Some("Grant the gateway user access to the serial device (dialout group on Linux)")
            },
            ErrorType::PortBusy => {
                Some("Another process holds the serial port; stop it or use a different port")
            },
            ErrorType::DeviceNoResponse => {
                Some("Check the unit id and serial line parameters; the device did not answer correctly")
            },
            ErrorType::IllegalAddress => {
                Some("The device rejected the register address; verify the configured ranges")
            },
            _ => None,
        }
    }
}

/// Device identification attached to error payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl DeviceInfo {
    pub fn bare(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            connection_type: None,
            address: None,
        }
    }
}

/// Standard error payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub success: bool,
    pub message: String,
    pub error: String,
    pub error_type: ErrorType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub troubleshooting: Option<String>,
    pub device_info: DeviceInfo,
    pub timestamp: DateTime<Utc>,
    pub status: String,
}

impl ErrorBody {
    pub fn new(message: String, error: String, error_type: ErrorType, device_info: DeviceInfo) -> Self {
        Self {
            success: false,
            message,
            error,
            error_type,
            troubleshooting: error_type.troubleshooting().map(ToString::to_string),
            device_info,
            timestamp: Utc::now(),
            status: "ERROR".to_string(),
        }
    }
}

/// Body of `POST /devices/{id}/test`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorType>,
    pub device_info: DeviceInfo,
    pub timestamp: DateTime<Utc>,
    /// "CONNECTED" or "ERROR"
    pub status: String,
}

/// Body of `GET /devices/{id}/read`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadResponse {
    pub device_id: String,
    pub device_name: String,
    pub timestamp: DateTime<Utc>,
    pub readings: Vec<Reading>,
}

/// Body of `POST /devices/{id}/polling/start`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPollingRequest {
    pub interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPollingResponse {
    pub success: bool,
    pub message: String,
    pub device_id: String,
    pub interval_ms: u64,
}

/// Body of `POST /devices/{id}/polling/stop`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopPollingResponse {
    pub success: bool,
    pub message: String,
    pub device_id: String,
}

/// Query of `GET /devices/{id}/data`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataQuery {
    #[serde(default)]
    pub force_refresh: bool,
}

/// Body of `GET /devices/{id}/data`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataResponse {
    pub success: bool,
    pub device_id: String,
    pub device_name: String,
    pub timestamp: DateTime<Utc>,
    pub readings: Vec<Reading>,
    pub has_data: bool,
    pub stale: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Body of `POST /devices/{id}/control`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlRequest {
    pub parameters: Vec<crate::core::WriteRequest>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlResponse {
    pub success: bool,
    pub device_id: String,
    pub device_name: String,
    pub timestamp: DateTime<Utc>,
    pub summary: String,
    pub results: Vec<WriteResult>,
}

/// Body of `GET /health`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

/// Body of `GET /status`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: String,
    #[serde(flatten)]
    pub registry: RegistryStatus,
}
