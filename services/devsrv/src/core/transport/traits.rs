//! Transport layer contract
//!
//! A transport moves raw ADU bytes to and from one physical endpoint (a TCP
//! socket or a serial port). Exactly one exchange may be in flight per
//! transport instance; the session manager's per-endpoint mutex enforces
//! this, the transport itself does not lock.
//!
//! Error classification happens here, at the point the OS error is first
//! observed, and is carried by a closed sum type. Callers decide retry
//! versus abort by matching on the kind; matching on message text is
//! forbidden throughout the service.

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Modbus exception codes reported by a slave
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalAddress,
    IllegalValue,
    DeviceFailure,
    Acknowledge,
    DeviceBusy,
    MemoryParityError,
    GatewayPathUnavailable,
    GatewayTargetFailed,
    Other(u8),
}

impl ExceptionCode {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => ExceptionCode::IllegalFunction,
            0x02 => ExceptionCode::IllegalAddress,
            0x03 => ExceptionCode::IllegalValue,
            0x04 => ExceptionCode::DeviceFailure,
            0x05 => ExceptionCode::Acknowledge,
            0x06 => ExceptionCode::DeviceBusy,
            0x08 => ExceptionCode::MemoryParityError,
            0x0A => ExceptionCode::GatewayPathUnavailable,
            0x0B => ExceptionCode::GatewayTargetFailed,
            other => ExceptionCode::Other(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            ExceptionCode::IllegalFunction => 0x01,
            ExceptionCode::IllegalAddress => 0x02,
            ExceptionCode::IllegalValue => 0x03,
            ExceptionCode::DeviceFailure => 0x04,
            ExceptionCode::Acknowledge => 0x05,
            ExceptionCode::DeviceBusy => 0x06,
            ExceptionCode::MemoryParityError => 0x08,
            ExceptionCode::GatewayPathUnavailable => 0x0A,
            ExceptionCode::GatewayTargetFailed => 0x0B,
            ExceptionCode::Other(code) => *code,
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExceptionCode::IllegalFunction => "ILLEGAL_FUNCTION",
            ExceptionCode::IllegalAddress => "ILLEGAL_ADDRESS",
            ExceptionCode::IllegalValue => "ILLEGAL_VALUE",
            ExceptionCode::DeviceFailure => "DEVICE_FAILURE",
            ExceptionCode::Acknowledge => "ACKNOWLEDGE",
            ExceptionCode::DeviceBusy => "DEVICE_BUSY",
            ExceptionCode::MemoryParityError => "MEMORY_PARITY_ERROR",
            ExceptionCode::GatewayPathUnavailable => "GATEWAY_PATH_UNAVAILABLE",
            ExceptionCode::GatewayTargetFailed => "GATEWAY_TARGET_FAILED",
            ExceptionCode::Other(_) => "EXCEPTION",
        };
        write!(f, "{} (0x{:02X})", name, self.code())
    }
}

/// Transport layer error kinds
///
/// Part of the public contract: the retry and health policies in the session
/// manager and poller are keyed on these variants.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// TCP peer rejected the connection
    #[error("Connection refused by peer")]
    ConnRefused,

    /// No response within the request timeout
    #[error("No response within {0:?}")]
    Timeout(Duration),

    /// Serial port is held by another owner
    #[error("Serial port busy")]
    PortBusy,

    /// Serial device file absent
    #[error("Serial port not found")]
    PortMissing,

    /// Serial device file exists but is not accessible
    #[error("Permission denied opening serial port")]
    PermissionDenied,

    /// Malformed frame: bad CRC, bad length, mismatched echo
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Slave reported a Modbus exception
    #[error("Modbus exception: {0}")]
    ModbusException(ExceptionCode),

    /// TCP EOF mid-exchange
    #[error("Connection closed by peer")]
    ClosedByPeer,

    /// Other I/O failure
    #[error("IO error: {0}")]
    Io(String),

    /// Exchange attempted on a closed transport
    #[error("Not connected")]
    NotConnected,
}

impl TransportError {
    /// Kinds worth retrying within the same tick (up to the retry budget)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout(_) | TransportError::Protocol(_)
        )
    }

    /// Kinds that mark the underlying session unhealthy
    pub fn marks_unhealthy(&self) -> bool {
        matches!(
            self,
            TransportError::ConnRefused
                | TransportError::Timeout(_)
                | TransportError::ClosedByPeer
                | TransportError::Io(_)
                | TransportError::PortMissing
                | TransportError::NotConnected
        )
    }

    /// Classify a TCP-side I/O failure observed during an exchange
    pub fn from_tcp_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionRefused => TransportError::ConnRefused,
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => TransportError::ClosedByPeer,
            ErrorKind::TimedOut => TransportError::Timeout(Duration::ZERO),
            _ => TransportError::Io(err.to_string()),
        }
    }
}

/// Byte-level transport over one physical endpoint
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// "tcp", "rtu" or "mock"
    fn transport_type(&self) -> &'static str;

    /// Endpoint label for logs and diagnostics
    fn endpoint(&self) -> &str;

    /// Open the socket or port
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Close the endpoint; idempotent
    async fn close(&mut self) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    /// Write one complete ADU
    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Read exactly `buf.len()` response bytes
    ///
    /// Blocks until filled or the connection fails; the caller bounds the
    /// whole exchange with its request timeout.
    async fn receive_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError>;
}
