//! Modbus RTU serial transport
//!
//! One transport instance owns its serial port exclusively. A process-wide
//! claim table rejects a second concurrent open of the same port path with
//! `PortBusy` instead of letting two drivers interleave frames on one bus.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{DataBits, Parity as SerialParity, SerialStream, StopBits};
use tracing::{debug, warn};

use super::traits::{Transport, TransportError};
use crate::model::Parity;
use crate::util::hex::format_hex;

/// Ports currently claimed by a live transport in this process
static PORT_CLAIMS: LazyLock<Mutex<HashSet<String>>> = LazyLock::new(|| Mutex::new(HashSet::new()));

/// Serial line parameters
#[derive(Debug, Clone)]
pub struct SerialSettings {
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
}

impl SerialSettings {
    fn data_bits(&self) -> Result<DataBits, TransportError> {
        match self.data_bits {
            5 => Ok(DataBits::Five),
            6 => Ok(DataBits::Six),
            7 => Ok(DataBits::Seven),
            8 => Ok(DataBits::Eight),
            other => Err(TransportError::Io(format!(
                "unsupported data bits: {other}"
            ))),
        }
    }

    fn stop_bits(&self) -> Result<StopBits, TransportError> {
        match self.stop_bits {
            1 => Ok(StopBits::One),
            2 => Ok(StopBits::Two),
            other => Err(TransportError::Io(format!(
                "unsupported stop bits: {other}"
            ))),
        }
    }

    fn parity(&self) -> SerialParity {
        match self.parity {
            Parity::None => SerialParity::None,
            Parity::Even => SerialParity::Even,
            Parity::Odd => SerialParity::Odd,
        }
    }
}

/// RTU transport over one serial port
#[derive(Debug)]
pub struct SerialTransport {
    settings: SerialSettings,
    stream: Option<SerialStream>,
    claimed: bool,
    endpoint: String,
}

impl SerialTransport {
    pub fn new(settings: SerialSettings) -> Self {
        let endpoint = format!("rtu://{}", settings.port);
        Self {
            settings,
            stream: None,
            claimed: false,
            endpoint,
        }
    }

    fn classify_open_error(err: &tokio_serial::Error) -> TransportError {
        use tokio_serial::ErrorKind;
        match &err.kind {
            ErrorKind::NoDevice => TransportError::PortMissing,
            ErrorKind::Io(kind) => match kind {
                std::io::ErrorKind::NotFound => TransportError::PortMissing,
                std::io::ErrorKind::PermissionDenied => TransportError::PermissionDenied,
                std::io::ErrorKind::AddrInUse | std::io::ErrorKind::WouldBlock => {
                    TransportError::PortBusy
                },
                _ => TransportError::Io(err.to_string()),
            },
            _ => TransportError::Io(err.to_string()),
        }
    }

    fn release_claim(&mut self) {
        if self.claimed {
            PORT_CLAIMS.lock().remove(&self.settings.port);
            self.claimed = false;
        }
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.release_claim();
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn transport_type(&self) -> &'static str {
        "rtu"
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.stream.is_some() {
            return Ok(());
        }

        if !PORT_CLAIMS.lock().insert(self.settings.port.clone()) {
            warn!(endpoint = %self.endpoint, "Serial port already claimed in-process");
            return Err(TransportError::PortBusy);
        }
        self.claimed = true;

        let builder = tokio_serial::new(&self.settings.port, self.settings.baud_rate)
            .data_bits(self.settings.data_bits()?)
            .stop_bits(self.settings.stop_bits()?)
            .parity(self.settings.parity())
            .timeout(Duration::from_millis(50));

        match SerialStream::open(&builder) {
            Ok(stream) => {
                self.stream = Some(stream);
                debug!(endpoint = %self.endpoint, baud = self.settings.baud_rate, "Serial transport opened");
                Ok(())
            },
            Err(e) => {
                self.release_claim();
                let kind = Self::classify_open_error(&e);
                warn!(endpoint = %self.endpoint, "Serial open failed: {e}");
                Err(kind)
            },
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.stream = None;
        self.release_claim();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;

        match stream.write_all(data).await {
            Ok(()) => {
                debug!(endpoint = %self.endpoint, direction = "send", frame = %format_hex(data), "Raw ADU");
                Ok(())
            },
            Err(e) => {
                self.stream = None;
                self.release_claim();
                Err(TransportError::Io(e.to_string()))
            },
        }
    }

    async fn receive_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;

        let mut filled = 0;
        while filled < buf.len() {
            match stream.read(&mut buf[filled..]).await {
                Ok(0) => {
                    // Serial reads returning zero repeatedly means the device
                    // vanished; surface as an I/O failure, not a timeout.
                    self.stream = None;
                    self.release_claim();
                    return Err(TransportError::Io("serial port returned EOF".to_string()));
                },
                Ok(n) => filled += n,
                Err(e) => {
                    self.stream = None;
                    self.release_claim();
                    return Err(TransportError::Io(e.to_string()));
                },
            }
        }

        debug!(endpoint = %self.endpoint, direction = "recv", frame = %format_hex(buf), "Raw ADU");
        Ok(())
    }
}
