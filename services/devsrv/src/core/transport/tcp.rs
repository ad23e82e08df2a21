//! Modbus TCP transport
//!
//! Thin byte pipe over a `TcpStream`. Connection establishment is bounded by
//! the configured timeout; exchange-level deadlines are enforced by the
//! Modbus client that drives this transport.

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::traits::{Transport, TransportError};
use crate::util::hex::format_hex;

/// TCP transport over one `ip:port` endpoint
#[derive(Debug)]
pub struct TcpTransport {
    host: String,
    port: u16,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
    endpoint: String,
}

impl TcpTransport {
    pub fn new(host: &str, port: u16, connect_timeout: Duration) -> Self {
        Self {
            host: host.to_string(),
            port,
            connect_timeout,
            stream: None,
            endpoint: format!("tcp://{host}:{port}"),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn transport_type(&self) -> &'static str {
        "tcp"
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.stream.is_some() {
            return Ok(());
        }

        let addr = format!("{}:{}", self.host, self.port);
        debug!(endpoint = %self.endpoint, "Connecting TCP transport");

        match timeout(self.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    warn!(endpoint = %self.endpoint, "Failed to set TCP_NODELAY: {e}");
                }
                self.stream = Some(stream);
                debug!(endpoint = %self.endpoint, "TCP transport connected");
                Ok(())
            },
            Ok(Err(e)) => {
                warn!(endpoint = %self.endpoint, "TCP connect failed: {e}");
                Err(TransportError::from_tcp_io(&e))
            },
            Err(_) => {
                warn!(endpoint = %self.endpoint, "TCP connect timed out");
                Err(TransportError::Timeout(self.connect_timeout))
            },
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!(endpoint = %self.endpoint, "Error during TCP shutdown: {e}");
            }
        }
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
                let kind = TransportError::from_tcp_io(&e);
                self.stream = None;
                Err(kind)
            },
        }
    }

    async fn receive_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;

        let mut filled = 0;
        while filled < buf.len() {
            match stream.read(&mut buf[filled..]).await {
                Ok(0) => {
                    self.stream = None;
                    return Err(TransportError::ClosedByPeer);
                },
                Ok(n) => filled += n,
                Err(e) => {
                    let kind = TransportError::from_tcp_io(&e);
                    self.stream = None;
                    return Err(kind);
                },
            }
        }

        debug!(endpoint = %self.endpoint, direction = "recv", frame = %format_hex(buf), "Raw ADU");
        Ok(())
    }
}
