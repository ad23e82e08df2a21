//! Modbus client driving one transport
//!
//! Owns the framing differences between TCP and RTU, transaction-id
//! bookkeeping, response validation and the per-request retry policy.
//! The per-exchange timeout is enforced here so both transports share one
//! deadline implementation; a timed-out transport is closed because bytes
//! from the stale exchange could otherwise desynchronize the next one.

use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::codec;
use super::constants::MBAP_HEADER_LEN;
use super::frame::{self, MbapHeader};
use super::pdu::ModbusPdu;
use crate::core::transport::{Transport, TransportError};
use crate::model::RegisterKind;

/// Wire framing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModbusMode {
    Tcp,
    Rtu,
}

/// Per-client request behavior
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Deadline for one complete exchange
    pub timeout: Duration,
    /// Extra attempts for retryable failures
    pub retries: u32,
    /// Pause between attempts
    pub retry_interval: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            retries: 0,
            retry_interval: Duration::from_secs(1),
        }
    }
}

/// Client for one endpoint; exchanges are serialized by the session mutex
#[derive(Debug)]
pub struct ModbusClient {
    transport: Box<dyn Transport>,
    mode: ModbusMode,
    options: ClientOptions,
    next_transaction: u16,
}

impl ModbusClient {
    pub fn new(transport: Box<dyn Transport>, mode: ModbusMode, options: ClientOptions) -> Self {
        Self {
            transport,
            mode,
            options,
            next_transaction: 1,
        }
    }

    pub fn endpoint(&self) -> &str {
        self.transport.endpoint()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub async fn connect(&mut self) -> Result<(), TransportError> {
        self.transport.connect().await
    }

    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.transport.close().await
    }

    /// Read 16-bit registers (FC 3 / FC 4)
    pub async fn read_words(
        &mut self,
        unit: u8,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let request = codec::build_read_request(kind, address, count)?;
        self.execute(unit, &request, |pdu| {
            codec::parse_read_words(pdu, kind, count)
        })
        .await
    }

    /// Read coils or discrete inputs (FC 1 / FC 2)
    pub async fn read_bits(
        &mut self,
        unit: u8,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>, TransportError> {
        let request = codec::build_read_request(kind, address, count)?;
        self.execute(unit, &request, |pdu| {
            codec::parse_read_bits(pdu, kind, count)
        })
        .await
    }

    /// Write one coil (FC 5)
    pub async fn write_single_coil(
        &mut self,
        unit: u8,
        address: u16,
        on: bool,
    ) -> Result<(), TransportError> {
        let request = codec::build_write_single_coil(address, on)?;
        self.execute(unit, &request, |pdu| codec::parse_write_response(pdu, 0x05))
            .await
    }

    /// Write one holding register (FC 6)
    pub async fn write_single_register(
        &mut self,
        unit: u8,
        address: u16,
        value: u16,
    ) -> Result<(), TransportError> {
        let request = codec::build_write_single_register(address, value)?;
        self.execute(unit, &request, |pdu| codec::parse_write_response(pdu, 0x06))
            .await
    }

    /// Write a contiguous run of holding registers (FC 16)
    pub async fn write_multiple_registers(
        &mut self,
        unit: u8,
        address: u16,
        values: &[u16],
    ) -> Result<(), TransportError> {
        let request = codec::build_write_multiple_registers(address, values)?;
        self.execute(unit, &request, |pdu| codec::parse_write_response(pdu, 0x10))
            .await
    }

    /// Run one request through the retry policy
    async fn execute<T>(
        &mut self,
        unit: u8,
        request: &ModbusPdu,
        parse: impl Fn(&ModbusPdu) -> Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        let mut attempt: u32 = 0;
        loop {
            let outcome = match self.exchange(unit, request).await {
                Ok(response) => parse(&response),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.options.retries => {
                    attempt += 1;
                    warn!(
                        endpoint = %self.transport.endpoint(),
                        attempt,
                        "Retrying exchange after {e}"
                    );
                    if !self.options.retry_interval.is_zero() {
                        tokio::time::sleep(self.options.retry_interval).await;
                    }
                    if !self.transport.is_connected() {
                        self.transport.connect().await?;
                    }
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// One request/response round trip, deadline enforced
    async fn exchange(
        &mut self,
        unit: u8,
        request: &ModbusPdu,
    ) -> Result<ModbusPdu, TransportError> {
        if !self.transport.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let deadline = self.options.timeout;
        let result = match self.mode {
            ModbusMode::Tcp => {
                let transaction = self.next_transaction;
                self.next_transaction = self.next_transaction.wrapping_add(1).max(1);
                timeout(deadline, Self::exchange_tcp(
                    self.transport.as_mut(),
                    transaction,
                    unit,
                    request,
                ))
                .await
            },
            ModbusMode::Rtu => {
                timeout(deadline, Self::exchange_rtu(
                    self.transport.as_mut(),
                    unit,
                    request,
                ))
                .await
            },
        };

        match result {
            Ok(inner) => inner,
            Err(_) => {
                debug!(endpoint = %self.transport.endpoint(), "Exchange timed out, closing transport");
                let _ = self.transport.close().await;
                Err(TransportError::Timeout(deadline))
            },
        }
    }

    async fn exchange_tcp(
        transport: &mut dyn Transport,
        transaction: u16,
        unit: u8,
        request: &ModbusPdu,
    ) -> Result<ModbusPdu, TransportError> {
        let adu = frame::build_tcp_adu(transaction, unit, request);
        transport.send(&adu).await?;

        let mut header_bytes = [0u8; MBAP_HEADER_LEN];
        transport.receive_exact(&mut header_bytes).await?;
        let header = MbapHeader::from_bytes(&header_bytes)?;

        if header.transaction_id != transaction {
            return Err(TransportError::Protocol(format!(
                "transaction id mismatch: expected {}, got {}",
                transaction, header.transaction_id
            )));
        }
        if header.unit_id != unit {
            return Err(TransportError::Protocol(format!(
                "unit id mismatch: expected {}, got {}",
                unit, header.unit_id
            )));
        }

        let mut body = vec![0u8; header.pdu_len()];
        transport.receive_exact(&mut body).await?;
        ModbusPdu::from_slice(&body)
    }

    async fn exchange_rtu(
        transport: &mut dyn Transport,
        unit: u8,
        request: &ModbusPdu,
    ) -> Result<ModbusPdu, TransportError> {
        let adu = frame::build_rtu_adu(unit, request);
        transport.send(&adu).await?;

        let mut head = [0u8; 3];
        transport.receive_exact(&mut head).await?;

        let remaining = codec::rtu_remaining_len(head[1], head[2])?;
        let mut full = Vec::with_capacity(3 + remaining);
        full.extend_from_slice(&head);
        if remaining > 0 {
            let mut rest = vec![0u8; remaining];
            transport.receive_exact(&mut rest).await?;
            full.extend_from_slice(&rest);
        }

        frame::parse_rtu_adu(&full, unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::{ExceptionCode, MockAction, MockTransport};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn options(timeout_ms: u64, retries: u32) -> ClientOptions {
        ClientOptions {
            timeout: Duration::from_millis(timeout_ms),
            retries,
            retry_interval: Duration::ZERO,
        }
    }

    /// Echo a valid FC3 response carrying `words` for any TCP read request
    fn tcp_words_responder(words: Vec<u16>) -> impl Fn(&[u8]) -> MockAction {
        move |request: &[u8]| {
            let transaction = [request[0], request[1]];
            let unit = request[6];
            let fc = request[7];

            let mut pdu = vec![fc, (words.len() * 2) as u8];
            for word in &words {
                pdu.extend_from_slice(&word.to_be_bytes());
            }

            let mut adu = Vec::new();
            adu.extend_from_slice(&transaction);
            adu.extend_from_slice(&[0x00, 0x00]);
            adu.extend_from_slice(&((pdu.len() as u16 + 1).to_be_bytes()));
            adu.push(unit);
            adu.extend_from_slice(&pdu);
            MockAction::Reply(adu)
        }
    }

    #[tokio::test]
    async fn test_tcp_read_words_round_trip() {
        let mock = MockTransport::new("sim", tcp_words_responder(vec![0x4248, 0xF5C3]));
        let mut client = ModbusClient::new(Box::new(mock), ModbusMode::Tcp, options(500, 0));
        client.connect().await.unwrap();

        let words = client
            .read_words(1, crate::model::RegisterKind::Holding, 100, 2)
            .await
            .unwrap();
        assert_eq!(words, vec![0x4248, 0xF5C3]);
    }

    #[tokio::test]
    async fn test_tcp_transaction_mismatch_is_protocol_error() {
        let mock = MockTransport::new("sim", |request: &[u8]| {
            let mut action = tcp_words_responder(vec![1])(request);
            if let MockAction::Reply(bytes) = &mut action {
                bytes[0] ^= 0xFF; // corrupt the transaction id
            }
            action
        });
        let mut client = ModbusClient::new(Box::new(mock), ModbusMode::Tcp, options(500, 0));
        client.connect().await.unwrap();

        let err = client
            .read_words(1, crate::model::RegisterKind::Holding, 0, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_timeout_then_retry_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        let mock = MockTransport::new("sim", move |request: &[u8]| {
            if calls_clone.fetch_add(1, Ordering::SeqCst) == 0 {
                MockAction::Silence
            } else {
                tcp_words_responder(vec![7])(request)
            }
        });
        let mut client = ModbusClient::new(Box::new(mock), ModbusMode::Tcp, options(100, 1));
        client.connect().await.unwrap();

        let words = client
            .read_words(1, crate::model::RegisterKind::Holding, 0, 1)
            .await
            .unwrap();
        assert_eq!(words, vec![7]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_timeout_exhausts_retries() {
        let mock = MockTransport::new("sim", |_: &[u8]| MockAction::Silence);
        let mut client = ModbusClient::new(Box::new(mock), ModbusMode::Tcp, options(50, 2));
        client.connect().await.unwrap();

        let started = tokio::time::Instant::now();
        let err = client
            .read_words(1, crate::model::RegisterKind::Holding, 0, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
        // Three attempts at 50ms each plus scheduling slack
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_rtu_exception_frame() {
        let mock = MockTransport::new("sim", |request: &[u8]| {
            let unit = request[0];
            let mut reply = vec![unit, request[1] | 0x80, 0x02];
            let crc = frame::crc16(&reply);
            reply.extend_from_slice(&crc.to_le_bytes());
            MockAction::Reply(reply)
        });
        let mut client = ModbusClient::new(Box::new(mock), ModbusMode::Rtu, options(500, 0));
        client.connect().await.unwrap();

        let err = client
            .read_words(5, crate::model::RegisterKind::Holding, 0, 1)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            TransportError::ModbusException(ExceptionCode::IllegalAddress)
        );
    }

    #[tokio::test]
    async fn test_rtu_write_echo_round_trip() {
        let mock = MockTransport::new("sim", |request: &[u8]| {
            MockAction::Reply(request.to_vec())
        });
        let mut client = ModbusClient::new(Box::new(mock), ModbusMode::Rtu, options(500, 0));
        client.connect().await.unwrap();

        client.write_single_register(3, 0x0010, 0x1234).await.unwrap();
        client.write_single_coil(3, 0x0008, true).await.unwrap();
        client
            .write_multiple_registers(3, 0x0005, &[1, 2, 3])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_modbus_exception_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        let mock = MockTransport::new("sim", move |request: &[u8]| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            let unit = request[0];
            let mut reply = vec![unit, request[1] | 0x80, 0x01];
            let crc = frame::crc16(&reply);
            reply.extend_from_slice(&crc.to_le_bytes());
            MockAction::Reply(reply)
        });
        let mut client = ModbusClient::new(Box::new(mock), ModbusMode::Rtu, options(500, 3));
        client.connect().await.unwrap();

        let err = client
            .read_words(1, crate::model::RegisterKind::Holding, 0, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ModbusException(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
