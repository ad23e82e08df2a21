//! Scripted transport for tests
//!
//! Replies are computed from the request bytes by a responder closure, so a
//! single mock can stand in for a whole bus of slaves. Every exchange is
//! recorded with start and finish instants, which the serial-exclusivity
//! tests use to prove that exchanges on a shared port never overlap.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::traits::{Transport, TransportError};

/// What the scripted device does with one request
pub enum MockAction {
    /// Reply with a complete response ADU
    Reply(Vec<u8>),
    /// Accept the request and never answer (drives the timeout path)
    Silence,
    /// Fail the exchange with a transport error
    Fail(TransportError),
}

type Responder = dyn Fn(&[u8]) -> MockAction + Send + Sync;

/// One recorded exchange
#[derive(Debug, Clone)]
pub struct ExchangeRecord {
    pub request: Vec<u8>,
    pub started: Instant,
    pub finished: Option<Instant>,
}

/// Scripted in-memory transport
pub struct MockTransport {
    name: String,
    responder: Arc<Responder>,
    latency: Duration,
    connect_error: Option<TransportError>,
    connected: bool,
    pending: Option<MockAction>,
    rx: VecDeque<u8>,
    log: Arc<Mutex<Vec<ExchangeRecord>>>,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("name", &self.name)
            .field("connected", &self.connected)
            .finish()
    }
}

impl MockTransport {
    pub fn new(
        name: impl Into<String>,
        responder: impl Fn(&[u8]) -> MockAction + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            responder: Arc::new(responder),
            latency: Duration::ZERO,
            connect_error: None,
            connected: false,
            pending: None,
            rx: VecDeque::new(),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Delay inserted before each reply becomes readable
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make `connect` fail with the given kind
    pub fn with_connect_error(mut self, error: TransportError) -> Self {
        self.connect_error = Some(error);
        self
    }

    /// Share this transport's exchange log (record per request)
    pub fn log_handle(&self) -> Arc<Mutex<Vec<ExchangeRecord>>> {
        Arc::clone(&self.log)
    }

    /// Attach an externally shared log (lets several mocks share one bus log)
    pub fn with_shared_log(mut self, log: Arc<Mutex<Vec<ExchangeRecord>>>) -> Self {
        self.log = log;
        self
    }

    fn mark_finished(&self) {
        let mut log = self.log.lock();
        if let Some(record) = log.iter_mut().rev().find(|r| r.finished.is_none()) {
            record.finished = Some(Instant::now());
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn transport_type(&self) -> &'static str {
        "mock"
    }

    fn endpoint(&self) -> &str {
        &self.name
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        if let Some(error) = &self.connect_error {
            return Err(error.clone());
        }
        self.connected = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.connected = false;
        self.pending = None;
        self.rx.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }

        self.rx.clear();
        self.log.lock().push(ExchangeRecord {
            request: data.to_vec(),
            started: Instant::now(),
            finished: None,
        });
        self.pending = Some((self.responder)(data));
        Ok(())
    }

    async fn receive_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }

        if self.rx.is_empty() {
            match self.pending.take() {
                Some(MockAction::Reply(bytes)) => {
                    if !self.latency.is_zero() {
                        tokio::time::sleep(self.latency).await;
                    }
                    self.rx.extend(bytes);
                },
                Some(MockAction::Fail(error)) => {
                    self.mark_finished();
                    return Err(error);
                },
                Some(MockAction::Silence) | None => {
                    // No data will ever arrive; the caller's timeout fires.
                    std::future::pending::<()>().await;
                    unreachable!();
                },
            }
        }

        if self.rx.len() < buf.len() {
            std::future::pending::<()>().await;
            unreachable!();
        }

        for slot in buf.iter_mut() {
            *slot = self.rx.pop_front().unwrap_or_default();
        }

        if self.rx.is_empty() {
            self.mark_finished();
        }
        Ok(())
    }
}
