//! Modbus session manager
//!
//! Pools one live client per physical endpoint and serializes exchanges
//! through the session mutex. The pool key excludes the unit id, so every
//! device on one serial bus (or behind one TCP socket) shares a session and
//! its exchanges are totally ordered in time.
//!
//! Unhealthy sessions reconnect lazily on the next acquire, gated by an
//! exponential backoff; a background reaper closes sessions that have been
//! idle past the configured TTL.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::transport::{TransportError, TransportFactory};
use crate::model::{Connection, ConnectionOptions, DeviceDefinition};
use crate::protocols::modbus::{ClientOptions, ModbusClient, ModbusMode};

/// Reconnect backoff never exceeds this
const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Pool-level settings derived from the gateway configuration
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub idle_ttl: Duration,
    pub reap_interval: Duration,
    pub default_timeout_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_ttl: Duration::from_secs(120),
            reap_interval: Duration::from_secs(30),
            default_timeout_ms: 5000,
        }
    }
}

/// How an exchange batch ended, reported back on release
pub enum ExchangeOutcome<'a> {
    Success,
    /// The poller was stopped mid-batch; the socket may hold a half-read
    /// response, so the session is closed
    Cancelled,
    Failed(&'a TransportError),
}

#[derive(Debug)]
struct SessionState {
    healthy: bool,
    last_used: Instant,
    backoff: Duration,
    next_retry_at: Option<Instant>,
    last_error: Option<TransportError>,
    auto_reconnect: bool,
    reconnect_base: Duration,
}

/// One pooled endpoint
#[derive(Debug)]
pub struct Session {
    key: String,
    client: Arc<AsyncMutex<ModbusClient>>,
    state: Mutex<SessionState>,
}

/// Health listing entry for diagnostics
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDiagnostics {
    pub endpoint: String,
    pub healthy: bool,
    pub idle_ms: u64,
    pub last_error: Option<String>,
}

/// Exclusive use of one session for the duration of one exchange batch
#[derive(Debug)]
pub struct SessionLease {
    session: Arc<Session>,
    guard: OwnedMutexGuard<ModbusClient>,
}

impl SessionLease {
    pub fn client(&mut self) -> &mut ModbusClient {
        &mut self.guard
    }

    pub fn endpoint(&self) -> &str {
        &self.session.key
    }
}

/// Endpoint-keyed pool of Modbus clients
pub struct SessionManager {
    sessions: DashMap<String, Arc<Session>>,
    factory: Box<dyn TransportFactory>,
    settings: SessionSettings,
}

impl SessionManager {
    pub fn new(factory: Box<dyn TransportFactory>, settings: SessionSettings) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            factory,
            settings,
        })
    }

    /// Borrow the endpoint's client, connecting or reconnecting if needed
    ///
    /// Blocks on the per-endpoint mutex; the lease must be handed back via
    /// [`SessionManager::release`].
    pub async fn acquire(&self, device: &DeviceDefinition) -> Result<SessionLease, TransportError> {
        let options = &device.advanced.connection_options;
        let session = self.session_for(&device.connection, options);

        let guard = Arc::clone(&session.client).lock_owned().await;
        let mut lease = SessionLease { session, guard };

        if !lease.guard.is_connected() {
            // Lazy reconnect, gated by the backoff window when enabled
            {
                let state = lease.session.state.lock();
                if state.auto_reconnect {
                    if let Some(at) = state.next_retry_at {
                        if Instant::now() < at {
                            return Err(state
                                .last_error
                                .clone()
                                .unwrap_or(TransportError::NotConnected));
                        }
                    }
                }
            }

            match lease.guard.connect().await {
                Ok(()) => {
                    let mut state = lease.session.state.lock();
                    state.healthy = true;
                    state.backoff = state.reconnect_base;
                    state.next_retry_at = None;
                    state.last_error = None;
                    debug!(endpoint = %lease.session.key, "Session connected");
                },
                Err(e) => {
                    let mut state = lease.session.state.lock();
                    state.healthy = false;
                    state.last_error = Some(e.clone());
                    if state.auto_reconnect {
                        state.next_retry_at = Some(Instant::now() + state.backoff);
                        state.backoff = (state.backoff * 2).min(RECONNECT_BACKOFF_CAP);
                    }
                    warn!(endpoint = %lease.session.key, "Session connect failed: {e}");
                    return Err(e);
                },
            }
        }

        lease.session.state.lock().last_used = Instant::now();
        Ok(lease)
    }

    /// Hand a lease back and record how the batch went
    pub async fn release(&self, lease: SessionLease, outcome: ExchangeOutcome<'_>) {
        let SessionLease { session, mut guard } = lease;

        let close_needed = match outcome {
            ExchangeOutcome::Success => {
                let mut state = session.state.lock();
                state.healthy = true;
                state.last_error = None;
                state.backoff = state.reconnect_base;
                state.next_retry_at = None;
                false
            },
            ExchangeOutcome::Cancelled => {
                debug!(endpoint = %session.key, "Lease released after cancellation, closing session");
                true
            },
            ExchangeOutcome::Failed(error) => {
                let mut state = session.state.lock();
                state.last_error = Some(error.clone());
                if error.marks_unhealthy() {
                    state.healthy = false;
                    if state.auto_reconnect {
                        state.next_retry_at = Some(Instant::now() + state.backoff);
                        state.backoff = (state.backoff * 2).min(RECONNECT_BACKOFF_CAP);
                    }
                }
                error.marks_unhealthy()
            },
        };

        if close_needed {
            let _ = guard.close().await;
        }

        session.state.lock().last_used = Instant::now();
    }

    /// Close idle and unhealthy-idle sessions
    pub async fn reap(&self) {
        let now = Instant::now();
        let mut to_close = Vec::new();

        for entry in self.sessions.iter() {
            let (idle, healthy) = {
                let state = entry.value().state.lock();
                (now.duration_since(state.last_used), state.healthy)
            };
            if idle > self.settings.idle_ttl || (!healthy && idle > self.settings.reap_interval) {
                to_close.push((entry.key().clone(), Arc::clone(entry.value())));
            }
        }

        for (key, session) in to_close {
            // A busy session is in use by definition, skip it
            let Ok(mut guard) = Arc::clone(&session.client).try_lock_owned() else {
                continue;
            };
            let _ = guard.close().await;
            self.sessions.remove(&key);
            info!(endpoint = %key, "Reaped idle session");
        }
    }

    /// Run the reaper until cancelled
    pub fn spawn_reaper(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.settings.reap_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => manager.reap().await,
                }
            }
            debug!("Session reaper stopped");
        })
    }

    /// Close every session; used by the shutdown barrier
    pub async fn close_all(&self) -> usize {
        let sessions: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.sessions.clear();

        let mut closed = 0;
        for session in sessions {
            let mut guard = Arc::clone(&session.client).lock_owned().await;
            let _ = guard.close().await;
            closed += 1;
        }
        info!(closed, "Closed all sessions");
        closed
    }

    /// Per-endpoint health listing
    pub fn diagnostics(&self) -> Vec<SessionDiagnostics> {
        let now = Instant::now();
        self.sessions
            .iter()
            .map(|entry| {
                let state = entry.value().state.lock();
                SessionDiagnostics {
                    endpoint: entry.key().clone(),
                    healthy: state.healthy,
                    idle_ms: now.duration_since(state.last_used).as_millis() as u64,
                    last_error: state.last_error.as_ref().map(ToString::to_string),
                }
            })
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn session_for(&self, connection: &Connection, options: &ConnectionOptions) -> Arc<Session> {
        let key = connection.transport_key();
        if let Some(existing) = self.sessions.get(&key) {
            return Arc::clone(existing.value());
        }

        let timeout = options.effective_timeout(self.settings.default_timeout_ms);
        let mode = match connection {
            Connection::Tcp { .. } => ModbusMode::Tcp,
            Connection::Rtu { .. } => ModbusMode::Rtu,
        };
        let client = ModbusClient::new(
            self.factory.create(connection, timeout),
            mode,
            ClientOptions {
                timeout,
                retries: options.retries,
                retry_interval: options.retry_interval(),
            },
        );

        let session = Arc::new(Session {
            key: key.clone(),
            client: Arc::new(AsyncMutex::new(client)),
            state: Mutex::new(SessionState {
                healthy: false,
                last_used: Instant::now(),
                backoff: options.reconnect_interval(),
                next_retry_at: None,
                last_error: None,
                auto_reconnect: options.auto_reconnect,
                reconnect_base: options.reconnect_interval(),
            }),
        });

        // Another caller may have raced the insert; keep whichever won
        self.sessions
            .entry(key)
            .or_insert(session)
            .value()
            .clone()
    }
}
