//! Per-device poller
//!
//! One poller owns the polling loop for one device: `Stopped → Starting →
//! Active ↔ Error → Stopped`. Every tick borrows a session for the duration
//! of one batch, reads each configured range in order, decodes, and
//! publishes one immutable snapshot through a watch channel (replace-only,
//! so readers never observe partial results).
//!
//! Cancellation is observed at the suspension points only: session acquire,
//! wire I/O, and between ranges. A stop joins the loop within the exchange
//! timeout plus 500ms and never leaves a session half-open; cancellation
//! mid-exchange closes the underlying transport on release.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::decoder::{self, EquationCache};
use super::session::{ExchangeOutcome, SessionLease, SessionManager};
use super::transport::TransportError;
use crate::error::{DevSrvError, Result};
use crate::model::{
    clamp_poll_interval, DataPoint, DataType, DeviceDefinition, PollerState, PollerStatus,
    PollingStats, Reading, RegisterKind, Snapshot, WordOrder,
};
use crate::protocols::modbus::ModbusClient;

/// Extra join budget granted on top of the exchange timeout when stopping
const STOP_GRACE: Duration = Duration::from_millis(500);

/// Result of a one-shot connectivity probe
#[derive(Debug, Clone)]
pub struct TestOutcome {
    pub success: bool,
    pub message: String,
    pub error: Option<TransportError>,
}

/// One parameter of a control request
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteRequest {
    pub name: String,
    pub register_index: u16,
    pub value: f64,
    pub data_type: DataType,
}

/// Per-parameter control outcome
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteResult {
    pub success: bool,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Overall control outcome; success is the AND of all parameters
#[derive(Debug, Clone)]
pub struct WriteReport {
    pub success: bool,
    pub results: Vec<WriteResult>,
}

#[derive(Debug)]
struct PollerMut {
    status: PollerState,
    interval: Duration,
    last_updated: Option<DateTime<Utc>>,
    last_error: Option<String>,
    stats: PollingStats,
    last_start_request: Option<Instant>,
    last_stop_request: Option<Instant>,
}

/// Poller for one device definition
pub struct DevicePoller {
    device: Arc<DeviceDefinition>,
    sessions: Arc<SessionManager>,
    /// Scaling equations compiled once at construction
    equations: EquationCache,
    state: RwLock<PollerMut>,
    snapshot_tx: watch::Sender<Option<Arc<Snapshot>>>,
    cancel: Mutex<Option<CancellationToken>>,
    task: AsyncMutex<Option<JoinHandle<()>>>,
    exchange_timeout: Duration,
}

impl DevicePoller {
    pub fn new(
        device: DeviceDefinition,
        sessions: Arc<SessionManager>,
        default_timeout_ms: u64,
    ) -> Arc<Self> {
        let exchange_timeout = device
            .advanced
            .connection_options
            .effective_timeout(default_timeout_ms);
        let interval = device.polling_interval();
        let equations = EquationCache::for_device(&device);
        let (snapshot_tx, _) = watch::channel(None);

        Arc::new(Self {
            device: Arc::new(device),
            sessions,
            equations,
            state: RwLock::new(PollerMut {
                status: PollerState::Stopped,
                interval,
                last_updated: None,
                last_error: None,
                stats: PollingStats::default(),
                last_start_request: None,
                last_stop_request: None,
            }),
            snapshot_tx,
            cancel: Mutex::new(None),
            task: AsyncMutex::new(None),
            exchange_timeout,
        })
    }

    pub fn device(&self) -> &DeviceDefinition {
        &self.device
    }

    pub fn status(&self) -> PollerStatus {
        let state = self.state.read();
        PollerStatus {
            device_id: self.device.id.clone(),
            status: state.status,
            is_polling: state.status.is_polling(),
            interval_ms: state.interval.as_millis() as u64,
            last_updated: state.last_updated,
            last_error: state.last_error.clone(),
            stats: state.stats.clone(),
        }
    }

    /// Latest published snapshot, if any
    pub fn latest_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.snapshot_tx.borrow().clone()
    }

    /// Subscribe to the snapshot stream (lossy, latest-wins)
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Snapshot>>> {
        self.snapshot_tx.subscribe()
    }

    /// Instant of the most recent accepted start request (debounce input)
    pub fn last_start_request(&self) -> Option<Instant> {
        self.state.read().last_start_request
    }

    pub fn last_stop_request(&self) -> Option<Instant> {
        self.state.read().last_stop_request
    }

    /// Update the target interval; the loop applies it after its next tick
    pub fn set_interval(&self, interval: Duration) {
        self.state.write().interval = clamp_poll_interval(interval);
    }

    /// Start polling: one synchronous tick, then the loop
    ///
    /// Returns once the poller is `Active`; any first-tick failure leaves it
    /// in `Error` and is handed back to the caller.
    pub async fn start(self: Arc<Self>, interval: Option<Duration>) -> Result<()> {
        if !self.device.enabled {
            return Err(DevSrvError::DeviceDisabled(self.device.id.clone()));
        }
        if let Err(problems) = self.device.validate() {
            return Err(DevSrvError::InvalidDefinition(problems.join("; ")));
        }

        {
            let mut state = self.state.write();
            state.last_start_request = Some(Instant::now());
            if state.status.is_polling() {
                if let Some(interval) = interval {
                    state.interval = clamp_poll_interval(interval);
                }
                return Ok(());
            }
            state.status = PollerState::Starting;
            if let Some(interval) = interval {
                state.interval = clamp_poll_interval(interval);
            }
            state.last_error = None;
        }

        let token = CancellationToken::new();
        *self.cancel.lock() = Some(token.clone());

        // First tick runs synchronously so the caller learns immediately
        // whether the device is reachable
        if let Err(e) = self.run_tick(&token).await {
            let mut state = self.state.write();
            state.status = PollerState::Error;
            state.last_error = Some(e.to_string());
            drop(state);
            self.cancel.lock().take();
            return Err(e);
        }

        self.state.write().status = PollerState::Active;

        let poller = Arc::clone(&self);
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            poller.polling_loop(loop_token).await;
        });
        *self.task.lock().await = Some(handle);

        info!(device = %self.device.id, "Poller active");
        Ok(())
    }

    /// Stop polling; idempotent, bounded by `timeout + 500ms`
    pub async fn stop(&self) {
        {
            let mut state = self.state.write();
            state.last_stop_request = Some(Instant::now());
            // Active is hidden from observers as soon as stop is requested
            state.status = PollerState::Stopped;
        }

        if let Some(token) = self.cancel.lock().take() {
            token.cancel();
        }

        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            if tokio::time::timeout(self.exchange_timeout + STOP_GRACE, handle)
                .await
                .is_err()
            {
                warn!(device = %self.device.id, "Polling loop missed the stop deadline, aborting");
                abort.abort();
            }
        }

        info!(device = %self.device.id, "Poller stopped");
    }

    /// One-shot connectivity probe; the poller need not be running
    pub async fn test_connection(&self) -> TestOutcome {
        let (kind, address) = self
            .device
            .data_points
            .first()
            .map(|point| (point.range.fc, point.range.start_address))
            .unwrap_or((RegisterKind::Holding, 0));

        let mut lease = match self.sessions.acquire(&self.device).await {
            Ok(lease) => lease,
            Err(e) => {
                return TestOutcome {
                    success: false,
                    message: format!("Connection failed: {e}"),
                    error: Some(e),
                }
            },
        };

        let unit = self.device.connection.unit_id();
        let probe = if kind.is_bit_table() {
            lease
                .client()
                .read_bits(unit, kind, address, 1)
                .await
                .map(|_| ())
        } else {
            lease
                .client()
                .read_words(unit, kind, address, 1)
                .await
                .map(|_| ())
        };

        match probe {
            Ok(()) => {
                self.sessions.release(lease, ExchangeOutcome::Success).await;
                TestOutcome {
                    success: true,
                    message: format!(
                        "Connected to {} and read register {address}",
                        self.device.connection.address()
                    ),
                    error: None,
                }
            },
            Err(e) => {
                self.sessions
                    .release(lease, ExchangeOutcome::Failed(&e))
                    .await;
                TestOutcome {
                    success: false,
                    message: format!("Device did not answer the probe: {e}"),
                    error: Some(e),
                }
            },
        }
    }

    /// One-shot read outside the polling loop
    ///
    /// Publishes the result into the snapshot slot, flagged stale unless the
    /// poller is currently `Active`.
    pub async fn read_once(&self) -> Result<Arc<Snapshot>> {
        if !self.device.enabled {
            return Err(DevSrvError::DeviceDisabled(self.device.id.clone()));
        }
        if let Err(problems) = self.device.validate() {
            return Err(DevSrvError::InvalidDefinition(problems.join("; ")));
        }

        let token = CancellationToken::new();
        let batch = self.read_all_ranges(&token).await?;

        if batch.ok_ranges == 0 {
            let error = batch
                .worst
                .map(DevSrvError::from)
                .unwrap_or_else(|| DevSrvError::Internal("device has no data points".to_string()));
            return Err(error);
        }

        let stale = self.state.read().status != PollerState::Active;
        let snapshot = Arc::new(Snapshot {
            device_id: self.device.id.clone(),
            device_name: self.device.name.clone(),
            timestamp: Utc::now(),
            has_data: !batch.readings.is_empty(),
            values: batch.readings,
            stale,
        });
        self.snapshot_tx.send_replace(Some(Arc::clone(&snapshot)));
        Ok(snapshot)
    }

    /// Best-effort control write; validates everything before touching wire
    pub async fn write(&self, requests: &[WriteRequest]) -> Result<WriteReport> {
        if requests.is_empty() {
            return Err(DevSrvError::InvalidParameter(
                "control request has no parameters".to_string(),
            ));
        }
        for request in requests {
            if request.name.trim().is_empty() {
                return Err(DevSrvError::InvalidParameter(
                    "parameter name must not be empty".to_string(),
                ));
            }
            if !request.value.is_finite() {
                return Err(DevSrvError::InvalidParameter(format!(
                    "parameter '{}' has a non-finite value",
                    request.name
                )));
            }
        }

        let plan = WritePlan::build(&self.device, requests);

        let mut lease = match self.sessions.acquire(&self.device).await {
            Ok(lease) => lease,
            Err(e) => return Err(e.into()),
        };

        let unit = self.device.connection.unit_id();
        let mut outcomes: Vec<Option<std::result::Result<(), TransportError>>> =
            vec![None; requests.len()];
        let mut worst: Option<TransportError> = None;

        for group in &plan.groups {
            let result = group.execute(lease.client(), unit).await;
            if let Err(e) = &result {
                worst = Some(e.clone());
            }
            for &index in &group.members {
                outcomes[index] = Some(result.clone());
            }
        }

        let outcome = match &worst {
            Some(error) => ExchangeOutcome::Failed(error),
            None => ExchangeOutcome::Success,
        };
        self.sessions.release(lease, outcome).await;

        let results: Vec<WriteResult> = requests
            .iter()
            .zip(outcomes)
            .map(|(request, outcome)| match outcome {
                Some(Ok(())) => WriteResult {
                    success: true,
                    name: request.name.clone(),
                    error: None,
                },
                Some(Err(e)) => WriteResult {
                    success: false,
                    name: request.name.clone(),
                    error: Some(e.to_string()),
                },
                None => WriteResult {
                    success: false,
                    name: request.name.clone(),
                    error: Some("not executed".to_string()),
                },
            })
            .collect();

        Ok(WriteReport {
            success: results.iter().all(|result| result.success),
            results,
        })
    }

    async fn polling_loop(self: Arc<Self>, token: CancellationToken) {
        let mut current_interval = self.state.read().interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + current_interval, current_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {},
            }
            if token.is_cancelled() {
                break;
            }

            match self.run_tick(&token).await {
                Ok(()) => {
                    let mut state = self.state.write();
                    if state.status != PollerState::Stopped {
                        state.status = PollerState::Active;
                    }
                },
                Err(DevSrvError::Cancelled) => break,
                Err(e) => {
                    debug!(device = %self.device.id, "Tick failed: {e}");
                    let mut state = self.state.write();
                    if state.status != PollerState::Stopped {
                        state.status = PollerState::Error;
                    }
                    state.last_error = Some(e.to_string());
                },
            }

            // Interval updates from a debounced restart apply here
            let desired = self.state.read().interval;
            if desired != current_interval {
                current_interval = desired;
                ticker = tokio::time::interval_at(Instant::now() + desired, desired);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            }
        }
        debug!(device = %self.device.id, "Polling loop exited");
    }

    /// One complete pass across all configured ranges
    async fn run_tick(&self, token: &CancellationToken) -> Result<()> {
        let started = Instant::now();

        let batch = match self.read_all_ranges(token).await {
            Ok(batch) => batch,
            Err(e) => {
                if !matches!(e, DevSrvError::Cancelled) {
                    let mut state = self.state.write();
                    state.stats.record_failure(started.elapsed().as_millis() as u64);
                    state.last_error = Some(e.to_string());
                    self.mark_snapshot_stale();
                }
                return Err(e);
            },
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;

        if batch.ok_ranges == 0 {
            // Nothing read this tick: error state, previous data flagged stale
            let error = batch
                .worst
                .map(DevSrvError::from)
                .unwrap_or_else(|| DevSrvError::Internal("device has no data points".to_string()));
            let mut state = self.state.write();
            state.stats.record_failure(elapsed_ms);
            state.last_error = Some(error.to_string());
            drop(state);
            self.mark_snapshot_stale();
            return Err(error);
        }

        if token.is_cancelled() {
            return Err(DevSrvError::Cancelled);
        }

        let snapshot = Arc::new(Snapshot {
            device_id: self.device.id.clone(),
            device_name: self.device.name.clone(),
            timestamp: Utc::now(),
            has_data: !batch.readings.is_empty(),
            values: batch.readings,
            stale: false,
        });
        self.snapshot_tx.send_replace(Some(snapshot));

        let mut state = self.state.write();
        state.last_updated = Some(Utc::now());
        state.stats.record_success(elapsed_ms);
        if batch.worst.is_some() {
            state.last_error = Some("one or more ranges failed".to_string());
        }
        Ok(())
    }

    /// Acquire, read every range in order, release
    async fn read_all_ranges(&self, token: &CancellationToken) -> Result<RangeBatch> {
        let mut lease = tokio::select! {
            _ = token.cancelled() => return Err(DevSrvError::Cancelled),
            result = self.sessions.acquire(&self.device) => result?,
        };

        let mut batch = RangeBatch::default();
        let mut cancelled = false;

        for point in &self.device.data_points {
            if token.is_cancelled() {
                cancelled = true;
                break;
            }

            let read = tokio::select! {
                _ = token.cancelled() => {
                    cancelled = true;
                    break;
                },
                words = Self::read_range(&mut lease, &self.device, point) => words,
            };

            match read {
                Ok(words) => {
                    batch.readings.extend(decoder::decode_range(
                        &point.range,
                        &words,
                        &self.device.make,
                        &point.parser.parameters,
                        &self.equations,
                    ));
                    batch.ok_ranges += 1;
                },
                Err(e) => {
                    warn!(
                        device = %self.device.id,
                        start = point.range.start_address,
                        "Range read failed: {e}"
                    );
                    batch
                        .readings
                        .extend(decoder::failed_range_readings(&point.parser.parameters, &e));
                    batch.worst = Some(e);
                },
            }
        }

        if cancelled {
            self.sessions
                .release(lease, ExchangeOutcome::Cancelled)
                .await;
            return Err(DevSrvError::Cancelled);
        }

        let outcome = match &batch.worst {
            Some(error) => ExchangeOutcome::Failed(error),
            None => ExchangeOutcome::Success,
        };
        self.sessions.release(lease, outcome).await;
        Ok(batch)
    }

    /// Read one range, normalizing bit tables to 0/1 words
    async fn read_range(
        lease: &mut SessionLease,
        device: &DeviceDefinition,
        point: &DataPoint,
    ) -> std::result::Result<Vec<u16>, TransportError> {
        let unit = device.connection.unit_id();
        let range = &point.range;

        if range.fc.is_bit_table() {
            let bits = lease
                .client()
                .read_bits(unit, range.fc, range.start_address, range.count)
                .await?;
            Ok(bits.into_iter().map(u16::from).collect())
        } else {
            lease
                .client()
                .read_words(unit, range.fc, range.start_address, range.count)
                .await
        }
    }

    fn mark_snapshot_stale(&self) {
        self.snapshot_tx.send_modify(|slot| {
            if let Some(snapshot) = slot {
                if !snapshot.stale {
                    *snapshot = Arc::new(snapshot.as_stale());
                }
            }
        });
    }
}

#[derive(Default)]
struct RangeBatch {
    readings: Vec<Reading>,
    ok_ranges: usize,
    worst: Option<TransportError>,
}

/// A planned wire write covering one or more requested parameters
enum WriteOp {
    Coil { address: u16, on: bool },
    Registers { address: u16, values: Vec<u16> },
}

struct WriteGroup {
    op: WriteOp,
    /// Indexes into the original request list
    members: Vec<usize>,
}

impl WriteGroup {
    async fn execute(
        &self,
        client: &mut ModbusClient,
        unit: u8,
    ) -> std::result::Result<(), TransportError> {
        match &self.op {
            WriteOp::Coil { address, on } => client.write_single_coil(unit, *address, *on).await,
            WriteOp::Registers { address, values } if values.len() == 1 => {
                client.write_single_register(unit, *address, values[0]).await
            },
            WriteOp::Registers { address, values } => {
                client.write_multiple_registers(unit, *address, values).await
            },
        }
    }
}

struct WritePlan {
    groups: Vec<WriteGroup>,
}

impl WritePlan {
    /// Encode each parameter and merge contiguous register runs
    ///
    /// Coils always go out as individual FC 5 writes. Register parameters
    /// are sorted by address and merged while the next parameter starts
    /// exactly where the previous one ended; a merged run of two or more
    /// registers becomes one FC 16, an isolated register an FC 6.
    fn build(device: &DeviceDefinition, requests: &[WriteRequest]) -> Self {
        struct Encoded {
            index: usize,
            address: u16,
            words: Vec<u16>,
        }

        let mut groups = Vec::new();
        let mut registers: Vec<Encoded> = Vec::new();

        for (index, request) in requests.iter().enumerate() {
            match request.data_type {
                DataType::Bit => groups.push(WriteGroup {
                    op: WriteOp::Coil {
                        address: request.register_index,
                        on: request.value != 0.0,
                    },
                    members: vec![index],
                }),
                DataType::Uint16 => registers.push(Encoded {
                    index,
                    address: request.register_index,
                    words: vec![request.value as u16],
                }),
                DataType::Int16 => registers.push(Encoded {
                    index,
                    address: request.register_index,
                    words: vec![request.value as i16 as u16],
                }),
                DataType::Uint32 | DataType::Int32 | DataType::Float32 => {
                    let order = word_order_for(device, &request.name);
                    let bytes = match request.data_type {
                        DataType::Uint32 => (request.value as u32).to_be_bytes(),
                        DataType::Int32 => (request.value as i32).to_be_bytes(),
                        _ => (request.value as f32).to_be_bytes(),
                    };
                    registers.push(Encoded {
                        index,
                        address: request.register_index,
                        words: decoder::encode_words(order, bytes).to_vec(),
                    });
                },
            }
        }

        registers.sort_by_key(|encoded| encoded.address);

        let mut run: Option<(u16, Vec<u16>, Vec<usize>)> = None;
        for encoded in registers {
            match &mut run {
                Some((start, words, members))
                    if u32::from(*start) + words.len() as u32 == u32::from(encoded.address)
                        && words.len() + encoded.words.len()
                            <= crate::protocols::modbus::constants::MAX_WRITE_REGISTERS as usize =>
                {
                    words.extend(encoded.words);
                    members.push(encoded.index);
                },
                _ => {
                    if let Some((start, words, members)) = run.take() {
                        groups.push(WriteGroup {
                            op: WriteOp::Registers {
                                address: start,
                                values: words,
                            },
                            members,
                        });
                    }
                    run = Some((encoded.address, encoded.words, vec![encoded.index]));
                },
            }
        }
        if let Some((start, words, members)) = run.take() {
            groups.push(WriteGroup {
                op: WriteOp::Registers {
                    address: start,
                    values: words,
                },
                members,
            });
        }

        Self { groups }
    }
}

/// Word order for a named parameter, falling back to the vendor default
fn word_order_for(device: &DeviceDefinition, name: &str) -> WordOrder {
    device
        .data_points
        .iter()
        .flat_map(|point| point.parser.parameters.iter())
        .find(|parameter| parameter.name == name)
        .and_then(|parameter| parameter.byte_order)
        .unwrap_or_else(|| decoder::default_word_order(&device.make))
}
