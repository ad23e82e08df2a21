//! Published reading snapshots and poller status types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::device::DataType;

/// One decoded parameter value
///
/// `value: None` means "present but unreadable" and is always accompanied by
/// an `error`; absence of a parameter from a snapshot never happens for a
/// configured device. A reading may carry both a value and an error when the
/// scaling equation failed and the pre-equation value was kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    pub name: String,
    pub register_index: u16,
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub data_type: DataType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Immutable result of one polling tick
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub device_id: String,
    pub device_name: String,
    pub timestamp: DateTime<Utc>,
    pub values: Vec<Reading>,
    pub stale: bool,
    pub has_data: bool,
}

impl Snapshot {
    /// Copy of this snapshot flagged stale, keeping the original timestamp
    pub fn as_stale(&self) -> Snapshot {
        let mut copy = self.clone();
        copy.stale = true;
        copy
    }
}

/// Poller lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PollerState {
    Stopped,
    Starting,
    Active,
    Error,
}

impl PollerState {
    pub fn is_polling(&self) -> bool {
        matches!(self, PollerState::Starting | PollerState::Active)
    }
}

/// Counters accumulated across polling ticks
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollingStats {
    pub total_ticks: u64,
    pub failed_ticks: u64,
    pub last_tick_ms: u64,
    pub consecutive_failures: u32,
}

impl PollingStats {
    pub fn record_success(&mut self, elapsed_ms: u64) {
        self.total_ticks += 1;
        self.last_tick_ms = elapsed_ms;
        self.consecutive_failures = 0;
    }

    pub fn record_failure(&mut self, elapsed_ms: u64) {
        self.total_ticks += 1;
        self.failed_ticks += 1;
        self.last_tick_ms = elapsed_ms;
        self.consecutive_failures += 1;
    }
}

/// Externally visible poller state
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollerStatus {
    pub device_id: String,
    pub status: PollerState,
    pub is_polling: bool,
    pub interval_ms: u64,
    pub last_updated: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    #[serde(default)]
    pub stats: PollingStats,
}

impl PollerStatus {
    /// Status reported for a device with no poller
    pub fn stopped(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            status: PollerState::Stopped,
            is_polling: false,
            interval_ms: 0,
            last_updated: None,
            last_error: None,
            stats: PollingStats::default(),
        }
    }
}
