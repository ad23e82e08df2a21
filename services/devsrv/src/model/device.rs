//! Device definition types
//!
//! A device definition is the unit of configuration the gateway consumes
//! through the repository port. It is immutable from the core's perspective;
//! edits take effect on the next poller start. Only the nested connection
//! form is accepted.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Smallest accepted polling interval
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Largest accepted polling interval
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(60);
/// Polling interval used when the definition does not carry one
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Clamp a requested polling interval into the supported window
pub fn clamp_poll_interval(interval: Duration) -> Duration {
    interval.clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL)
}

/// A configured field device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDefinition {
    /// Opaque identifier (24 hex characters in the current deployment)
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub make: String,
    #[serde(default)]
    pub model: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub connection: Connection,
    /// Target period between polling ticks, in milliseconds
    #[serde(rename = "pollingInterval", default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,
    #[serde(default)]
    pub advanced: AdvancedSettings,
    #[serde(default)]
    pub data_points: Vec<DataPoint>,
}

impl DeviceDefinition {
    /// Polling interval clamped to the supported window
    pub fn polling_interval(&self) -> Duration {
        clamp_poll_interval(Duration::from_millis(self.polling_interval_ms))
    }

    /// Validate the definition against the Modbus addressing invariants
    ///
    /// Returns every violation so configuration errors surface in one pass.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();

        if self.data_points.is_empty() {
            problems.push("device has no data points".to_string());
        }

        for (idx, point) in self.data_points.iter().enumerate() {
            let range = &point.range;

            if range.count == 0 {
                problems.push(format!("range {idx}: count must be at least 1"));
                continue;
            }
            if range.count > range.fc.max_count() {
                problems.push(format!(
                    "range {idx}: count {} exceeds limit {} for FC{}",
                    range.count,
                    range.fc.max_count(),
                    range.fc as u8
                ));
            }

            for param in &point.parser.parameters {
                let Some(relative) = range.resolve_index(param.register_index) else {
                    problems.push(format!(
                        "parameter '{}': register index {} outside range {}..{}",
                        param.name,
                        param.register_index,
                        range.start_address,
                        u32::from(range.start_address) + u32::from(range.count)
                    ));
                    continue;
                };

                let words = param.word_count();
                if u32::from(relative) + u32::from(words) > u32::from(range.count) {
                    problems.push(format!(
                        "parameter '{}': {} words at relative index {} do not fit in count {}",
                        param.name, words, relative, range.count
                    ));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }
}

/// Connection settings, nested form only
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Connection {
    #[serde(rename = "TCP", rename_all = "camelCase")]
    Tcp {
        ip: String,
        port: u16,
        #[serde(default = "default_unit_id")]
        unit_id: u8,
    },
    #[serde(rename = "RTU", rename_all = "camelCase")]
    Rtu {
        serial_port: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
        #[serde(default)]
        parity: Parity,
        #[serde(default = "default_unit_id")]
        unit_id: u8,
    },
}

impl Connection {
    /// Slave address placed in each ADU
    pub fn unit_id(&self) -> u8 {
        match self {
            Connection::Tcp { unit_id, .. } | Connection::Rtu { unit_id, .. } => *unit_id,
        }
    }

    /// Normalized key identifying the shared physical transport
    ///
    /// The unit id is deliberately absent: all units behind one TCP socket or
    /// one serial bus share a session, and therefore a single exchange mutex.
    pub fn transport_key(&self) -> String {
        match self {
            Connection::Tcp { ip, port, .. } => format!("tcp://{ip}:{port}"),
            Connection::Rtu {
                serial_port,
                baud_rate,
                data_bits,
                stop_bits,
                parity,
                ..
            } => format!("rtu://{serial_port}|{baud_rate}|{data_bits}|{parity}|{stop_bits}"),
        }
    }

    /// Human-readable address for diagnostics and error payloads
    pub fn address(&self) -> String {
        match self {
            Connection::Tcp { ip, port, .. } => format!("{ip}:{port}"),
            Connection::Rtu { serial_port, .. } => serial_port.clone(),
        }
    }

    /// "TCP" or "RTU"
    pub fn kind_name(&self) -> &'static str {
        match self {
            Connection::Tcp { .. } => "TCP",
            Connection::Rtu { .. } => "RTU",
        }
    }
}

/// Serial parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Parity::None => write!(f, "none"),
            Parity::Even => write!(f, "even"),
            Parity::Odd => write!(f, "odd"),
        }
    }
}

/// Advanced per-device settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvancedSettings {
    #[serde(default)]
    pub connection_options: ConnectionOptions,
}

/// Request-level connection behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionOptions {
    /// Per-exchange timeout in milliseconds; falls back to the gateway default
    pub timeout: Option<u64>,
    #[serde(default)]
    pub retries: u32,
    /// Delay between retry attempts, milliseconds
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval: u64,
    #[serde(default = "default_auto_reconnect")]
    pub auto_reconnect: bool,
    /// Initial reconnect backoff, milliseconds
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval: u64,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            retries: 0,
            retry_interval: default_retry_interval_ms(),
            auto_reconnect: default_auto_reconnect(),
            reconnect_interval: default_reconnect_interval_ms(),
        }
    }
}

impl ConnectionOptions {
    /// Effective exchange timeout given the gateway-wide default
    pub fn effective_timeout(&self, default_ms: u64) -> Duration {
        Duration::from_millis(self.timeout.unwrap_or(default_ms))
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval)
    }
}

/// One register window plus the parameters parsed out of it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPoint {
    pub range: RegisterRange,
    pub parser: ParserSpec,
}

/// A contiguous block of registers read in one request
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRange {
    pub start_address: u16,
    pub count: u16,
    #[serde(default = "default_register_kind")]
    pub fc: RegisterKind,
}

impl RegisterRange {
    /// Resolve a parameter's register index to an offset inside this window
    ///
    /// Absolute addressing wins when the index falls inside the window;
    /// otherwise an index smaller than `count` is taken as relative.
    pub fn resolve_index(&self, register_index: u16) -> Option<u16> {
        let end = u32::from(self.start_address) + u32::from(self.count);
        if register_index >= self.start_address && u32::from(register_index) < end {
            Some(register_index - self.start_address)
        } else if register_index < self.count {
            Some(register_index)
        } else {
            None
        }
    }
}

/// Modbus read table selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum RegisterKind {
    Coil = 1,
    DiscreteInput = 2,
    Holding = 3,
    Input = 4,
}

impl RegisterKind {
    /// Read function code on the wire
    pub fn function_code(&self) -> u8 {
        *self as u8
    }

    /// Whether this table holds single bits rather than 16-bit words
    pub fn is_bit_table(&self) -> bool {
        matches!(self, RegisterKind::Coil | RegisterKind::DiscreteInput)
    }

    /// Largest count a single read request may carry
    pub fn max_count(&self) -> u16 {
        if self.is_bit_table() {
            2000
        } else {
            125
        }
    }
}

impl TryFrom<u8> for RegisterKind {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(RegisterKind::Coil),
            2 => Ok(RegisterKind::DiscreteInput),
            3 => Ok(RegisterKind::Holding),
            4 => Ok(RegisterKind::Input),
            other => Err(format!("unsupported read function code: {other}")),
        }
    }
}

impl From<RegisterKind> for u8 {
    fn from(kind: RegisterKind) -> u8 {
        kind as u8
    }
}

/// Parser attached to a register range
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParserSpec {
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
}

/// One named value extracted from a register window
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterSpec {
    pub name: String,
    pub data_type: DataType,
    pub register_index: u16,
    /// Implied by the data type when absent
    pub word_count: Option<u8>,
    pub byte_order: Option<WordOrder>,
    pub scaling_factor: Option<f64>,
    pub scaling_equation: Option<String>,
    /// Digits after the decimal point; negative values disable rounding
    pub decimal_point: Option<i32>,
    pub unit: Option<String>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub bitmask: Option<u16>,
    pub bit_position: Option<u8>,
}

impl ParameterSpec {
    /// Number of 16-bit words this parameter occupies
    pub fn word_count(&self) -> u8 {
        self.word_count.unwrap_or_else(|| self.data_type.word_count())
    }
}

/// Typed interpretations of raw register words
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    #[serde(rename = "BIT")]
    Bit,
    #[serde(rename = "INT16")]
    Int16,
    #[serde(rename = "UINT16")]
    Uint16,
    #[serde(rename = "INT32")]
    Int32,
    #[serde(rename = "UINT32")]
    Uint32,
    #[serde(rename = "FLOAT32")]
    Float32,
}

impl DataType {
    /// Words implied by the type when the parameter does not override it
    pub fn word_count(&self) -> u8 {
        match self {
            DataType::Bit | DataType::Int16 | DataType::Uint16 => 1,
            DataType::Int32 | DataType::Uint32 | DataType::Float32 => 2,
        }
    }
}

/// Assembly order of register words into multi-byte values
///
/// ABCD notation: A is the most significant byte of the 32-bit value. For
/// single-word types only the leading byte pair matters (AB keeps the wire
/// order, BA swaps the two bytes of the word).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WordOrder {
    #[serde(rename = "ABCD")]
    Abcd,
    #[serde(rename = "CDAB")]
    Cdab,
    #[serde(rename = "BADC")]
    Badc,
    #[serde(rename = "DCBA")]
    Dcba,
}

impl WordOrder {
    /// Whether a single-word value has its two bytes swapped
    pub fn swaps_single_word(&self) -> bool {
        matches!(self, WordOrder::Badc | WordOrder::Dcba)
    }
}

fn default_enabled() -> bool {
    true
}

fn default_polling_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL.as_millis() as u64
}

fn default_unit_id() -> u8 {
    1
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_retry_interval_ms() -> u64 {
    1000
}

fn default_auto_reconnect() -> bool {
    true
}

fn default_reconnect_interval_ms() -> u64 {
    5000
}

fn default_register_kind() -> RegisterKind {
    RegisterKind::Holding
}
