//! Data model for device definitions and published readings

pub mod device;
pub mod reading;

pub use device::{
    clamp_poll_interval, AdvancedSettings, Connection, ConnectionOptions, DataPoint, DataType,
    DeviceDefinition, Parity, ParameterSpec, RegisterKind, RegisterRange, WordOrder,
};
pub use reading::{PollerState, PollerStatus, PollingStats, Reading, Snapshot};
