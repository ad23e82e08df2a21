//! Modbus protocol support: PDU/ADU codecs and the exchange client

pub mod client;
pub mod codec;
pub mod constants;
pub mod frame;
pub mod pdu;

pub use client::{ClientOptions, ModbusClient, ModbusMode};
pub use frame::MbapHeader;
pub use pdu::ModbusPdu;
