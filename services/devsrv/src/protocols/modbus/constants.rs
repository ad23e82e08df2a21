//! Modbus protocol constants

/// Maximum PDU size in bytes (function code + data)
pub const MAX_PDU_SIZE: usize = 253;

/// MBAP header length for Modbus TCP
pub const MBAP_HEADER_LEN: usize = 7;

/// CRC trailer length for Modbus RTU
pub const RTU_CRC_LEN: usize = 2;

/// Register count limit for FC 3 / FC 4 reads
pub const MAX_READ_REGISTERS: u16 = 125;

/// Register count limit for FC 16 writes
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// Bit count limit for FC 1 / FC 2 reads
pub const MAX_READ_BITS: u16 = 2000;

/// Function codes used by the gateway
pub const FC_READ_COILS: u8 = 0x01;
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Exception responses set the high bit of the echoed function code
pub const EXCEPTION_FLAG: u8 = 0x80;
