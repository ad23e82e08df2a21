//! ADU framing for Modbus TCP (MBAP) and RTU (address + CRC)

use super::constants::{MBAP_HEADER_LEN, RTU_CRC_LEN};
use super::pdu::ModbusPdu;
use crate::core::transport::TransportError;

/// MBAP header carried by every Modbus TCP ADU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Byte count of unit id + PDU
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn new(transaction_id: u16, unit_id: u8, pdu_len: usize) -> Self {
        Self {
            transaction_id,
            protocol_id: 0,
            length: pdu_len as u16 + 1,
            unit_id,
        }
    }

    pub fn to_bytes(self) -> [u8; MBAP_HEADER_LEN] {
        let mut bytes = [0u8; MBAP_HEADER_LEN];
        bytes[0..2].copy_from_slice(&self.transaction_id.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.protocol_id.to_be_bytes());
        bytes[4..6].copy_from_slice(&self.length.to_be_bytes());
        bytes[6] = self.unit_id;
        bytes
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, TransportError> {
        if data.len() < MBAP_HEADER_LEN {
            return Err(TransportError::Protocol(
                "short MBAP header".to_string(),
            ));
        }

        let header = Self {
            transaction_id: u16::from_be_bytes([data[0], data[1]]),
            protocol_id: u16::from_be_bytes([data[2], data[3]]),
            length: u16::from_be_bytes([data[4], data[5]]),
            unit_id: data[6],
        };

        if header.protocol_id != 0 {
            return Err(TransportError::Protocol(format!(
                "invalid MBAP protocol id: {}",
                header.protocol_id
            )));
        }
        if header.length < 2 || header.length as usize > super::constants::MAX_PDU_SIZE + 1 {
            return Err(TransportError::Protocol(format!(
                "invalid MBAP length: {}",
                header.length
            )));
        }

        Ok(header)
    }

    /// PDU byte count following the header
    pub fn pdu_len(&self) -> usize {
        self.length as usize - 1
    }
}

/// Assemble a TCP ADU
pub fn build_tcp_adu(transaction_id: u16, unit_id: u8, pdu: &ModbusPdu) -> Vec<u8> {
    let header = MbapHeader::new(transaction_id, unit_id, pdu.len());
    let mut adu = Vec::with_capacity(MBAP_HEADER_LEN + pdu.len());
    adu.extend_from_slice(&header.to_bytes());
    adu.extend_from_slice(pdu.as_slice());
    adu
}

/// Assemble an RTU ADU: address, PDU, CRC-16 little-endian
pub fn build_rtu_adu(unit_id: u8, pdu: &ModbusPdu) -> Vec<u8> {
    let mut adu = Vec::with_capacity(1 + pdu.len() + RTU_CRC_LEN);
    adu.push(unit_id);
    adu.extend_from_slice(pdu.as_slice());
    let crc = crc16(&adu);
    adu.extend_from_slice(&crc.to_le_bytes());
    adu
}

/// Validate an RTU ADU and extract its PDU
pub fn parse_rtu_adu(frame: &[u8], expected_unit: u8) -> Result<ModbusPdu, TransportError> {
    if frame.len() < 1 + 1 + RTU_CRC_LEN {
        return Err(TransportError::Protocol(format!(
            "short RTU frame: {} bytes",
            frame.len()
        )));
    }

    let payload_end = frame.len() - RTU_CRC_LEN;
    let received = u16::from_le_bytes([frame[payload_end], frame[payload_end + 1]]);
    let computed = crc16(&frame[..payload_end]);
    if received != computed {
        return Err(TransportError::Protocol(format!(
            "CRC mismatch: expected 0x{computed:04X}, got 0x{received:04X}"
        )));
    }

    if frame[0] != expected_unit {
        return Err(TransportError::Protocol(format!(
            "unit id mismatch: expected {}, got {}",
            expected_unit, frame[0]
        )));
    }

    ModbusPdu::from_slice(&frame[1..payload_end])
}

/// CRC-16/MODBUS: polynomial 0xA001 (reflected), initial value 0xFFFF
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = 0xFFFFu16;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}
