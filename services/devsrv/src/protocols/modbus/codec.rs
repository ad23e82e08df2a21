//! Request builders and response parsers for the supported function codes
//!
//! Pure functions over [`ModbusPdu`]; no I/O. Supported: FC 1, 2, 3, 4 reads
//! and FC 5, 6, 16 writes.

use super::constants::{
    EXCEPTION_FLAG, FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_COIL, FC_WRITE_SINGLE_REGISTER,
    MAX_WRITE_REGISTERS,
};
use super::pdu::ModbusPdu;
use crate::core::transport::{ExceptionCode, TransportError};
use crate::model::RegisterKind;

/// Build a read request for FC 1/2/3/4
pub fn build_read_request(
    kind: RegisterKind,
    address: u16,
    count: u16,
) -> Result<ModbusPdu, TransportError> {
    if count == 0 || count > kind.max_count() {
        return Err(TransportError::Protocol(format!(
            "invalid count {count} for FC{}",
            kind.function_code()
        )));
    }

    let mut pdu = ModbusPdu::new();
    pdu.push(kind.function_code())?;
    pdu.push_u16(address)?;
    pdu.push_u16(count)?;
    Ok(pdu)
}

/// Build an FC 5 write-single-coil request (0xFF00 on, 0x0000 off)
pub fn build_write_single_coil(address: u16, on: bool) -> Result<ModbusPdu, TransportError> {
    let mut pdu = ModbusPdu::new();
    pdu.push(FC_WRITE_SINGLE_COIL)?;
    pdu.push_u16(address)?;
    pdu.push_u16(if on { 0xFF00 } else { 0x0000 })?;
    Ok(pdu)
}

/// Build an FC 6 write-single-register request
pub fn build_write_single_register(address: u16, value: u16) -> Result<ModbusPdu, TransportError> {
    let mut pdu = ModbusPdu::new();
    pdu.push(FC_WRITE_SINGLE_REGISTER)?;
    pdu.push_u16(address)?;
    pdu.push_u16(value)?;
    Ok(pdu)
}

/// Build an FC 16 write-multiple-registers request
pub fn build_write_multiple_registers(
    address: u16,
    values: &[u16],
) -> Result<ModbusPdu, TransportError> {
    if values.is_empty() || values.len() > MAX_WRITE_REGISTERS as usize {
        return Err(TransportError::Protocol(format!(
            "invalid register count {} for FC16",
            values.len()
        )));
    }

    let mut pdu = ModbusPdu::new();
    pdu.push(FC_WRITE_MULTIPLE_REGISTERS)?;
    pdu.push_u16(address)?;
    pdu.push_u16(values.len() as u16)?;
    pdu.push((values.len() * 2) as u8)?;
    for &value in values {
        pdu.push_u16(value)?;
    }
    Ok(pdu)
}

/// Reject exception responses and mismatched function code echoes
pub fn check_response_kind(pdu: &ModbusPdu, expected_fc: u8) -> Result<(), TransportError> {
    let Some(fc) = pdu.function_code() else {
        return Err(TransportError::Protocol("empty response PDU".to_string()));
    };

    if fc == expected_fc | EXCEPTION_FLAG {
        let code = pdu.exception_code().unwrap_or(0);
        return Err(TransportError::ModbusException(ExceptionCode::from_code(
            code,
        )));
    }
    if fc != expected_fc {
        return Err(TransportError::Protocol(format!(
            "function code mismatch: expected 0x{expected_fc:02X}, got 0x{fc:02X}"
        )));
    }
    Ok(())
}

/// Parse an FC 3/4 response into register words
pub fn parse_read_words(
    pdu: &ModbusPdu,
    kind: RegisterKind,
    expected_count: u16,
) -> Result<Vec<u16>, TransportError> {
    check_response_kind(pdu, kind.function_code())?;

    let data = pdu.as_slice();
    if data.len() < 2 {
        return Err(TransportError::Protocol("truncated read response".to_string()));
    }

    let byte_count = data[1] as usize;
    let payload = &data[2..];
    if byte_count != payload.len() || byte_count != expected_count as usize * 2 {
        return Err(TransportError::Protocol(format!(
            "bad byte count: header {}, payload {}, expected {}",
            byte_count,
            payload.len(),
            expected_count * 2
        )));
    }

    Ok(payload
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// Parse an FC 1/2 response into bit values
pub fn parse_read_bits(
    pdu: &ModbusPdu,
    kind: RegisterKind,
    expected_count: u16,
) -> Result<Vec<bool>, TransportError> {
    check_response_kind(pdu, kind.function_code())?;

    let data = pdu.as_slice();
    if data.len() < 2 {
        return Err(TransportError::Protocol("truncated read response".to_string()));
    }

    let byte_count = data[1] as usize;
    let payload = &data[2..];
    let needed = (expected_count as usize).div_ceil(8);
    if byte_count != payload.len() || byte_count != needed {
        return Err(TransportError::Protocol(format!(
            "bad byte count: header {}, payload {}, expected {}",
            byte_count,
            payload.len(),
            needed
        )));
    }

    let mut bits = Vec::with_capacity(expected_count as usize);
    for i in 0..expected_count as usize {
        let byte = payload[i / 8];
        bits.push(byte & (1 << (i % 8)) != 0);
    }
    Ok(bits)
}

/// Validate a write acknowledgement (FC 5/6 echo, FC 16 summary)
pub fn parse_write_response(pdu: &ModbusPdu, expected_fc: u8) -> Result<(), TransportError> {
    check_response_kind(pdu, expected_fc)?;

    // FC 5/6 echo address+value, FC 16 echoes address+quantity; both are
    // 5 bytes including the function code.
    if pdu.len() != 5 {
        return Err(TransportError::Protocol(format!(
            "unexpected write acknowledgement length: {}",
            pdu.len()
        )));
    }
    Ok(())
}

/// Bytes an RTU reader still needs after the leading [unit, fc, third] bytes
///
/// Exception frames are 5 bytes total, read responses are sized by the byte
/// count in the third position, write acknowledgements are fixed at 8.
pub fn rtu_remaining_len(function_code: u8, third_byte: u8) -> Result<usize, TransportError> {
    if function_code & EXCEPTION_FLAG != 0 {
        return Ok(2);
    }
    match function_code {
        0x01 | 0x02 | 0x03 | 0x04 => Ok(third_byte as usize + 2),
        0x05 | 0x06 | 0x10 => Ok(5),
        other => Err(TransportError::Protocol(format!(
            "unexpected function code in response: 0x{other:02X}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_read_request_layout() {
        let pdu = build_read_request(RegisterKind::Holding, 100, 2).unwrap();
        assert_eq!(pdu.as_slice(), &[0x03, 0x00, 0x64, 0x00, 0x02]);
    }

    #[test]
    fn test_build_read_request_limits() {
        assert!(build_read_request(RegisterKind::Holding, 0, 125).is_ok());
        assert!(build_read_request(RegisterKind::Holding, 0, 126).is_err());
        assert!(build_read_request(RegisterKind::Coil, 0, 2000).is_ok());
        assert!(build_read_request(RegisterKind::Coil, 0, 2001).is_err());
        assert!(build_read_request(RegisterKind::Input, 0, 0).is_err());
    }

    #[test]
    fn test_parse_read_words() {
        let pdu = ModbusPdu::from_slice(&[0x03, 0x04, 0x42, 0x48, 0xF5, 0xC3]).unwrap();
        let words = parse_read_words(&pdu, RegisterKind::Holding, 2).unwrap();
        assert_eq!(words, vec![0x4248, 0xF5C3]);
    }

    #[test]
    fn test_parse_read_words_bad_byte_count() {
        let pdu = ModbusPdu::from_slice(&[0x03, 0x04, 0x42, 0x48]).unwrap();
        assert!(matches!(
            parse_read_words(&pdu, RegisterKind::Holding, 2),
            Err(TransportError::Protocol(_))
        ));
    }

    #[test]
    fn test_parse_read_bits_unpacks_lsb_first() {
        // 10 bits: 0b0000_0101, 0b0000_0010 -> bits 0,2 then bit 9
        let pdu = ModbusPdu::from_slice(&[0x01, 0x02, 0x05, 0x02]).unwrap();
        let bits = parse_read_bits(&pdu, RegisterKind::Coil, 10).unwrap();
        assert_eq!(bits.len(), 10);
        assert!(bits[0] && bits[2] && bits[9]);
        assert!(!bits[1] && !bits[8]);
    }

    #[test]
    fn test_exception_response_mapped() {
        let pdu = ModbusPdu::from_slice(&[0x83, 0x02]).unwrap();
        let err = parse_read_words(&pdu, RegisterKind::Holding, 2).unwrap_err();
        assert_eq!(
            err,
            TransportError::ModbusException(ExceptionCode::IllegalAddress)
        );
    }

    #[test]
    fn test_function_code_echo_mismatch() {
        let pdu = ModbusPdu::from_slice(&[0x04, 0x02, 0x00, 0x01]).unwrap();
        assert!(matches!(
            parse_read_words(&pdu, RegisterKind::Holding, 1),
            Err(TransportError::Protocol(_))
        ));
    }

    #[test]
    fn test_write_builders() {
        assert_eq!(
            build_write_single_coil(8, true).unwrap().as_slice(),
            &[0x05, 0x00, 0x08, 0xFF, 0x00]
        );
        assert_eq!(
            build_write_single_register(16, 0x1234).unwrap().as_slice(),
            &[0x06, 0x00, 0x10, 0x12, 0x34]
        );
        assert_eq!(
            build_write_multiple_registers(5, &[0x000A, 0x0102])
                .unwrap()
                .as_slice(),
            &[0x10, 0x00, 0x05, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02]
        );
        assert!(build_write_multiple_registers(0, &[]).is_err());
        assert!(build_write_multiple_registers(0, &vec![0u16; 124]).is_err());
    }

    #[test]
    fn test_parse_write_response() {
        let pdu = ModbusPdu::from_slice(&[0x06, 0x00, 0x10, 0x12, 0x34]).unwrap();
        assert!(parse_write_response(&pdu, 0x06).is_ok());

        let exc = ModbusPdu::from_slice(&[0x86, 0x01]).unwrap();
        assert_eq!(
            parse_write_response(&exc, 0x06).unwrap_err(),
            TransportError::ModbusException(ExceptionCode::IllegalFunction)
        );
    }

    #[test]
    fn test_rtu_remaining_len() {
        assert_eq!(rtu_remaining_len(0x83, 0x02).unwrap(), 2);
        assert_eq!(rtu_remaining_len(0x03, 0x04).unwrap(), 6);
        assert_eq!(rtu_remaining_len(0x06, 0x00).unwrap(), 5);
        assert!(rtu_remaining_len(0x2B, 0x00).is_err());
    }
}
