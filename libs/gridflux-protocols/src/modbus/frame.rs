//! Modbus framing
//!
//! TCP frames carry an MBAP header (transaction id, protocol id 0, length,
//! unit id) in front of the PDU. RTU frames carry the unit id, the PDU and a
//! CRC-16 appended little-endian. [`FrameCodec`] is the master-side layer
//! that assigns transaction ids and pairs each response with the one request
//! in flight.

use gridflux_comlink::{LinkError, Result};
use tracing::debug;

use super::constants::{MAX_MBAP_LENGTH, MBAP_HEADER_LEN, PROTOCOL_ID};
use super::pdu::ModbusPdu;

// ============================================================================
// CRC-16 (Modbus polynomial 0xA001)
// ============================================================================

/// CRC-16 over unit id and PDU, as appended to RTU frames
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc >>= 1;
                crc ^= 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

// ============================================================================
// MBAP
// ============================================================================

/// The Modbus TCP application header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub length: u16,
    pub unit_id: u8,
}

/// Build a complete TCP frame
pub fn encode_mbap(transaction_id: u16, unit_id: u8, pdu: &ModbusPdu) -> Vec<u8> {
    let length = (pdu.len() + 1) as u16;
    let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + pdu.len());
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&PROTOCOL_ID.to_be_bytes());
    frame.extend_from_slice(&length.to_be_bytes());
    frame.push(unit_id);
    frame.extend_from_slice(pdu.as_slice());
    frame
}

/// Split a complete TCP frame into header and PDU
pub fn decode_mbap(data: &[u8]) -> Result<(MbapHeader, ModbusPdu)> {
    if data.len() < MBAP_HEADER_LEN + 1 {
        return Err(LinkError::protocol("TCP frame too short"));
    }
    let header = MbapHeader {
        transaction_id: u16::from_be_bytes([data[0], data[1]]),
        protocol_id: u16::from_be_bytes([data[2], data[3]]),
        length: u16::from_be_bytes([data[4], data[5]]),
        unit_id: data[6],
    };
    if header.protocol_id != PROTOCOL_ID {
        return Err(LinkError::protocol(format!(
            "invalid protocol id: {}",
            header.protocol_id
        )));
    }
    let length = usize::from(header.length);
    if length == 0 || length > MAX_MBAP_LENGTH {
        return Err(LinkError::protocol(format!(
            "invalid MBAP length: {}",
            header.length
        )));
    }
    if data.len() != MBAP_HEADER_LEN + length {
        return Err(LinkError::protocol(format!(
            "MBAP length {} does not match frame of {} bytes",
            header.length,
            data.len()
        )));
    }
    let pdu = ModbusPdu::from_slice(&data[MBAP_HEADER_LEN + 1..])?;
    Ok((header, pdu))
}

// ============================================================================
// RTU
// ============================================================================

/// Build a complete RTU frame: unit id, PDU, CRC-16 little-endian
pub fn encode_rtu(unit_id: u8, pdu: &ModbusPdu) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + pdu.len() + 2);
    frame.push(unit_id);
    frame.extend_from_slice(pdu.as_slice());
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Split and CRC-check a complete RTU frame
pub fn decode_rtu(data: &[u8]) -> Result<(u8, ModbusPdu)> {
    if data.len() < 4 {
        return Err(LinkError::protocol("RTU frame too short"));
    }
    let body = &data[..data.len() - 2];
    let received = u16::from_le_bytes([data[data.len() - 2], data[data.len() - 1]]);
    let computed = crc16(body);
    if received != computed {
        return Err(LinkError::Crc {
            expected: computed,
            actual: received,
        });
    }
    let pdu = ModbusPdu::from_slice(&body[1..])?;
    Ok((body[0], pdu))
}

// ============================================================================
// Master-side framing with transaction pairing
// ============================================================================

/// Transport mode of a [`FrameCodec`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameMode {
    Tcp,
    Rtu,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    transaction_id: u16,
    function: u8,
    unit_id: u8,
}

/// Frame builder/parser for a single-flight master
///
/// The master never pipelines, so at most one request is outstanding; the
/// codec remembers it and rejects responses that do not belong to it (stale
/// replies from a previous timeout, or traffic for another unit).
#[derive(Debug)]
pub struct FrameCodec {
    mode: FrameMode,
    next_transaction_id: u16,
    pending: Option<Pending>,
}

impl FrameCodec {
    pub fn new(mode: FrameMode) -> Self {
        Self {
            mode,
            next_transaction_id: 1,
            pending: None,
        }
    }

    pub fn mode(&self) -> FrameMode {
        self.mode
    }

    /// Build the next request frame and remember it as in flight
    pub fn build_request(&mut self, unit_id: u8, pdu: &ModbusPdu) -> Vec<u8> {
        let transaction_id = self.next_transaction_id;
        self.next_transaction_id = self.next_transaction_id.wrapping_add(1).max(1);
        self.pending = Some(Pending {
            transaction_id,
            function: pdu.function_code().unwrap_or(0),
            unit_id,
        });
        match self.mode {
            FrameMode::Tcp => encode_mbap(transaction_id, unit_id, pdu),
            FrameMode::Rtu => encode_rtu(unit_id, pdu),
        }
    }

    /// Parse a response frame and match it against the request in flight
    pub fn parse_response(&mut self, data: &[u8]) -> Result<(u8, ModbusPdu)> {
        let pending = self
            .pending
            .ok_or_else(|| LinkError::protocol("response with no request in flight"))?;

        let (unit_id, pdu) = match self.mode {
            FrameMode::Tcp => {
                let (header, pdu) = decode_mbap(data)?;
                if header.transaction_id != pending.transaction_id {
                    debug!(
                        got = header.transaction_id,
                        want = pending.transaction_id,
                        "ignoring stale transaction id"
                    );
                    return Err(LinkError::protocol("transaction id mismatch"));
                }
                (header.unit_id, pdu)
            }
            FrameMode::Rtu => decode_rtu(data)?,
        };

        if unit_id != pending.unit_id {
            return Err(LinkError::protocol(format!(
                "response from unit {} while unit {} was addressed",
                unit_id, pending.unit_id
            )));
        }
        if pdu.function_code() != Some(pending.function) {
            return Err(LinkError::protocol(format!(
                "function code mismatch: sent {:02X}, got {:02X}",
                pending.function,
                pdu.function_code().unwrap_or(0)
            )));
        }

        self.pending = None;
        Ok((unit_id, pdu))
    }

    /// Forget the request in flight, e.g. after a timeout
    pub fn abort_pending(&mut self) {
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_known_vector() {
        // Read holding register 0 of unit 1; the reference CRC bytes on the
        // wire are 84 0A
        let data = [0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        assert_eq!(crc16(&data), 0x0A84);
    }

    #[test]
    fn test_crc16_empty() {
        assert_eq!(crc16(&[]), 0xFFFF);
    }

    #[test]
    fn test_mbap_roundtrip() {
        let pdu = ModbusPdu::read_request(3, 0x0001, 2).unwrap();
        let frame = encode_mbap(0x1234, 9, &pdu);
        assert_eq!(frame.len(), MBAP_HEADER_LEN + 5);
        assert_eq!(&frame[..2], &[0x12, 0x34]);
        assert_eq!(&frame[2..4], &[0x00, 0x00]);
        assert_eq!(&frame[4..6], &[0x00, 0x06]);
        assert_eq!(frame[6], 9);

        let (header, parsed) = decode_mbap(&frame).unwrap();
        assert_eq!(header.transaction_id, 0x1234);
        assert_eq!(header.unit_id, 9);
        assert_eq!(parsed.as_slice(), pdu.as_slice());
    }

    #[test]
    fn test_mbap_rejects_bad_protocol_id() {
        let pdu = ModbusPdu::read_request(3, 0, 1).unwrap();
        let mut frame = encode_mbap(1, 1, &pdu);
        frame[3] = 0x01;
        assert!(decode_mbap(&frame).is_err());
    }

    #[test]
    fn test_mbap_rejects_length_mismatch() {
        let pdu = ModbusPdu::read_request(3, 0, 1).unwrap();
        let mut frame = encode_mbap(1, 1, &pdu);
        frame.push(0xAA);
        assert!(decode_mbap(&frame).is_err());
    }

    #[test]
    fn test_rtu_roundtrip() {
        let pdu = ModbusPdu::read_request(3, 0x0001, 2).unwrap();
        let frame = encode_rtu(1, &pdu);
        assert_eq!(frame.len(), 1 + 5 + 2);

        let (unit, parsed) = decode_rtu(&frame).unwrap();
        assert_eq!(unit, 1);
        assert_eq!(parsed.as_slice(), pdu.as_slice());
    }

    #[test]
    fn test_rtu_rejects_bad_crc() {
        let pdu = ModbusPdu::read_request(3, 0, 1).unwrap();
        let mut frame = encode_rtu(1, &pdu);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(matches!(
            decode_rtu(&frame).unwrap_err(),
            LinkError::Crc { .. }
        ));
    }

    #[test]
    fn test_codec_pairs_response() {
        let mut codec = FrameCodec::new(FrameMode::Tcp);
        let request = ModbusPdu::read_request(3, 0, 2).unwrap();
        let frame = codec.build_request(7, &request);
        let tid = u16::from_be_bytes([frame[0], frame[1]]);

        let response = ModbusPdu::registers_response(3, &[1, 2]).unwrap();
        let response_frame = encode_mbap(tid, 7, &response);
        let (unit, pdu) = codec.parse_response(&response_frame).unwrap();
        assert_eq!(unit, 7);
        assert_eq!(pdu.function_code(), Some(3));
    }

    #[test]
    fn test_codec_rejects_stale_transaction() {
        let mut codec = FrameCodec::new(FrameMode::Tcp);
        let request = ModbusPdu::read_request(3, 0, 2).unwrap();
        let frame = codec.build_request(7, &request);
        let tid = u16::from_be_bytes([frame[0], frame[1]]);

        let response = ModbusPdu::registers_response(3, &[1, 2]).unwrap();
        let stale = encode_mbap(tid.wrapping_add(5), 7, &response);
        assert!(codec.parse_response(&stale).is_err());
    }

    #[test]
    fn test_codec_rejects_foreign_unit() {
        let mut codec = FrameCodec::new(FrameMode::Rtu);
        let request = ModbusPdu::read_request(3, 0, 2).unwrap();
        codec.build_request(7, &request);

        let response = ModbusPdu::registers_response(3, &[1, 2]).unwrap();
        let frame = encode_rtu(8, &response);
        assert!(codec.parse_response(&frame).is_err());
    }

    #[test]
    fn test_transaction_id_skips_zero() {
        let mut codec = FrameCodec::new(FrameMode::Tcp);
        codec.next_transaction_id = 0xFFFF;
        let pdu = ModbusPdu::read_request(3, 0, 1).unwrap();
        let frame = codec.build_request(1, &pdu);
        assert_eq!(u16::from_be_bytes([frame[0], frame[1]]), 0xFFFF);
        let frame = codec.build_request(1, &pdu);
        assert_eq!(u16::from_be_bytes([frame[0], frame[1]]), 1);
    }
}
