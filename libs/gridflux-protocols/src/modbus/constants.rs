//! Modbus protocol constants

/// MBAP header length: transaction id (2) + protocol id (2) + length (2) + unit id (1)
pub const MBAP_HEADER_LEN: usize = 7;

/// Maximum PDU size per the Modbus specification
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum value of the MBAP length field: unit id (1) + PDU (253)
pub const MAX_MBAP_LENGTH: usize = 254;

/// Protocol identifier carried in every MBAP header
pub const PROTOCOL_ID: u16 = 0;

/// Limits per request, from the Modbus application protocol
pub const MAX_READ_BITS: u16 = 2000;
pub const MAX_READ_REGISTERS: u16 = 125;
pub const MAX_WRITE_BITS: u16 = 1968;
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// Receive buffer that fits any TCP or RTU frame
pub const RESPONSE_BUFFER_SIZE: usize = 512;

/// Bits on the line per character in RTU mode: start + 8 data + parity/stop
pub const RTU_CHAR_BITS: u32 = 11;
