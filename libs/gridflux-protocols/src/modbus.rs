//! Modbus protocol implementation
//!
//! Components, wire level first:
//!
//! ```text
//! modbus
//!     ├── pdu         request/response PDU construction and parsing
//!     ├── frame       MBAP and RTU framing, CRC, transaction pairing
//!     ├── connection  TCP and serial line I/O with per-call deadlines
//!     ├── codec       typed extraction spec: data types, bit index,
//!     │               byte/word order, scale, offset, precision
//!     ├── client      single-flight master with retry and send gap
//!     └── server      in-memory register bank serving FC 1-6, 15, 16
//! ```
//!
//! Function codes 1, 2, 3, 4, 5, 6, 15 and 16 are supported end to end;
//! exception responses carry the function code with the high bit set plus a
//! one-byte exception code.

mod client;
mod codec;
mod connection;
mod constants;
mod frame;
mod pdu;
mod server;
mod types;

pub use client::{LinkStats, MasterState, ModbusMaster};
pub use codec::{decode_bits, decode_block, decode_words, encode_bit, encode_words, ExtractSpec};
pub use connection::ModbusConnection;
pub use constants::{
    MAX_MBAP_LENGTH, MAX_PDU_SIZE, MAX_READ_BITS, MAX_READ_REGISTERS, MAX_WRITE_BITS,
    MAX_WRITE_REGISTERS, MBAP_HEADER_LEN, RESPONSE_BUFFER_SIZE,
};
pub use frame::{
    crc16, decode_mbap, decode_rtu, encode_mbap, encode_rtu, FrameCodec, FrameMode, MbapHeader,
};
pub use pdu::ModbusPdu;
pub use server::{ModbusRtuServer, ModbusTcpServer, RegisterBank};
pub use types::{
    DataType, ExceptionCode, MasterConfig, MasterEndpoint, Parity, RegKind, RegisterBlock,
    SerialConfig, TcpEndpoint, TransportKind,
};
