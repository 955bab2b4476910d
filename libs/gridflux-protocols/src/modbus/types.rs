//! Modbus configuration and wire-level types

use std::time::Duration;

use gridflux_comlink::RegisterOrder;
use serde::{Deserialize, Serialize};

// ============================================================================
// Transport selection
// ============================================================================

/// How a channel reaches its bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Modbus TCP client
    Tcp,
    /// Serial line master
    RtuClient,
    /// Serial line slave (simulator)
    RtuServer,
    /// TCP listener slave (simulator)
    TcpServer,
}

impl TransportKind {
    pub fn is_server(&self) -> bool {
        matches!(self, TransportKind::RtuServer | TransportKind::TcpServer)
    }

    pub fn is_serial(&self) -> bool {
        matches!(self, TransportKind::RtuClient | TransportKind::RtuServer)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::RtuClient => "rtu-client",
            TransportKind::RtuServer => "rtu-server",
            TransportKind::TcpServer => "tcp-server",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Serial line parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

/// Serial line parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Device path like "/dev/ttyS0"
    pub device: String,
    pub baud: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
}

impl SerialConfig {
    pub fn display_name(&self) -> String {
        let parity = match self.parity {
            Parity::None => 'N',
            Parity::Even => 'E',
            Parity::Odd => 'O',
        };
        format!(
            "{}@{}-{}{}{}",
            self.device, self.baud, self.data_bits, parity, self.stop_bits
        )
    }
}

/// TCP endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpEndpoint {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for TcpEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// ============================================================================
// Register tables and data types
// ============================================================================

/// The four Modbus tables a point can live in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegKind {
    Coil,
    Discrete,
    Holding,
    Input,
}

impl RegKind {
    /// Parse the canonical names plus the YK/YX/YC/YT aliases found in
    /// imported point tables
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "coil" | "yk" => Some(RegKind::Coil),
            "discrete" | "discrete_input" | "yx" => Some(RegKind::Discrete),
            "holding" | "holding_register" | "yc" => Some(RegKind::Holding),
            "input" | "input_register" | "yt" => Some(RegKind::Input),
            _ => None,
        }
    }

    /// The read function code for this table
    pub fn read_function(&self) -> u8 {
        match self {
            RegKind::Coil => 1,
            RegKind::Discrete => 2,
            RegKind::Holding => 3,
            RegKind::Input => 4,
        }
    }

    /// Coils and discrete inputs carry bits; the register tables carry words
    pub fn is_bit_kind(&self) -> bool {
        matches!(self, RegKind::Coil | RegKind::Discrete)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RegKind::Coil => "coil",
            RegKind::Discrete => "discrete",
            RegKind::Holding => "holding",
            RegKind::Input => "input",
        }
    }
}

impl std::fmt::Display for RegKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Wire data type of a point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Bool,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float32,
    Float64,
    String,
    Bytes,
    Bitmask,
}

impl DataType {
    /// Parse the canonical names plus the short forms used in point tables
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "bool" | "boolean" => Some(DataType::Bool),
            "int16" | "i16" | "s16" => Some(DataType::Int16),
            "uint16" | "u16" => Some(DataType::Uint16),
            "int32" | "i32" | "s32" => Some(DataType::Int32),
            "uint32" | "u32" => Some(DataType::Uint32),
            "int64" | "i64" | "s64" => Some(DataType::Int64),
            "uint64" | "u64" => Some(DataType::Uint64),
            "float32" | "f32" | "float" => Some(DataType::Float32),
            "float64" | "f64" | "double" => Some(DataType::Float64),
            "string" | "str" => Some(DataType::String),
            "bytes" | "raw" => Some(DataType::Bytes),
            "bitmask" => Some(DataType::Bitmask),
            _ => None,
        }
    }

    /// Registers a value of this type occupies; `None` for variable-length
    /// types whose size comes from the point's quantity
    pub fn fixed_registers(&self) -> Option<u16> {
        match self {
            DataType::Bool | DataType::Int16 | DataType::Uint16 => Some(1),
            DataType::Int32 | DataType::Uint32 | DataType::Float32 => Some(2),
            DataType::Int64 | DataType::Uint64 | DataType::Float64 => Some(4),
            DataType::String | DataType::Bytes | DataType::Bitmask => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        !matches!(self, DataType::String | DataType::Bytes)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Bool => "bool",
            DataType::Int16 => "int16",
            DataType::Uint16 => "uint16",
            DataType::Int32 => "int32",
            DataType::Uint32 => "uint32",
            DataType::Int64 => "int64",
            DataType::Uint64 => "uint64",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
            DataType::String => "string",
            DataType::Bytes => "bytes",
            DataType::Bitmask => "bitmask",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Exception codes
// ============================================================================

/// Standard exception codes returned by slaves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    SlaveDeviceFailure,
    Acknowledge,
    SlaveDeviceBusy,
    MemoryParityError,
    GatewayPathUnavailable,
    GatewayTargetFailed,
    Other(u8),
}

impl ExceptionCode {
    pub fn as_u8(&self) -> u8 {
        match self {
            ExceptionCode::IllegalFunction => 0x01,
            ExceptionCode::IllegalDataAddress => 0x02,
            ExceptionCode::IllegalDataValue => 0x03,
            ExceptionCode::SlaveDeviceFailure => 0x04,
            ExceptionCode::Acknowledge => 0x05,
            ExceptionCode::SlaveDeviceBusy => 0x06,
            ExceptionCode::MemoryParityError => 0x08,
            ExceptionCode::GatewayPathUnavailable => 0x0A,
            ExceptionCode::GatewayTargetFailed => 0x0B,
            ExceptionCode::Other(code) => *code,
        }
    }

    pub fn from_u8(code: u8) -> Self {
        match code {
            0x01 => ExceptionCode::IllegalFunction,
            0x02 => ExceptionCode::IllegalDataAddress,
            0x03 => ExceptionCode::IllegalDataValue,
            0x04 => ExceptionCode::SlaveDeviceFailure,
            0x05 => ExceptionCode::Acknowledge,
            0x06 => ExceptionCode::SlaveDeviceBusy,
            0x08 => ExceptionCode::MemoryParityError,
            0x0A => ExceptionCode::GatewayPathUnavailable,
            0x0B => ExceptionCode::GatewayTargetFailed,
            other => ExceptionCode::Other(other),
        }
    }
}

// ============================================================================
// Master configuration
// ============================================================================

/// Where the master connects
#[derive(Debug, Clone, PartialEq)]
pub enum MasterEndpoint {
    Tcp {
        primary: TcpEndpoint,
        backup: Option<TcpEndpoint>,
    },
    Rtu(SerialConfig),
}

impl MasterEndpoint {
    pub fn display_name(&self) -> String {
        match self {
            MasterEndpoint::Tcp { primary, .. } => format!("tcp://{}", primary),
            MasterEndpoint::Rtu(serial) => format!("rtu://{}", serial.display_name()),
        }
    }
}

/// Everything a [`super::ModbusMaster`] needs to drive one bus
#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub endpoint: MasterEndpoint,
    /// Per-request deadline; retries reuse it, they do not extend it
    pub timeout: Duration,
    /// Minimum gap between consecutive transactions on the bus
    pub send_interval: Duration,
    /// Extra attempts after a timeout or framing error
    pub retry_max: u32,
    /// Pause between attempts
    pub retry_delay: Duration,
    /// Channel-level byte/word ordering, overridable per point
    pub order: RegisterOrder,
}

impl MasterConfig {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            endpoint: MasterEndpoint::Tcp {
                primary: TcpEndpoint {
                    host: host.into(),
                    port,
                },
                backup: None,
            },
            timeout: Duration::from_millis(500),
            send_interval: Duration::from_millis(200),
            retry_max: 0,
            retry_delay: Duration::from_millis(300),
            order: RegisterOrder::default(),
        }
    }
}

// ============================================================================
// Read results
// ============================================================================

/// A raw register group as returned by one read request
#[derive(Debug, Clone, PartialEq)]
pub enum RegisterBlock {
    /// From holding or input registers
    Words(Vec<u16>),
    /// From coils or discrete inputs
    Bits(Vec<bool>),
}

impl RegisterBlock {
    pub fn len(&self) -> usize {
        match self {
            RegisterBlock::Words(w) => w.len(),
            RegisterBlock::Bits(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reg_kind_aliases() {
        assert_eq!(RegKind::parse("coil"), Some(RegKind::Coil));
        assert_eq!(RegKind::parse("YK"), Some(RegKind::Coil));
        assert_eq!(RegKind::parse("YX"), Some(RegKind::Discrete));
        assert_eq!(RegKind::parse("YC"), Some(RegKind::Holding));
        assert_eq!(RegKind::parse("YT"), Some(RegKind::Input));
        assert_eq!(RegKind::parse("bogus"), None);
    }

    #[test]
    fn test_read_function_codes() {
        assert_eq!(RegKind::Coil.read_function(), 1);
        assert_eq!(RegKind::Discrete.read_function(), 2);
        assert_eq!(RegKind::Holding.read_function(), 3);
        assert_eq!(RegKind::Input.read_function(), 4);
    }

    #[test]
    fn test_data_type_parse() {
        assert_eq!(DataType::parse("u16"), Some(DataType::Uint16));
        assert_eq!(DataType::parse("FLOAT32"), Some(DataType::Float32));
        assert_eq!(DataType::parse("double"), Some(DataType::Float64));
        assert_eq!(DataType::parse("nope"), None);
    }

    #[test]
    fn test_fixed_registers() {
        assert_eq!(DataType::Uint16.fixed_registers(), Some(1));
        assert_eq!(DataType::Float32.fixed_registers(), Some(2));
        assert_eq!(DataType::Uint64.fixed_registers(), Some(4));
        assert_eq!(DataType::String.fixed_registers(), None);
    }

    #[test]
    fn test_exception_code_roundtrip() {
        for code in [0x01u8, 0x02, 0x03, 0x04, 0x05, 0x06, 0x08, 0x0A, 0x0B, 0x7F] {
            assert_eq!(ExceptionCode::from_u8(code).as_u8(), code);
        }
    }

    #[test]
    fn test_transport_kind_serde() {
        let kind: TransportKind = serde_json::from_str("\"rtu-client\"").unwrap();
        assert_eq!(kind, TransportKind::RtuClient);
        assert!(kind.is_serial());
        assert!(!kind.is_server());
        assert!(TransportKind::TcpServer.is_server());
    }
}
