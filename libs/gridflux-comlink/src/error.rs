//! Link Error Types
//!
//! Core error type shared by transports, codecs and protocol clients.

use thiserror::Error;

/// Result type for gridflux-comlink operations
pub type Result<T> = std::result::Result<T, LinkError>;

/// Communication link errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LinkError {
    /// Protocol-level errors (malformed frames, unexpected replies)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Connection errors (open/accept failures, peer resets)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Operation attempted on a closed link
    #[error("Not connected")]
    NotConnected,

    /// IO errors
    #[error("IO error: {0}")]
    Io(String),

    /// Per-request deadline expired
    #[error("Timeout: {0}")]
    Timeout(String),

    /// RTU frame checksum mismatch
    #[error("CRC mismatch: expected {expected:#06X}, got {actual:#06X}")]
    Crc { expected: u16, actual: u16 },

    /// Exception response from a slave (function code with the high bit set)
    #[error(
        "Modbus exception: function {function:#04X}, code {code:#04X} ({name})",
        name = exception_name(*.code)
    )]
    Exception { function: u8, code: u8 },

    /// A typed getter was applied to a value of another kind
    #[error("Kind mismatch: want {want}, got {got}")]
    KindMismatch {
        want: &'static str,
        got: &'static str,
    },

    /// Raw buffer length does not match the declared type
    #[error("Out of range: {0}")]
    OutOfRange(String),

    /// Invalid payload data
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The owning scope was cancelled; a clean exit, not a fault
    #[error("Cancelled")]
    Cancelled,
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        LinkError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for LinkError {
    fn from(err: serde_json::Error) -> Self {
        LinkError::InvalidData(format!("JSON error: {}", err))
    }
}

/// Standard exception code names
pub fn exception_name(code: u8) -> &'static str {
    match code {
        0x01 => "Illegal Function",
        0x02 => "Illegal Data Address",
        0x03 => "Illegal Data Value",
        0x04 => "Slave Device Failure",
        0x05 => "Acknowledge",
        0x06 => "Slave Device Busy",
        0x08 => "Memory Parity Error",
        0x0A => "Gateway Path Unavailable",
        0x0B => "Gateway Target Device Failed to Respond",
        _ => "Unknown Exception",
    }
}

// Helper constructors
impl LinkError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        LinkError::Protocol(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        LinkError::Connection(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        LinkError::Io(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        LinkError::Timeout(msg.into())
    }

    pub fn invalid_data(msg: impl Into<String>) -> Self {
        LinkError::InvalidData(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        LinkError::Config(msg.into())
    }

    pub fn out_of_range(msg: impl Into<String>) -> Self {
        LinkError::OutOfRange(msg.into())
    }

    pub fn exception(function: u8, code: u8) -> Self {
        LinkError::Exception { function, code }
    }

    /// Exception responses do not indicate a broken link; the transport stays up
    pub fn is_exception(&self) -> bool {
        matches!(self, LinkError::Exception { .. })
    }

    /// Errors that should be retried by a client before giving up
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LinkError::Timeout(_) | LinkError::Crc { .. } | LinkError::Protocol(_)
        )
    }

    /// Errors after which the connection must be re-established
    pub fn needs_reconnect(&self) -> bool {
        matches!(
            self,
            LinkError::Connection(_) | LinkError::NotConnected | LinkError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_display() {
        let err = LinkError::exception(0x03, 0x02);
        let msg = err.to_string();
        assert!(msg.contains("0x02"));
        assert!(msg.contains("Illegal Data Address"));
    }

    #[test]
    fn test_classification() {
        assert!(LinkError::exception(0x03, 0x06).is_exception());
        assert!(!LinkError::NotConnected.is_exception());

        assert!(LinkError::timeout("read").is_retryable());
        assert!(LinkError::Crc {
            expected: 1,
            actual: 2
        }
        .is_retryable());
        assert!(!LinkError::NotConnected.is_retryable());

        assert!(LinkError::NotConnected.needs_reconnect());
        assert!(LinkError::io("broken pipe").needs_reconnect());
        assert!(!LinkError::exception(0x04, 0x02).needs_reconnect());
    }
}
