//! Byte and word ordering for multi-register values
//!
//! Channels configure the two axes separately (byte order within a register,
//! word order across registers); point definitions may override both at once
//! with the conventional ABCD notation. [`RegisterOrder`] carries the
//! combined setting.

use serde::{Deserialize, Serialize};

/// Order of the two bytes inside a single 16-bit register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    /// Most significant byte first (network order, the Modbus default)
    #[default]
    Big,
    /// Least significant byte first
    Little,
}

/// Order of 16-bit words when combining registers into 32/64-bit values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WordOrder {
    /// High word at the lowest address (the Modbus default)
    #[default]
    HighFirst,
    /// Low word at the lowest address
    LowFirst,
}

/// Combined byte + word ordering for one value
///
/// # ABCD notation
///
/// For the 32-bit value `0x12345678` (A=0x12 .. D=0x78), the wire bytes are:
///
/// | pattern | byte order | word order | wire |
/// |---------|------------|------------|------|
/// | `ABCD`  | big        | high first | 12 34 56 78 |
/// | `CDAB`  | big        | low first  | 56 78 12 34 |
/// | `BADC`  | little     | high first | 34 12 78 56 |
/// | `DCBA`  | little     | low first  | 78 56 34 12 |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RegisterOrder {
    pub byte: ByteOrder,
    pub word: WordOrder,
}

impl RegisterOrder {
    pub const fn new(byte: ByteOrder, word: WordOrder) -> Self {
        Self { byte, word }
    }

    /// Parse the conventional four-letter pattern, case-insensitive,
    /// with or without a dash ("AB-CD").
    pub fn from_pattern(s: &str) -> Option<Self> {
        let normalized = s.to_uppercase().replace('-', "");
        match normalized.as_str() {
            "ABCD" | "AB" | "BE" | "BIG_ENDIAN" => {
                Some(Self::new(ByteOrder::Big, WordOrder::HighFirst))
            }
            "CDAB" => Some(Self::new(ByteOrder::Big, WordOrder::LowFirst)),
            "BADC" => Some(Self::new(ByteOrder::Little, WordOrder::HighFirst)),
            "DCBA" | "BA" | "LE" | "LITTLE_ENDIAN" => {
                Some(Self::new(ByteOrder::Little, WordOrder::LowFirst))
            }
            _ => None,
        }
    }

    /// The four-letter pattern for this ordering
    pub fn pattern(&self) -> &'static str {
        match (self.byte, self.word) {
            (ByteOrder::Big, WordOrder::HighFirst) => "ABCD",
            (ByteOrder::Big, WordOrder::LowFirst) => "CDAB",
            (ByteOrder::Little, WordOrder::HighFirst) => "BADC",
            (ByteOrder::Little, WordOrder::LowFirst) => "DCBA",
        }
    }
}

impl std::fmt::Display for RegisterOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.pattern())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_pattern() {
        assert_eq!(
            RegisterOrder::from_pattern("ABCD"),
            Some(RegisterOrder::new(ByteOrder::Big, WordOrder::HighFirst))
        );
        assert_eq!(
            RegisterOrder::from_pattern("cd-ab"),
            Some(RegisterOrder::new(ByteOrder::Big, WordOrder::LowFirst))
        );
        assert_eq!(
            RegisterOrder::from_pattern("BADC"),
            Some(RegisterOrder::new(ByteOrder::Little, WordOrder::HighFirst))
        );
        assert_eq!(
            RegisterOrder::from_pattern("dcba"),
            Some(RegisterOrder::new(ByteOrder::Little, WordOrder::LowFirst))
        );
        assert_eq!(RegisterOrder::from_pattern("XYZW"), None);
        assert_eq!(RegisterOrder::from_pattern(""), None);
    }

    #[test]
    fn test_pattern_roundtrip() {
        for pattern in ["ABCD", "CDAB", "BADC", "DCBA"] {
            let order = RegisterOrder::from_pattern(pattern).unwrap();
            assert_eq!(order.pattern(), pattern);
        }
    }

    #[test]
    fn test_default_is_modbus_convention() {
        let order = RegisterOrder::default();
        assert_eq!(order.byte, ByteOrder::Big);
        assert_eq!(order.word, WordOrder::HighFirst);
        assert_eq!(order.pattern(), "ABCD");
    }
}
