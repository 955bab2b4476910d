//! Tagged scalar values
//!
//! Decoded point values are carried as a [`Scalar`]: a kind tag plus the raw
//! bytes of the value in a canonical layout. The canonical layout is
//! little-endian for integer kinds at their declared width, IEEE-754 bits for
//! floats, UTF-8 for strings and verbatim for byte blobs. The JSON form is
//! `{"kind": ..., "value": ...}` with natural JSON typing, never base64-free
//! raw bytes.

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::json;

use crate::error::{LinkError, Result};

/// Value kind tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarKind {
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
}

impl ScalarKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScalarKind::Bool => "bool",
            ScalarKind::Int16 => "int16",
            ScalarKind::Uint16 => "uint16",
            ScalarKind::Int32 => "int32",
            ScalarKind::Uint32 => "uint32",
            ScalarKind::Int64 => "int64",
            ScalarKind::Uint64 => "uint64",
            ScalarKind::Float32 => "float32",
            ScalarKind::Float64 => "float64",
            ScalarKind::String => "string",
            ScalarKind::Bytes => "bytes",
        }
    }

    /// Canonical raw length in bytes; `None` for variable-length kinds
    pub fn raw_len(&self) -> Option<usize> {
        match self {
            ScalarKind::Bool => Some(1),
            ScalarKind::Int16 | ScalarKind::Uint16 => Some(2),
            ScalarKind::Int32 | ScalarKind::Uint32 | ScalarKind::Float32 => Some(4),
            ScalarKind::Int64 | ScalarKind::Uint64 | ScalarKind::Float64 => Some(8),
            ScalarKind::String | ScalarKind::Bytes => None,
        }
    }
}

impl std::fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A typed value in canonical raw bytes
#[derive(Debug, Clone, PartialEq)]
pub struct Scalar {
    kind: ScalarKind,
    raw: Vec<u8>,
}

impl Scalar {
    pub fn kind(&self) -> ScalarKind {
        self.kind
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    // ---- constructors ----

    pub fn from_bool(v: bool) -> Self {
        Self {
            kind: ScalarKind::Bool,
            raw: vec![u8::from(v)],
        }
    }

    pub fn from_i16(v: i16) -> Self {
        Self {
            kind: ScalarKind::Int16,
            raw: v.to_le_bytes().to_vec(),
        }
    }

    pub fn from_u16(v: u16) -> Self {
        Self {
            kind: ScalarKind::Uint16,
            raw: v.to_le_bytes().to_vec(),
        }
    }

    pub fn from_i32(v: i32) -> Self {
        Self {
            kind: ScalarKind::Int32,
            raw: v.to_le_bytes().to_vec(),
        }
    }

    pub fn from_u32(v: u32) -> Self {
        Self {
            kind: ScalarKind::Uint32,
            raw: v.to_le_bytes().to_vec(),
        }
    }

    pub fn from_i64(v: i64) -> Self {
        Self {
            kind: ScalarKind::Int64,
            raw: v.to_le_bytes().to_vec(),
        }
    }

    pub fn from_u64(v: u64) -> Self {
        Self {
            kind: ScalarKind::Uint64,
            raw: v.to_le_bytes().to_vec(),
        }
    }

    pub fn from_f32(v: f32) -> Self {
        Self {
            kind: ScalarKind::Float32,
            raw: v.to_le_bytes().to_vec(),
        }
    }

    pub fn from_f64(v: f64) -> Self {
        Self {
            kind: ScalarKind::Float64,
            raw: v.to_le_bytes().to_vec(),
        }
    }

    pub fn from_string(v: impl Into<String>) -> Self {
        Self {
            kind: ScalarKind::String,
            raw: v.into().into_bytes(),
        }
    }

    pub fn from_bytes(v: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: ScalarKind::Bytes,
            raw: v.into(),
        }
    }

    // ---- typed getters ----

    fn check(&self, want: ScalarKind) -> Result<()> {
        if self.kind != want {
            return Err(LinkError::KindMismatch {
                want: want.as_str(),
                got: self.kind.as_str(),
            });
        }
        if let Some(len) = want.raw_len() {
            if self.raw.len() != len {
                return Err(LinkError::out_of_range(format!(
                    "{} raw length {} (want {})",
                    want,
                    self.raw.len(),
                    len
                )));
            }
        }
        Ok(())
    }

    pub fn as_bool(&self) -> Result<bool> {
        self.check(ScalarKind::Bool)?;
        Ok(self.raw[0] != 0)
    }

    pub fn as_i16(&self) -> Result<i16> {
        self.check(ScalarKind::Int16)?;
        Ok(i16::from_le_bytes([self.raw[0], self.raw[1]]))
    }

    pub fn as_u16(&self) -> Result<u16> {
        self.check(ScalarKind::Uint16)?;
        Ok(u16::from_le_bytes([self.raw[0], self.raw[1]]))
    }

    pub fn as_i32(&self) -> Result<i32> {
        self.check(ScalarKind::Int32)?;
        Ok(i32::from_le_bytes([
            self.raw[0], self.raw[1], self.raw[2], self.raw[3],
        ]))
    }

    pub fn as_u32(&self) -> Result<u32> {
        self.check(ScalarKind::Uint32)?;
        Ok(u32::from_le_bytes([
            self.raw[0], self.raw[1], self.raw[2], self.raw[3],
        ]))
    }

    pub fn as_i64(&self) -> Result<i64> {
        self.check(ScalarKind::Int64)?;
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.raw);
        Ok(i64::from_le_bytes(b))
    }

    pub fn as_u64(&self) -> Result<u64> {
        self.check(ScalarKind::Uint64)?;
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.raw);
        Ok(u64::from_le_bytes(b))
    }

    pub fn as_f32(&self) -> Result<f32> {
        self.check(ScalarKind::Float32)?;
        Ok(f32::from_le_bytes([
            self.raw[0], self.raw[1], self.raw[2], self.raw[3],
        ]))
    }

    pub fn as_f64(&self) -> Result<f64> {
        self.check(ScalarKind::Float64)?;
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.raw);
        Ok(f64::from_le_bytes(b))
    }

    pub fn as_string(&self) -> Result<String> {
        self.check(ScalarKind::String)?;
        String::from_utf8(self.raw.clone())
            .map_err(|e| LinkError::invalid_data(format!("string scalar is not UTF-8: {}", e)))
    }

    pub fn as_bytes(&self) -> Result<Vec<u8>> {
        self.check(ScalarKind::Bytes)?;
        Ok(self.raw.clone())
    }

    /// The exact integer value of an integer or bool kind
    ///
    /// Floats, strings and bytes return `None`; use [`Self::as_number`] for
    /// a lossy widening instead.
    pub fn as_integer(&self) -> Option<i128> {
        match self.kind {
            ScalarKind::Bool => self.as_bool().ok().map(i128::from),
            ScalarKind::Int16 => self.as_i16().ok().map(i128::from),
            ScalarKind::Uint16 => self.as_u16().ok().map(i128::from),
            ScalarKind::Int32 => self.as_i32().ok().map(i128::from),
            ScalarKind::Uint32 => self.as_u32().ok().map(i128::from),
            ScalarKind::Int64 => self.as_i64().ok().map(i128::from),
            ScalarKind::Uint64 => self.as_u64().ok().map(i128::from),
            ScalarKind::Float32
            | ScalarKind::Float64
            | ScalarKind::String
            | ScalarKind::Bytes => None,
        }
    }

    /// Widen any numeric kind to f64; errors on string/bytes
    pub fn as_number(&self) -> Result<f64> {
        match self.kind {
            ScalarKind::Bool => Ok(f64::from(u8::from(self.as_bool()?))),
            ScalarKind::Int16 => Ok(f64::from(self.as_i16()?)),
            ScalarKind::Uint16 => Ok(f64::from(self.as_u16()?)),
            ScalarKind::Int32 => Ok(f64::from(self.as_i32()?)),
            ScalarKind::Uint32 => Ok(f64::from(self.as_u32()?)),
            ScalarKind::Int64 => Ok(self.as_i64()? as f64),
            ScalarKind::Uint64 => Ok(self.as_u64()? as f64),
            ScalarKind::Float32 => Ok(f64::from(self.as_f32()?)),
            ScalarKind::Float64 => self.as_f64(),
            ScalarKind::String | ScalarKind::Bytes => Err(LinkError::KindMismatch {
                want: "numeric",
                got: self.kind.as_str(),
            }),
        }
    }

    /// The natural JSON value for this scalar
    pub fn to_json_value(&self) -> serde_json::Value {
        match self.kind {
            ScalarKind::Bool => json!(self.as_bool().unwrap_or(false)),
            ScalarKind::Int16 => json!(self.as_i16().unwrap_or(0)),
            ScalarKind::Uint16 => json!(self.as_u16().unwrap_or(0)),
            ScalarKind::Int32 => json!(self.as_i32().unwrap_or(0)),
            ScalarKind::Uint32 => json!(self.as_u32().unwrap_or(0)),
            ScalarKind::Int64 => json!(self.as_i64().unwrap_or(0)),
            ScalarKind::Uint64 => json!(self.as_u64().unwrap_or(0)),
            ScalarKind::Float32 => json!(self.as_f32().unwrap_or(0.0)),
            ScalarKind::Float64 => json!(self.as_f64().unwrap_or(0.0)),
            ScalarKind::String => json!(self.as_string().unwrap_or_default()),
            ScalarKind::Bytes => json!(self.raw.clone()),
        }
    }
}

impl Serialize for Scalar {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let body = json!({ "kind": self.kind, "value": self.to_json_value() });
        body.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Scalar {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Wire {
            kind: ScalarKind,
            value: serde_json::Value,
        }

        let wire = Wire::deserialize(deserializer)?;
        let number = |v: &serde_json::Value| {
            v.as_f64()
                .ok_or_else(|| D::Error::custom("expected numeric value"))
        };

        Ok(match wire.kind {
            ScalarKind::Bool => Scalar::from_bool(
                wire.value
                    .as_bool()
                    .ok_or_else(|| D::Error::custom("expected bool value"))?,
            ),
            ScalarKind::Int16 => Scalar::from_i16(number(&wire.value)? as i16),
            ScalarKind::Uint16 => Scalar::from_u16(number(&wire.value)? as u16),
            ScalarKind::Int32 => Scalar::from_i32(number(&wire.value)? as i32),
            ScalarKind::Uint32 => Scalar::from_u32(number(&wire.value)? as u32),
            ScalarKind::Int64 => Scalar::from_i64(
                wire.value
                    .as_i64()
                    .ok_or_else(|| D::Error::custom("expected integer value"))?,
            ),
            ScalarKind::Uint64 => Scalar::from_u64(
                wire.value
                    .as_u64()
                    .ok_or_else(|| D::Error::custom("expected unsigned value"))?,
            ),
            ScalarKind::Float32 => Scalar::from_f32(number(&wire.value)? as f32),
            ScalarKind::Float64 => Scalar::from_f64(number(&wire.value)?),
            ScalarKind::String => Scalar::from_string(
                wire.value
                    .as_str()
                    .ok_or_else(|| D::Error::custom("expected string value"))?,
            ),
            ScalarKind::Bytes => {
                let bytes: Vec<u8> = serde_json::from_value(wire.value)
                    .map_err(|e| D::Error::custom(format!("expected byte array: {}", e)))?;
                Scalar::from_bytes(bytes)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_layout_is_little_endian() {
        assert_eq!(Scalar::from_u32(0x1234_5678).raw(), &[0x78, 0x56, 0x34, 0x12]);
        assert_eq!(Scalar::from_i16(-2).raw(), &[0xFE, 0xFF]);
        assert_eq!(Scalar::from_bool(true).raw(), &[1]);
    }

    #[test]
    fn test_typed_getters() {
        assert_eq!(Scalar::from_u32(42).as_u32().unwrap(), 42);
        assert_eq!(Scalar::from_f32(1.5).as_f32().unwrap(), 1.5);
        assert_eq!(Scalar::from_string("ok").as_string().unwrap(), "ok");

        let err = Scalar::from_u32(42).as_i16().unwrap_err();
        assert!(matches!(err, LinkError::KindMismatch { .. }));
    }

    #[test]
    fn test_as_number_widening() {
        assert_eq!(Scalar::from_i16(-7).as_number().unwrap(), -7.0);
        assert_eq!(Scalar::from_u64(9).as_number().unwrap(), 9.0);
        assert!(Scalar::from_string("x").as_number().is_err());
    }

    #[test]
    fn test_json_roundtrip() {
        for scalar in [
            Scalar::from_bool(true),
            Scalar::from_i16(-100),
            Scalar::from_u32(305_419_896),
            Scalar::from_f64(7.28),
            Scalar::from_string("inverter"),
            Scalar::from_bytes(vec![1, 2, 3]),
        ] {
            let text = serde_json::to_string(&scalar).unwrap();
            let back: Scalar = serde_json::from_str(&text).unwrap();
            assert_eq!(back, scalar, "json was {}", text);
        }
    }

    #[test]
    fn test_json_shape() {
        let text = serde_json::to_string(&Scalar::from_u16(7)).unwrap();
        let v: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["kind"], "uint16");
        assert_eq!(v["value"], 7);
    }
}
