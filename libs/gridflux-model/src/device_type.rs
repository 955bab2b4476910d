//! Device-type catalogue rows
//!
//! A `DeviceType` names a register map shared by many devices; its
//! `DeviceTypePoint`s carry the Modbus mapping and decoding recipe for each
//! signal. Rows are produced by the catalogue importer from a validated
//! [`crate::TypeSpec`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use gridflux_comlink::RegisterOrder;
use gridflux_protocols::modbus::{DataType, ExtractSpec, RegKind};
use serde::{Deserialize, Serialize};

/// Point access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Access {
    #[default]
    #[serde(rename = "R")]
    Read,
    #[serde(rename = "W")]
    Write,
    #[serde(rename = "RW")]
    ReadWrite,
}

impl Access {
    /// Normalise free-form input; anything unrecognised reads as `R`
    pub fn normalize(s: &str) -> Self {
        match s.trim().to_uppercase().as_str() {
            "W" | "WO" => Access::Write,
            "RW" | "WR" => Access::ReadWrite,
            _ => Access::Read,
        }
    }

    pub fn readable(&self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }

    pub fn writable(&self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Access::Read => "R",
            Access::Write => "W",
            Access::ReadWrite => "RW",
        }
    }
}

/// One named register map in the catalogue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceType {
    pub id: String,
    pub type_key: String,
    pub name_en: String,
    pub vendor: String,
    pub model: String,
    pub version: String,
    /// SHA-256 over the canonical serialised spec that produced this row
    pub checksum: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

/// One addressable signal of a device type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceTypePoint {
    pub id: String,
    pub type_key: String,
    pub point_code: String,
    pub kind: RegKind,

    /// Names by ISO language code; "en" is always present
    pub name_i18n: HashMap<String, String>,
    pub unit: String,
    pub rw: Access,
    pub enabled: bool,

    // Modbus mapping
    pub function_code: u8,
    pub address: u16,
    pub quantity: u16,
    pub data_type: DataType,
    pub bit_index: Option<u8>,
    /// ABCD-style override of the channel ordering
    pub byte_order: Option<String>,
    pub scale: f64,
    pub offset: f64,
    pub precision: i32,
    /// Raw value labels, e.g. {"0": "Off", "1": "On"}
    pub enum_map: Option<HashMap<String, String>>,

    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl DeviceTypePoint {
    pub fn name_en(&self) -> &str {
        self.name_i18n.get("en").map(String::as_str).unwrap_or("")
    }

    /// The decoding recipe for this point under a channel's default ordering
    pub fn extract_spec(&self, channel_order: RegisterOrder) -> ExtractSpec {
        let order = self
            .byte_order
            .as_deref()
            .and_then(RegisterOrder::from_pattern)
            .unwrap_or(channel_order);
        ExtractSpec {
            data_type: self.data_type,
            quantity: self.quantity,
            bit_index: self.bit_index,
            order,
            scale: self.scale,
            offset: self.offset,
            precision: self.precision,
        }
    }

    /// Registers or coils one poll of this point must read
    pub fn read_quantity(&self) -> u16 {
        if self.kind.is_bit_kind() {
            self.quantity.max(1)
        } else {
            self.data_type.fixed_registers().unwrap_or(self.quantity)
        }
    }

    /// The label for a decoded raw value, when an enum map is attached
    pub fn enum_label(&self, raw: i64) -> Option<&str> {
        self.enum_map
            .as_ref()
            .and_then(|m| m.get(&raw.to_string()))
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridflux_comlink::{ByteOrder, WordOrder};

    fn point() -> DeviceTypePoint {
        DeviceTypePoint {
            id: "p1".to_string(),
            type_key: "inv-x".to_string(),
            point_code: "pv_voltage".to_string(),
            kind: RegKind::Holding,
            name_i18n: HashMap::from([("en".to_string(), "PV voltage".to_string())]),
            unit: "V".to_string(),
            rw: Access::Read,
            enabled: true,
            function_code: 3,
            address: 100,
            quantity: 2,
            data_type: DataType::Uint32,
            bit_index: None,
            byte_order: None,
            scale: 1.0,
            offset: 0.0,
            precision: 0,
            enum_map: None,
            created_at: None,
            updated_at: None,
            deleted_at: None,
        }
    }

    #[test]
    fn test_access_normalize() {
        assert_eq!(Access::normalize("r"), Access::Read);
        assert_eq!(Access::normalize("RW"), Access::ReadWrite);
        assert_eq!(Access::normalize("wo"), Access::Write);
        assert_eq!(Access::normalize("bogus"), Access::Read);
        assert!(Access::ReadWrite.writable());
        assert!(!Access::Read.writable());
    }

    #[test]
    fn test_extract_spec_uses_channel_order_by_default() {
        let channel_order = RegisterOrder::new(ByteOrder::Little, WordOrder::LowFirst);
        let spec = point().extract_spec(channel_order);
        assert_eq!(spec.order, channel_order);
    }

    #[test]
    fn test_extract_spec_point_override_wins() {
        let mut p = point();
        p.byte_order = Some("CDAB".to_string());
        let spec = p.extract_spec(RegisterOrder::default());
        assert_eq!(spec.order.pattern(), "CDAB");
    }

    #[test]
    fn test_read_quantity() {
        let mut p = point();
        assert_eq!(p.read_quantity(), 2);

        p.data_type = DataType::String;
        p.quantity = 8;
        assert_eq!(p.read_quantity(), 8);

        p.kind = RegKind::Coil;
        p.data_type = DataType::Bool;
        p.quantity = 1;
        assert_eq!(p.read_quantity(), 1);
    }

    #[test]
    fn test_enum_label() {
        let mut p = point();
        p.enum_map = Some(HashMap::from([
            ("0".to_string(), "Off".to_string()),
            ("1".to_string(), "On".to_string()),
        ]));
        assert_eq!(p.enum_label(1), Some("On"));
        assert_eq!(p.enum_label(7), None);
    }
}
