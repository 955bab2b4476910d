//! Type-spec documents
//!
//! Operators describe a device type in a YAML or JSON document; the format
//! is sniffed from the first non-whitespace byte. Validation normalises
//! defaults in place so the importer and the checksum both see the
//! canonical form. Maps are ordered so the canonical serialisation is
//! deterministic and content checksums stay stable across parses.

use std::collections::{BTreeMap, HashSet};

use gridflux_protocols::modbus::{DataType, RegKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Spec validation failure; import aborts and storage stays untouched
#[derive(Debug, Error)]
pub enum SpecError {
    #[error("empty spec document")]
    Empty,
    #[error("spec parse error: {0}")]
    Parse(String),
    #[error("{0}")]
    Invalid(String),
}

/// The Modbus mapping block of one point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModbusSpec {
    pub fc: u8,
    pub address: u16,
    #[serde(default)]
    pub quantity: u16,
    pub data_type: String,
    #[serde(default)]
    pub bit_index: Option<u8>,
    #[serde(default)]
    pub byte_order: Option<String>,
    #[serde(default)]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub precision: i32,
    #[serde(default)]
    pub enum_map: Option<BTreeMap<String, String>>,
}

/// One point entry in a spec document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointSpec {
    pub code: String,
    pub kind: String,
    #[serde(default)]
    pub rw: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub name_i18n: BTreeMap<String, String>,
    pub modbus: ModbusSpec,
}

/// A whole type-spec document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeSpec {
    pub type_key: String,
    pub name_en: String,
    #[serde(default)]
    pub vendor: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub version: String,
    pub points: Vec<PointSpec>,
}

/// Parse a document, sniffing JSON vs YAML from the first byte
pub fn parse_spec(data: &[u8]) -> Result<TypeSpec, SpecError> {
    let trimmed: &[u8] = {
        let start = data
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .ok_or(SpecError::Empty)?;
        &data[start..]
    };

    if trimmed[0] == b'{' || trimmed[0] == b'[' {
        serde_json::from_slice(trimmed).map_err(|e| SpecError::Parse(e.to_string()))
    } else {
        serde_yaml::from_slice(trimmed).map_err(|e| SpecError::Parse(e.to_string()))
    }
}

/// Validate a spec and normalise its defaults in place
///
/// Rules: non-empty `type_key` and English names, point codes unique within
/// the document, a known register kind and data type per point, a function
/// code, and no two points overlapping in (function code, address range)
/// unless distinguished by a bit index. Quantity defaults to the data
/// type's natural width, scale to 1, `rw` to `R`.
pub fn validate_spec(spec: &mut TypeSpec) -> Result<(), SpecError> {
    if spec.type_key.trim().is_empty() {
        return Err(SpecError::Invalid("type_key is required".into()));
    }
    if spec.name_en.trim().is_empty() {
        return Err(SpecError::Invalid("name_en is required".into()));
    }
    if spec.points.is_empty() {
        return Err(SpecError::Invalid("points is required".into()));
    }

    let mut seen = HashSet::new();
    // (fc, start, end, has_bit_index) per point for the overlap check
    let mut ranges: Vec<(u8, u32, u32, bool)> = Vec::with_capacity(spec.points.len());

    for (i, point) in spec.points.iter_mut().enumerate() {
        if point.code.trim().is_empty() {
            return Err(SpecError::Invalid(format!("points[{i}].code is required")));
        }
        if !seen.insert(point.code.clone()) {
            return Err(SpecError::Invalid(format!(
                "duplicate point code: {}",
                point.code
            )));
        }

        let kind = RegKind::parse(&point.kind).ok_or_else(|| {
            SpecError::Invalid(format!(
                "points[{i}].kind {:?} is not coil/discrete/holding/input",
                point.kind
            ))
        })?;
        point.kind = kind.as_str().to_string();

        let name_en = point.name_i18n.get("en").map(String::as_str).unwrap_or("");
        if name_en.trim().is_empty() {
            return Err(SpecError::Invalid(format!(
                "points[{i}].name_i18n.en is required"
            )));
        }

        if point.modbus.fc == 0 {
            return Err(SpecError::Invalid(format!(
                "points[{i}].modbus.fc is required"
            )));
        }
        let data_type = DataType::parse(&point.modbus.data_type).ok_or_else(|| {
            SpecError::Invalid(format!(
                "points[{i}].modbus.data_type {:?} is unknown",
                point.modbus.data_type
            ))
        })?;
        point.modbus.data_type = data_type.as_str().to_string();

        if point.modbus.quantity == 0 {
            point.modbus.quantity = data_type.fixed_registers().unwrap_or(1);
        }
        if point.modbus.scale == 0.0 {
            point.modbus.scale = 1.0;
        }
        point.rw = match point.rw.trim().to_uppercase().as_str() {
            "W" | "WO" => "W".to_string(),
            "RW" | "WR" => "RW".to_string(),
            _ => "R".to_string(),
        };

        if let Some(bit) = point.modbus.bit_index {
            let limit = u32::from(point.modbus.quantity) * 16;
            if u32::from(bit) >= limit {
                return Err(SpecError::Invalid(format!(
                    "points[{i}].modbus.bit_index {} exceeds quantity * 16",
                    bit
                )));
            }
        }
        if let Some(order) = &point.modbus.byte_order {
            if gridflux_comlink::RegisterOrder::from_pattern(order).is_none() {
                return Err(SpecError::Invalid(format!(
                    "points[{i}].modbus.byte_order {:?} is unknown",
                    order
                )));
            }
        }

        let span = if kind.is_bit_kind() {
            u32::from(point.modbus.quantity.max(1))
        } else {
            u32::from(
                data_type
                    .fixed_registers()
                    .unwrap_or(point.modbus.quantity),
            )
        };
        let start = u32::from(point.modbus.address);
        ranges.push((
            point.modbus.fc,
            start,
            start + span,
            point.modbus.bit_index.is_some(),
        ));
    }

    // Two points may share a register only when both select individual bits
    for (a, ra) in ranges.iter().enumerate() {
        for rb in ranges.iter().skip(a + 1) {
            let overlap = ra.0 == rb.0 && ra.1 < rb.2 && rb.1 < ra.2;
            if overlap && !(ra.3 && rb.3) {
                return Err(SpecError::Invalid(format!(
                    "points overlap on fc {} address range {}..{}",
                    ra.0,
                    ra.1.max(rb.1),
                    ra.2.min(rb.2)
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML_SPEC: &str = r#"
type_key: inv-x
name_en: Example Inverter
vendor: ACME
model: X-1000
version: "1.2"
points:
  - code: pv_voltage
    kind: holding
    rw: r
    unit: V
    name_i18n:
      en: PV voltage
      de: PV-Spannung
    modbus:
      fc: 3
      address: 100
      data_type: uint32
      scale: 0.1
  - code: running
    kind: holding
    name_i18n:
      en: Running
    modbus:
      fc: 3
      address: 102
      quantity: 1
      data_type: bitmask
      bit_index: 3
"#;

    fn parsed() -> TypeSpec {
        parse_spec(YAML_SPEC.as_bytes()).unwrap()
    }

    #[test]
    fn test_parse_yaml() {
        let spec = parsed();
        assert_eq!(spec.type_key, "inv-x");
        assert_eq!(spec.points.len(), 2);
        assert_eq!(spec.points[0].modbus.scale, 0.1);
    }

    #[test]
    fn test_parse_json_sniffed() {
        let spec = parsed();
        let json = serde_json::to_string(&spec).unwrap();
        let reparsed = parse_spec(json.as_bytes()).unwrap();
        assert_eq!(reparsed, spec);
    }

    #[test]
    fn test_parse_json_with_leading_whitespace() {
        let spec = parsed();
        let json = format!("\n  {}", serde_json::to_string(&spec).unwrap());
        assert!(parse_spec(json.as_bytes()).is_ok());
    }

    #[test]
    fn test_parse_empty() {
        assert!(matches!(parse_spec(b"   \n"), Err(SpecError::Empty)));
    }

    #[test]
    fn test_validate_normalises_defaults() {
        let mut spec = parsed();
        validate_spec(&mut spec).unwrap();
        // uint32 quantity fills in from its natural width
        assert_eq!(spec.points[0].modbus.quantity, 2);
        assert_eq!(spec.points[0].rw, "R");
        // bitmask keeps its explicit quantity
        assert_eq!(spec.points[1].modbus.quantity, 1);
        assert_eq!(spec.points[1].modbus.scale, 1.0);
    }

    #[test]
    fn test_validate_rejects_duplicate_codes() {
        let mut spec = parsed();
        spec.points[1].code = spec.points[0].code.clone();
        spec.points[1].modbus.address = 300;
        assert!(validate_spec(&mut spec).is_err());
    }

    #[test]
    fn test_validate_requires_english_name() {
        let mut spec = parsed();
        spec.points[0].name_i18n.remove("en");
        assert!(validate_spec(&mut spec).is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_kind() {
        let mut spec = parsed();
        spec.points[0].kind = "mystery".to_string();
        assert!(validate_spec(&mut spec).is_err());
    }

    #[test]
    fn test_validate_kind_aliases() {
        let mut spec = parsed();
        spec.points[0].kind = "YC".to_string();
        validate_spec(&mut spec).unwrap();
        assert_eq!(spec.points[0].kind, "holding");
    }

    #[test]
    fn test_validate_rejects_overlap() {
        let mut spec = parsed();
        // uint32 at 100 spans 100..102; a second point at 101 collides
        spec.points[1].modbus.address = 101;
        spec.points[1].modbus.data_type = "uint16".to_string();
        spec.points[1].modbus.bit_index = None;
        let err = validate_spec(&mut spec).unwrap_err();
        assert!(err.to_string().contains("overlap"));
    }

    #[test]
    fn test_validate_allows_bit_sharing() {
        let mut spec = parsed();
        // Two bitmask points in the same register are fine
        spec.points.push(PointSpec {
            code: "fault".to_string(),
            kind: "holding".to_string(),
            rw: String::new(),
            unit: String::new(),
            name_i18n: BTreeMap::from([("en".to_string(), "Fault".to_string())]),
            modbus: ModbusSpec {
                fc: 3,
                address: 102,
                quantity: 1,
                data_type: "bitmask".to_string(),
                bit_index: Some(4),
                byte_order: None,
                scale: 0.0,
                offset: 0.0,
                precision: 0,
                enum_map: None,
            },
        });
        validate_spec(&mut spec).unwrap();
    }

    #[test]
    fn test_validate_bit_index_bound() {
        let mut spec = parsed();
        spec.points[1].modbus.bit_index = Some(16);
        assert!(validate_spec(&mut spec).is_err());
    }
}
