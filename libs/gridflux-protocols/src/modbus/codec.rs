//! Typed value extraction and encoding
//!
//! A raw register group (words from FC 3/4, bits from FC 1/2) plus an
//! [`ExtractSpec`] produce a [`Scalar`]; the reverse direction encodes a
//! value into its wire representation for writes.
//!
//! Numeric post-processing order is fixed: decode the raw value, multiply by
//! scale, add offset, round to precision. A value whose scale is 1, offset 0
//! and precision 0 keeps its declared kind; anything else becomes float64.

use gridflux_comlink::bytes::{
    bit_of_words, bytes_to_regs, regs_to_bytes, u16_from_wire, u16_to_wire, u32_from_regs,
    u32_to_regs, u64_from_regs, u64_to_regs,
};
use gridflux_comlink::{LinkError, RegisterOrder, Result, Scalar};

use super::types::{DataType, RegisterBlock};

/// How to turn one register group into one value
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractSpec {
    pub data_type: DataType,
    /// Registers (or coils) covered by the point; defaults to the natural
    /// width of the data type
    pub quantity: u16,
    /// For `bitmask`: which bit to select
    pub bit_index: Option<u8>,
    pub order: RegisterOrder,
    pub scale: f64,
    pub offset: f64,
    pub precision: i32,
}

impl ExtractSpec {
    pub fn new(data_type: DataType) -> Self {
        Self {
            data_type,
            quantity: data_type.fixed_registers().unwrap_or(1),
            bit_index: None,
            order: RegisterOrder::default(),
            scale: 1.0,
            offset: 0.0,
            precision: 0,
        }
    }

    /// Registers one read request must cover for this spec
    pub fn register_count(&self) -> u16 {
        self.data_type.fixed_registers().unwrap_or(self.quantity)
    }

    fn has_postprocessing(&self) -> bool {
        self.scale != 1.0 || self.offset != 0.0 || self.precision > 0
    }
}

/// Decode either kind of register group
pub fn decode_block(block: &RegisterBlock, spec: &ExtractSpec) -> Result<Scalar> {
    match block {
        RegisterBlock::Words(words) => decode_words(words, spec),
        RegisterBlock::Bits(bits) => decode_bits(bits, spec),
    }
}

/// Decode a word group (holding or input registers)
pub fn decode_words(words: &[u16], spec: &ExtractSpec) -> Result<Scalar> {
    let expected = usize::from(spec.register_count());
    if words.len() != expected {
        return Err(LinkError::out_of_range(format!(
            "{} needs {} registers, got {}",
            spec.data_type,
            expected,
            words.len()
        )));
    }

    let scalar = match spec.data_type {
        // Any non-zero word is true when a register backs a bool point
        DataType::Bool => Scalar::from_bool(words.iter().any(|&w| w != 0)),
        DataType::Bitmask => {
            let index = u16::from(spec.bit_index.ok_or_else(|| {
                LinkError::invalid_data("bitmask point without bit_index")
            })?);
            // Bounded in u32: quantity is unconstrained, so the u16 product
            // can overflow
            if u32::from(index) >= u32::from(spec.quantity) * 16 {
                return Err(LinkError::out_of_range(format!(
                    "bit index {} exceeds {} registers",
                    index, spec.quantity
                )));
            }
            let normalized: Vec<u16> = words
                .iter()
                .map(|&w| u16_from_wire(w, spec.order.byte))
                .collect();
            Scalar::from_bool(bit_of_words(&normalized, index).unwrap_or(false))
        }
        DataType::Uint16 => Scalar::from_u16(u16_from_wire(words[0], spec.order.byte)),
        DataType::Int16 => Scalar::from_i16(u16_from_wire(words[0], spec.order.byte) as i16),
        DataType::Uint32 => {
            Scalar::from_u32(u32_from_regs(&[words[0], words[1]], spec.order))
        }
        DataType::Int32 => {
            Scalar::from_i32(u32_from_regs(&[words[0], words[1]], spec.order) as i32)
        }
        DataType::Float32 => Scalar::from_f32(f32::from_bits(u32_from_regs(
            &[words[0], words[1]],
            spec.order,
        ))),
        DataType::Uint64 => Scalar::from_u64(u64_from_regs(
            &[words[0], words[1], words[2], words[3]],
            spec.order,
        )),
        DataType::Int64 => Scalar::from_i64(u64_from_regs(
            &[words[0], words[1], words[2], words[3]],
            spec.order,
        ) as i64),
        DataType::Float64 => Scalar::from_f64(f64::from_bits(u64_from_regs(
            &[words[0], words[1], words[2], words[3]],
            spec.order,
        ))),
        DataType::String => {
            let bytes = regs_to_bytes(words, spec.order.byte);
            let trimmed: Vec<u8> = {
                let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
                bytes[..end].to_vec()
            };
            let text = String::from_utf8(trimmed)
                .map_err(|e| LinkError::invalid_data(format!("string point not UTF-8: {e}")))?;
            Scalar::from_string(text)
        }
        DataType::Bytes => Scalar::from_bytes(regs_to_bytes(words, spec.order.byte)),
    };

    postprocess(scalar, spec)
}

/// Decode a bit group (coils or discrete inputs)
pub fn decode_bits(bits: &[bool], spec: &ExtractSpec) -> Result<Scalar> {
    match spec.data_type {
        DataType::Bool => {
            if bits.is_empty() {
                return Err(LinkError::out_of_range("bool needs at least one coil"));
            }
            Ok(Scalar::from_bool(bits[0]))
        }
        DataType::Bitmask => {
            let index = usize::from(spec.bit_index.ok_or_else(|| {
                LinkError::invalid_data("bitmask point without bit_index")
            })?);
            bits.get(index).copied().map(Scalar::from_bool).ok_or_else(|| {
                LinkError::out_of_range(format!("bit index {} exceeds {} coils", index, bits.len()))
            })
        }
        other => Err(LinkError::KindMismatch {
            want: "bool or bitmask",
            got: other.as_str(),
        }),
    }
}

/// Apply scale, offset and precision in that order
fn postprocess(scalar: Scalar, spec: &ExtractSpec) -> Result<Scalar> {
    if !spec.has_postprocessing() || !spec.data_type.is_numeric() {
        return Ok(scalar);
    }
    if matches!(spec.data_type, DataType::Bool | DataType::Bitmask) {
        return Ok(scalar);
    }
    let value = scalar.as_number()? * spec.scale + spec.offset;
    Ok(Scalar::from_f64(round_to(value, spec.precision)))
}

fn round_to(value: f64, precision: i32) -> f64 {
    if precision <= 0 {
        return value;
    }
    let factor = 10f64.powi(precision);
    (value * factor).round() / factor
}

// ============================================================================
// Encoding (write path)
// ============================================================================

/// Encode a value into wire registers for an FC 6/16 write
///
/// Scale and offset are applied in reverse before the value is narrowed to
/// its wire type; out-of-range values are clamped to the type's bounds.
pub fn encode_words(value: &Scalar, spec: &ExtractSpec) -> Result<Vec<u16>> {
    match spec.data_type {
        DataType::String => {
            let text = value.as_string()?;
            pad_to_quantity(bytes_to_regs(text.as_bytes(), spec.order.byte), spec)
        }
        DataType::Bytes => {
            let bytes = value.as_bytes()?;
            pad_to_quantity(bytes_to_regs(&bytes, spec.order.byte), spec)
        }
        DataType::Bool | DataType::Bitmask => {
            let set = value.as_number()? != 0.0;
            Ok(vec![u16_to_wire(u16::from(set), spec.order.byte)])
        }
        numeric => {
            let has_transform = spec.scale != 1.0 || spec.offset != 0.0;
            // 64-bit integers keep their full width when no transform
            // applies; everything else survives the f64 detour exactly
            let exact = if has_transform {
                None
            } else {
                value.as_integer()
            };
            let transformed = || -> Result<f64> {
                let v = value.as_number()?;
                if spec.scale != 0.0 {
                    Ok((v - spec.offset) / spec.scale)
                } else {
                    Ok(v)
                }
            };
            Ok(match numeric {
                DataType::Uint16 => {
                    let raw = clamp_round(transformed()?, 0.0, 65_535.0) as u16;
                    vec![u16_to_wire(raw, spec.order.byte)]
                }
                DataType::Int16 => {
                    let raw = clamp_round(transformed()?, -32_768.0, 32_767.0) as i16;
                    vec![u16_to_wire(raw as u16, spec.order.byte)]
                }
                DataType::Uint32 => {
                    let raw = clamp_round(transformed()?, 0.0, u32::MAX as f64) as u32;
                    u32_to_regs(raw, spec.order).to_vec()
                }
                DataType::Int32 => {
                    let raw =
                        clamp_round(transformed()?, i32::MIN as f64, i32::MAX as f64) as i32;
                    u32_to_regs(raw as u32, spec.order).to_vec()
                }
                DataType::Uint64 => {
                    let raw = match exact {
                        Some(i) => i.clamp(0, i128::from(u64::MAX)) as u64,
                        None => clamp_round(transformed()?, 0.0, u64::MAX as f64) as u64,
                    };
                    u64_to_regs(raw, spec.order).to_vec()
                }
                DataType::Int64 => {
                    let raw = match exact {
                        Some(i) => {
                            i.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
                        }
                        None => {
                            clamp_round(transformed()?, i64::MIN as f64, i64::MAX as f64) as i64
                        }
                    };
                    u64_to_regs(raw as u64, spec.order).to_vec()
                }
                DataType::Float32 => {
                    u32_to_regs((transformed()? as f32).to_bits(), spec.order).to_vec()
                }
                DataType::Float64 => u64_to_regs(transformed()?.to_bits(), spec.order).to_vec(),
                // Handled in the outer match arms
                DataType::Bool | DataType::Bitmask | DataType::String | DataType::Bytes => {
                    unreachable!()
                }
            })
        }
    }
}

/// Encode a value into one coil state for an FC 5 write
pub fn encode_bit(value: &Scalar) -> Result<bool> {
    Ok(value.as_number()? != 0.0)
}

fn clamp_round(v: f64, min: f64, max: f64) -> f64 {
    v.round().clamp(min, max)
}

fn pad_to_quantity(mut regs: Vec<u16>, spec: &ExtractSpec) -> Result<Vec<u16>> {
    let want = usize::from(spec.quantity);
    if regs.len() > want {
        return Err(LinkError::out_of_range(format!(
            "value needs {} registers but the point covers {}",
            regs.len(),
            want
        )));
    }
    regs.resize(want, 0);
    Ok(regs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridflux_comlink::ScalarKind;

    fn spec(data_type: DataType) -> ExtractSpec {
        ExtractSpec::new(data_type)
    }

    fn spec_with_order(data_type: DataType, pattern: &str) -> ExtractSpec {
        let mut s = ExtractSpec::new(data_type);
        s.order = RegisterOrder::from_pattern(pattern).unwrap();
        s
    }

    // ========================================================================
    // Decode
    // ========================================================================

    #[test]
    fn test_decode_uint32_high_word_first() {
        // Registers 0x1234, 0x5678 with big bytes and the high word first
        let value = decode_words(&[0x1234, 0x5678], &spec(DataType::Uint32)).unwrap();
        assert_eq!(value.as_u32().unwrap(), 0x1234_5678);
        assert_eq!(value.as_u32().unwrap(), 305_419_896);
    }

    #[test]
    fn test_decode_float32_scaled() {
        // 3.1415 stored little-endian, low word first; scale 2, offset 1,
        // precision 2 gives 7.28
        let mut s = spec_with_order(DataType::Float32, "DCBA");
        s.scale = 2.0;
        s.offset = 1.0;
        s.precision = 2;

        let regs = u32_to_regs(3.1415f32.to_bits(), s.order);
        let value = decode_words(&regs, &s).unwrap();
        assert_eq!(value.kind(), ScalarKind::Float64);
        assert_eq!(value.as_f64().unwrap(), 7.28);
    }

    #[test]
    fn test_decode_int16_negative() {
        let value = decode_words(&[0xFFFE], &spec(DataType::Int16)).unwrap();
        assert_eq!(value.as_i16().unwrap(), -2);
    }

    #[test]
    fn test_decode_bool_on_registers() {
        let zero = decode_words(&[0x0000], &spec(DataType::Bool)).unwrap();
        assert!(!zero.as_bool().unwrap());
        let set = decode_words(&[0x0100], &spec(DataType::Bool)).unwrap();
        assert!(set.as_bool().unwrap());
    }

    #[test]
    fn test_decode_bitmask() {
        let mut s = spec(DataType::Bitmask);
        s.quantity = 1;
        s.bit_index = Some(3);
        assert!(decode_words(&[0b1000], &s).unwrap().as_bool().unwrap());
        s.bit_index = Some(4);
        assert!(!decode_words(&[0b1000], &s).unwrap().as_bool().unwrap());
    }

    #[test]
    fn test_decode_bitmask_index_out_of_range() {
        let mut s = spec(DataType::Bitmask);
        s.quantity = 1;
        s.bit_index = Some(16);
        let err = decode_words(&[0], &s).unwrap_err();
        assert!(matches!(err, LinkError::OutOfRange(_)));
    }

    #[test]
    fn test_decode_bitmask_wide_quantity() {
        // quantity * 16 exceeds u16 here; the bound must not wrap
        let mut s = spec(DataType::Bitmask);
        s.quantity = 4096;
        s.bit_index = Some(200);

        let mut words = vec![0u16; 4096];
        words[12] = 1 << 8; // bit 200 lives in word 12
        let value = decode_words(&words, &s).unwrap();
        assert!(value.as_bool().unwrap());
    }

    #[test]
    fn test_decode_length_mismatch() {
        let err = decode_words(&[0x1234], &spec(DataType::Uint32)).unwrap_err();
        assert!(matches!(err, LinkError::OutOfRange(_)));
    }

    #[test]
    fn test_decode_string_trims_nul() {
        let mut s = spec(DataType::String);
        s.quantity = 3;
        let regs = bytes_to_regs(b"SN42\0\0", s.order.byte);
        let value = decode_words(&regs, &s).unwrap();
        assert_eq!(value.as_string().unwrap(), "SN42");
    }

    #[test]
    fn test_decode_coils() {
        let value = decode_bits(&[true], &spec(DataType::Bool)).unwrap();
        assert!(value.as_bool().unwrap());

        let mut s = spec(DataType::Bitmask);
        s.bit_index = Some(2);
        assert!(decode_bits(&[false, false, true], &s).unwrap().as_bool().unwrap());
    }

    #[test]
    fn test_decode_numeric_from_coils_is_kind_mismatch() {
        let err = decode_bits(&[true, false], &spec(DataType::Uint16)).unwrap_err();
        assert!(matches!(err, LinkError::KindMismatch { .. }));
    }

    #[test]
    fn test_unscaled_keeps_declared_kind() {
        let value = decode_words(&[0x0001, 0x0000], &spec(DataType::Uint32)).unwrap();
        assert_eq!(value.kind(), ScalarKind::Uint32);
    }

    // ========================================================================
    // Encode and roundtrips
    // ========================================================================

    #[test]
    fn test_encode_decode_roundtrip_all_orders() {
        for pattern in ["ABCD", "CDAB", "BADC", "DCBA"] {
            let s = spec_with_order(DataType::Int32, pattern);
            for v in [-1_000_000i32, -1, 0, 1, i32::MAX, i32::MIN] {
                let regs = encode_words(&Scalar::from_i32(v), &s).unwrap();
                let back = decode_words(&regs, &s).unwrap();
                assert_eq!(back.as_i32().unwrap(), v, "pattern {}", pattern);
            }
        }
    }

    #[test]
    fn test_encode_decode_float64() {
        let s = spec(DataType::Float64);
        for v in [0.0, -2.5, 1e300, std::f64::consts::PI] {
            let regs = encode_words(&Scalar::from_f64(v), &s).unwrap();
            assert_eq!(decode_words(&regs, &s).unwrap().as_f64().unwrap(), v);
        }
    }

    #[test]
    fn test_encode_u64_is_exact_above_f64_precision() {
        let s = spec(DataType::Uint64);
        // Larger than 2^53, so an f64 detour would corrupt it
        let v = 0xFFFF_FFFF_FFFF_FFF1u64;
        let regs = encode_words(&Scalar::from_u64(v), &s).unwrap();
        assert_eq!(decode_words(&regs, &s).unwrap().as_u64().unwrap(), v);
    }

    #[test]
    fn test_encode_applies_inverse_scale() {
        let mut s = spec(DataType::Uint16);
        s.scale = 0.1;
        s.offset = 5.0;
        // Operator writes 12.3; raw register must hold (12.3 - 5) / 0.1 = 73
        let regs = encode_words(&Scalar::from_f64(12.3), &s).unwrap();
        assert_eq!(regs, vec![73]);
    }

    #[test]
    fn test_encode_clamps() {
        let s = spec(DataType::Uint16);
        let regs = encode_words(&Scalar::from_f64(70_000.0), &s).unwrap();
        assert_eq!(regs, vec![65_535]);
        let regs = encode_words(&Scalar::from_f64(-3.0), &s).unwrap();
        assert_eq!(regs, vec![0]);
    }

    #[test]
    fn test_encode_string_padded() {
        let mut s = spec(DataType::String);
        s.quantity = 4;
        let regs = encode_words(&Scalar::from_string("ACME"), &s).unwrap();
        assert_eq!(regs.len(), 4);
        assert_eq!(decode_words(&regs, &s).unwrap().as_string().unwrap(), "ACME");
    }

    #[test]
    fn test_encode_string_too_long() {
        let mut s = spec(DataType::String);
        s.quantity = 1;
        assert!(encode_words(&Scalar::from_string("toolong"), &s).is_err());
    }

    #[test]
    fn test_encode_bit() {
        assert!(encode_bit(&Scalar::from_bool(true)).unwrap());
        assert!(!encode_bit(&Scalar::from_u16(0)).unwrap());
        assert!(encode_bit(&Scalar::from_f64(1.0)).unwrap());
    }

    #[test]
    fn test_round_to() {
        assert_eq!(round_to(7.283, 2), 7.28);
        assert_eq!(round_to(7.286, 2), 7.29);
        assert_eq!(round_to(7.283, 0), 7.283);
    }
}
