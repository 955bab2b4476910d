//! Modbus PDU construction and parsing
//!
//! A PDU is the function code plus its payload, without any framing. The
//! buffer is a fixed-size stack array so request building never allocates.

use gridflux_comlink::bytes::{bools_to_packed_bytes, packed_bytes_to_bools};
use gridflux_comlink::{LinkError, Result};

use super::constants::{MAX_PDU_SIZE, MAX_READ_BITS, MAX_READ_REGISTERS};
use super::types::ExceptionCode;

/// A protocol data unit with a stack-allocated buffer
#[derive(Clone)]
pub struct ModbusPdu {
    data: [u8; MAX_PDU_SIZE],
    len: usize,
}

impl ModbusPdu {
    /// Create an empty PDU
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0; MAX_PDU_SIZE],
            len: 0,
        }
    }

    /// Create a PDU from raw bytes
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        if data.len() > MAX_PDU_SIZE {
            return Err(LinkError::protocol(format!(
                "PDU too large: {} bytes (max {})",
                data.len(),
                MAX_PDU_SIZE
            )));
        }
        let mut pdu = Self::new();
        pdu.data[..data.len()].copy_from_slice(data);
        pdu.len = data.len();
        Ok(pdu)
    }

    #[inline]
    pub fn push(&mut self, byte: u8) -> Result<()> {
        if self.len >= MAX_PDU_SIZE {
            return Err(LinkError::protocol("PDU buffer full"));
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    #[inline]
    pub fn push_u16(&mut self, value: u16) -> Result<()> {
        self.push((value >> 8) as u8)?;
        self.push((value & 0xFF) as u8)
    }

    pub fn extend(&mut self, data: &[u8]) -> Result<()> {
        if self.len + data.len() > MAX_PDU_SIZE {
            return Err(LinkError::protocol("PDU would exceed max size"));
        }
        self.data[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
        Ok(())
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The function code, with the exception bit masked off
    pub fn function_code(&self) -> Option<u8> {
        self.as_slice().first().map(|fc| fc & 0x7F)
    }

    /// Whether this PDU is an exception response
    pub fn is_exception(&self) -> bool {
        self.as_slice().first().is_some_and(|fc| fc & 0x80 != 0)
    }

    /// The exception code of an exception response
    pub fn exception_code(&self) -> Option<u8> {
        if self.is_exception() {
            self.as_slice().get(1).copied()
        } else {
            None
        }
    }

    /// Read a big-endian u16 at the given offset
    fn u16_at(&self, offset: usize) -> Result<u16> {
        let s = self.as_slice();
        if offset + 1 >= s.len() {
            return Err(LinkError::protocol(format!(
                "PDU truncated at offset {}",
                offset
            )));
        }
        Ok(u16::from_be_bytes([s[offset], s[offset + 1]]))
    }

    // ========================================================================
    // Request builders (master side)
    // ========================================================================

    /// FC 1-4: read `quantity` bits or registers starting at `address`
    pub fn read_request(function: u8, address: u16, quantity: u16) -> Result<Self> {
        let limit = match function {
            1 | 2 => MAX_READ_BITS,
            3 | 4 => MAX_READ_REGISTERS,
            _ => {
                return Err(LinkError::protocol(format!(
                    "FC {:#04X} is not a read function",
                    function
                )))
            }
        };
        if quantity == 0 || quantity > limit {
            return Err(LinkError::invalid_data(format!(
                "read quantity {} out of 1..={}",
                quantity, limit
            )));
        }
        let mut pdu = Self::new();
        pdu.push(function)?;
        pdu.push_u16(address)?;
        pdu.push_u16(quantity)?;
        Ok(pdu)
    }

    /// FC 5: write a single coil
    pub fn write_single_coil(address: u16, value: bool) -> Result<Self> {
        let mut pdu = Self::new();
        pdu.push(5)?;
        pdu.push_u16(address)?;
        pdu.push_u16(if value { 0xFF00 } else { 0x0000 })?;
        Ok(pdu)
    }

    /// FC 6: write a single holding register
    pub fn write_single_register(address: u16, value: u16) -> Result<Self> {
        let mut pdu = Self::new();
        pdu.push(6)?;
        pdu.push_u16(address)?;
        pdu.push_u16(value)?;
        Ok(pdu)
    }

    /// FC 15: write multiple coils
    pub fn write_multiple_coils(address: u16, values: &[bool]) -> Result<Self> {
        if values.is_empty() || values.len() > usize::from(super::constants::MAX_WRITE_BITS) {
            return Err(LinkError::invalid_data(format!(
                "coil write count {} out of range",
                values.len()
            )));
        }
        let packed = bools_to_packed_bytes(values);
        let mut pdu = Self::new();
        pdu.push(15)?;
        pdu.push_u16(address)?;
        pdu.push_u16(values.len() as u16)?;
        pdu.push(packed.len() as u8)?;
        pdu.extend(&packed)?;
        Ok(pdu)
    }

    /// FC 16: write multiple holding registers
    pub fn write_multiple_registers(address: u16, values: &[u16]) -> Result<Self> {
        if values.is_empty() || values.len() > usize::from(super::constants::MAX_WRITE_REGISTERS) {
            return Err(LinkError::invalid_data(format!(
                "register write count {} out of range",
                values.len()
            )));
        }
        let mut pdu = Self::new();
        pdu.push(16)?;
        pdu.push_u16(address)?;
        pdu.push_u16(values.len() as u16)?;
        pdu.push((values.len() * 2) as u8)?;
        for &value in values {
            pdu.push_u16(value)?;
        }
        Ok(pdu)
    }

    // ========================================================================
    // Response builders (slave side)
    // ========================================================================

    /// FC 1/2 response carrying packed bits
    pub fn bits_response(function: u8, bits: &[bool]) -> Result<Self> {
        let packed = bools_to_packed_bytes(bits);
        let mut pdu = Self::new();
        pdu.push(function)?;
        pdu.push(packed.len() as u8)?;
        pdu.extend(&packed)?;
        Ok(pdu)
    }

    /// FC 3/4 response carrying registers
    pub fn registers_response(function: u8, words: &[u16]) -> Result<Self> {
        let mut pdu = Self::new();
        pdu.push(function)?;
        pdu.push((words.len() * 2) as u8)?;
        for &word in words {
            pdu.push_u16(word)?;
        }
        Ok(pdu)
    }

    /// FC 5/6 response: echo of address and value
    pub fn echo_response(function: u8, address: u16, value: u16) -> Result<Self> {
        let mut pdu = Self::new();
        pdu.push(function)?;
        pdu.push_u16(address)?;
        pdu.push_u16(value)?;
        Ok(pdu)
    }

    /// FC 15/16 response: start address and quantity written
    pub fn write_ack_response(function: u8, address: u16, quantity: u16) -> Result<Self> {
        let mut pdu = Self::new();
        pdu.push(function)?;
        pdu.push_u16(address)?;
        pdu.push_u16(quantity)?;
        Ok(pdu)
    }

    /// Exception response: function code with the high bit set plus the code
    pub fn exception_response(function: u8, code: ExceptionCode) -> Self {
        let mut pdu = Self::new();
        // Two pushes into an empty buffer cannot fail
        let _ = pdu.push(function | 0x80);
        let _ = pdu.push(code.as_u8());
        pdu
    }

    // ========================================================================
    // Request field accessors (slave side)
    // ========================================================================

    /// Address and quantity of an FC 1-4 or FC 15/16 request
    pub fn request_range(&self) -> Result<(u16, u16)> {
        Ok((self.u16_at(1)?, self.u16_at(3)?))
    }

    /// Address and raw value of an FC 5/6 request
    pub fn request_write_single(&self) -> Result<(u16, u16)> {
        Ok((self.u16_at(1)?, self.u16_at(3)?))
    }

    /// Coil values of an FC 15 request
    pub fn request_coil_values(&self) -> Result<Vec<bool>> {
        let (_, quantity) = self.request_range()?;
        let s = self.as_slice();
        if s.len() < 6 {
            return Err(LinkError::protocol("FC 15 request truncated"));
        }
        let byte_count = usize::from(s[5]);
        if s.len() < 6 + byte_count || byte_count < usize::from(quantity).div_ceil(8) {
            return Err(LinkError::protocol("FC 15 byte count mismatch"));
        }
        Ok(packed_bytes_to_bools(
            &s[6..6 + byte_count],
            usize::from(quantity),
        ))
    }

    /// Register values of an FC 16 request
    pub fn request_register_values(&self) -> Result<Vec<u16>> {
        let (_, quantity) = self.request_range()?;
        let s = self.as_slice();
        if s.len() < 6 {
            return Err(LinkError::protocol("FC 16 request truncated"));
        }
        let byte_count = usize::from(s[5]);
        if byte_count != usize::from(quantity) * 2 || s.len() < 6 + byte_count {
            return Err(LinkError::protocol("FC 16 byte count mismatch"));
        }
        let mut words = Vec::with_capacity(usize::from(quantity));
        for i in 0..usize::from(quantity) {
            words.push(u16::from_be_bytes([s[6 + i * 2], s[7 + i * 2]]));
        }
        Ok(words)
    }

    // ========================================================================
    // Response parsers (master side)
    // ========================================================================

    /// Extract `count` bits from an FC 1/2 response
    pub fn parse_bits_response(&self, function: u8, count: u16) -> Result<Vec<bool>> {
        self.check_response_header(function)?;
        let s = self.as_slice();
        let byte_count = usize::from(s[1]);
        let expected = usize::from(count).div_ceil(8);
        if byte_count != expected || s.len() < 2 + byte_count {
            return Err(LinkError::protocol(format!(
                "FC {:02X} byte count {} (want {})",
                function, byte_count, expected
            )));
        }
        Ok(packed_bytes_to_bools(&s[2..2 + byte_count], usize::from(count)))
    }

    /// Extract `count` registers from an FC 3/4 response
    pub fn parse_registers_response(&self, function: u8, count: u16) -> Result<Vec<u16>> {
        self.check_response_header(function)?;
        let s = self.as_slice();
        let byte_count = usize::from(s[1]);
        if byte_count != usize::from(count) * 2 || s.len() < 2 + byte_count {
            return Err(LinkError::protocol(format!(
                "FC {:02X} byte count {} (want {})",
                function,
                byte_count,
                count * 2
            )));
        }
        let mut words = Vec::with_capacity(usize::from(count));
        for i in 0..usize::from(count) {
            words.push(u16::from_be_bytes([s[2 + i * 2], s[3 + i * 2]]));
        }
        Ok(words)
    }

    fn check_response_header(&self, function: u8) -> Result<()> {
        if self.is_exception() {
            return Err(LinkError::exception(
                self.function_code().unwrap_or(0),
                self.exception_code().unwrap_or(0),
            ));
        }
        match self.function_code() {
            Some(fc) if fc == function => {}
            Some(fc) => {
                return Err(LinkError::protocol(format!(
                    "function code mismatch: sent {:02X}, got {:02X}",
                    function, fc
                )))
            }
            None => return Err(LinkError::protocol("empty response PDU")),
        }
        if self.len < 2 {
            return Err(LinkError::protocol("response PDU truncated"));
        }
        Ok(())
    }
}

impl Default for ModbusPdu {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ModbusPdu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusPdu")
            .field("fc", &self.function_code())
            .field("len", &self.len)
            .field("data", &&self.as_slice())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_request_layout() {
        let pdu = ModbusPdu::read_request(3, 0x0064, 2).unwrap();
        assert_eq!(pdu.as_slice(), &[0x03, 0x00, 0x64, 0x00, 0x02]);
    }

    #[test]
    fn test_read_request_bounds() {
        assert!(ModbusPdu::read_request(3, 0, 0).is_err());
        assert!(ModbusPdu::read_request(3, 0, 126).is_err());
        assert!(ModbusPdu::read_request(1, 0, 2000).is_ok());
        assert!(ModbusPdu::read_request(1, 0, 2001).is_err());
        assert!(ModbusPdu::read_request(7, 0, 1).is_err());
    }

    #[test]
    fn test_write_single_coil_layout() {
        let on = ModbusPdu::write_single_coil(9, true).unwrap();
        assert_eq!(on.as_slice(), &[0x05, 0x00, 0x09, 0xFF, 0x00]);
        let off = ModbusPdu::write_single_coil(9, false).unwrap();
        assert_eq!(off.as_slice(), &[0x05, 0x00, 0x09, 0x00, 0x00]);
    }

    #[test]
    fn test_write_multiple_registers_roundtrip() {
        let pdu = ModbusPdu::write_multiple_registers(0x0010, &[0x1234, 0x5678]).unwrap();
        assert_eq!(
            pdu.as_slice(),
            &[0x10, 0x00, 0x10, 0x00, 0x02, 0x04, 0x12, 0x34, 0x56, 0x78]
        );
        assert_eq!(pdu.request_range().unwrap(), (0x0010, 2));
        assert_eq!(pdu.request_register_values().unwrap(), vec![0x1234, 0x5678]);
    }

    #[test]
    fn test_write_multiple_coils_roundtrip() {
        let bits = vec![true, false, true, true, false, false, false, false, true];
        let pdu = ModbusPdu::write_multiple_coils(4, &bits).unwrap();
        assert_eq!(pdu.function_code(), Some(15));
        assert_eq!(pdu.request_range().unwrap(), (4, 9));
        assert_eq!(pdu.request_coil_values().unwrap(), bits);
    }

    #[test]
    fn test_registers_response_roundtrip() {
        let pdu = ModbusPdu::registers_response(3, &[0x1234, 0x5678]).unwrap();
        assert_eq!(pdu.as_slice(), &[0x03, 0x04, 0x12, 0x34, 0x56, 0x78]);
        assert_eq!(
            pdu.parse_registers_response(3, 2).unwrap(),
            vec![0x1234, 0x5678]
        );
    }

    #[test]
    fn test_bits_response_roundtrip() {
        let bits = vec![true, true, false, true];
        let pdu = ModbusPdu::bits_response(2, &bits).unwrap();
        assert_eq!(pdu.parse_bits_response(2, 4).unwrap(), bits);
    }

    #[test]
    fn test_exception_response() {
        let pdu = ModbusPdu::exception_response(4, ExceptionCode::IllegalDataAddress);
        assert_eq!(pdu.as_slice(), &[0x84, 0x02]);
        assert!(pdu.is_exception());
        assert_eq!(pdu.function_code(), Some(4));
        assert_eq!(pdu.exception_code(), Some(2));

        let err = pdu.parse_registers_response(4, 2).unwrap_err();
        assert_eq!(err, LinkError::exception(4, 2));
    }

    #[test]
    fn test_response_function_mismatch() {
        let pdu = ModbusPdu::registers_response(3, &[1]).unwrap();
        assert!(pdu.parse_registers_response(4, 1).is_err());
    }

    #[test]
    fn test_byte_count_mismatch() {
        let pdu = ModbusPdu::from_slice(&[0x03, 0x04, 0x12, 0x34]).unwrap();
        assert!(pdu.parse_registers_response(3, 2).is_err());
    }
}
