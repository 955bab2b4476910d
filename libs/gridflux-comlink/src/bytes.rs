//! Byte ordering and register conversion utilities
//!
//! Industrial devices disagree on two independent axes: the order of the
//! bytes inside each 16-bit register, and the order of the registers that
//! make up a 32/64-bit value. Both axes are modelled here and every
//! conversion takes them explicitly.

mod bit_ops;
mod byte_order;
mod conversions;

pub use bit_ops::{bit_of_words, bools_to_packed_bytes, packed_bytes_to_bools};
pub use byte_order::{ByteOrder, RegisterOrder, WordOrder};
pub use conversions::{
    bytes_to_regs, regs_to_bytes, u16_from_wire, u16_to_wire, u32_from_regs, u32_to_regs,
    u64_from_regs, u64_to_regs,
};
