//! Field-link primitives shared by every GridFlux protocol layer
//!
//! This crate holds the pieces that are protocol-independent:
//! byte/word ordering and register conversions, the tagged [`Scalar`]
//! value that decoded points are expressed in, and the common
//! [`LinkError`] type.

pub mod bytes;
pub mod error;
pub mod value;

pub use bytes::{ByteOrder, RegisterOrder, WordOrder};
pub use error::{LinkError, Result};
pub use value::{Scalar, ScalarKind};
