//! Protocol engines for GridFlux field communication
//!
//! Currently one engine: Modbus, with a TCP/RTU master and an in-memory
//! slave used both as a bench simulator and for loopback testing.

pub mod modbus;

pub use gridflux_comlink::{LinkError, Result};
