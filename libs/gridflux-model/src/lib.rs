//! Data model for the GridFlux acquisition hub
//!
//! Channels, devices, the device-type catalogue with its point
//! definitions, and the transient worker status snapshot. Type-spec
//! documents (YAML or JSON) are parsed and validated here; storage and
//! import live in the service layer.

pub mod channel;
pub mod device;
pub mod device_type;
pub mod status;
pub mod typespec;

pub use channel::Channel;
pub use device::Device;
pub use device_type::{Access, DeviceType, DeviceTypePoint};
pub use status::WorkerStatus;
pub use typespec::{parse_spec, validate_spec, ModbusSpec, PointSpec, SpecError, TypeSpec};
