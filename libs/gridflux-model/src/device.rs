//! Device: one logical slave on a channel

use chrono::{DateTime, Utc};
use gridflux_comlink::{LinkError, Result};
use serde::{Deserialize, Serialize};

/// A slave on a channel, identified by unit id and typed by a catalogue key
///
/// The channel and device-type references are weak: deleting a channel or a
/// type does not cascade into device rows, the association simply dangles
/// until the operator cleans up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub channel_id: String,
    pub name: String,
    /// Key into the device-type catalogue
    pub device_type: String,
    /// Slave address, 1..=247 (0 is broadcast and never polled)
    pub unit_id: u8,
    pub poll_interval_ms: u64,
    pub serial_number: String,
    pub software_version: String,
    pub model: String,
    pub enabled: bool,

    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Device {
    pub fn new(channel_id: &str, name: &str, device_type: &str, unit_id: u8) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            channel_id: channel_id.to_string(),
            name: name.to_string(),
            device_type: device_type.to_string(),
            unit_id,
            poll_interval_ms: 1_000,
            serial_number: String::new(),
            software_version: String::new(),
            model: String::new(),
            enabled: true,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.channel_id.trim().is_empty() {
            return Err(LinkError::config("device needs a channel id"));
        }
        if !(1..=247).contains(&self.unit_id) {
            return Err(LinkError::config(format!(
                "device {} unit id {} out of 1..=247",
                self.name, self.unit_id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_id_bounds() {
        let mut device = Device::new("ch-1", "inverter-1", "inv-x", 1);
        assert!(device.validate().is_ok());
        device.unit_id = 0;
        assert!(device.validate().is_err());
        device.unit_id = 247;
        assert!(device.validate().is_ok());
    }
}
