//! Channel: one physical bus and its line parameters

use std::time::Duration;

use chrono::{DateTime, Utc};
use gridflux_comlink::{ByteOrder, LinkError, RegisterOrder, Result, WordOrder};
use gridflux_protocols::modbus::{
    MasterConfig, MasterEndpoint, Parity, SerialConfig, TcpEndpoint, TransportKind,
};
use serde::{Deserialize, Serialize};

/// A physical bus serving one or more slaves
///
/// The identifier is an opaque string, unique process-wide, and doubles as
/// the worker instance id. Timing fields are stored in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub name: String,
    /// Worker plugin that drives the bus ("mbus", "cmbus")
    pub plugin: String,
    pub transport: TransportKind,

    // TCP
    pub tcp_host: String,
    pub tcp_port: u16,
    pub backup_host: String,
    pub backup_port: u16,

    // Serial
    pub device: String,
    pub device2: String,
    pub baud: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,

    // Decoding defaults for the whole bus
    pub byte_order: ByteOrder,
    pub word_order: WordOrder,

    // Timing and retry
    pub timeout_ms: u64,
    pub send_interval_ms: u64,
    pub retry_max: u32,
    pub retry_delay_ms: u64,

    pub enabled: bool,

    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Channel {
    /// A serial acquisition channel with the line defaults used when a bus
    /// appears in the startup configuration
    pub fn default_serial(device: &str, device2: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: device.to_string(),
            plugin: "mbus".to_string(),
            transport: TransportKind::RtuClient,
            tcp_host: "localhost".to_string(),
            tcp_port: 1502,
            backup_host: String::new(),
            backup_port: 0,
            device: device.to_string(),
            device2: device2.to_string(),
            baud: 19_200,
            data_bits: 8,
            stop_bits: 2,
            parity: Parity::None,
            byte_order: ByteOrder::Big,
            word_order: WordOrder::HighFirst,
            timeout_ms: 300,
            send_interval_ms: 300,
            retry_max: 3,
            retry_delay_ms: 300,
            enabled: true,
            created_at: None,
            updated_at: None,
        }
    }

    /// A TCP acquisition channel with sensible defaults
    pub fn default_tcp(id: &str, host: &str, port: u16) -> Self {
        Self {
            id: id.to_string(),
            name: format!("{host}:{port}"),
            plugin: "mbus".to_string(),
            transport: TransportKind::Tcp,
            tcp_host: host.to_string(),
            tcp_port: port,
            backup_host: String::new(),
            backup_port: 0,
            device: String::new(),
            device2: String::new(),
            baud: 19_200,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            byte_order: ByteOrder::Big,
            word_order: WordOrder::HighFirst,
            timeout_ms: 500,
            send_interval_ms: 200,
            retry_max: 0,
            retry_delay_ms: 300,
            enabled: true,
            created_at: None,
            updated_at: None,
        }
    }

    /// Channel-level invariants, checked before a row is stored or a worker
    /// is started
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(LinkError::config("channel id is required"));
        }
        if self.plugin.trim().is_empty() {
            return Err(LinkError::config("channel plugin is required"));
        }
        match self.transport {
            TransportKind::RtuClient | TransportKind::RtuServer => {
                if self.device.trim().is_empty() {
                    return Err(LinkError::config(format!(
                        "serial channel {} needs a device path",
                        self.id
                    )));
                }
            }
            TransportKind::Tcp => {
                if self.tcp_host.trim().is_empty() || self.tcp_port == 0 {
                    return Err(LinkError::config(format!(
                        "tcp channel {} needs host and a non-zero port",
                        self.id
                    )));
                }
            }
            // A listener may bind an ephemeral port
            TransportKind::TcpServer => {
                if self.tcp_host.trim().is_empty() {
                    return Err(LinkError::config(format!(
                        "tcp-server channel {} needs a bind host",
                        self.id
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn register_order(&self) -> RegisterOrder {
        RegisterOrder::new(self.byte_order, self.word_order)
    }

    pub fn serial_config(&self) -> SerialConfig {
        SerialConfig {
            device: self.device.clone(),
            baud: self.baud,
            data_bits: self.data_bits,
            stop_bits: self.stop_bits,
            parity: self.parity,
        }
    }

    /// Serial parameters of the secondary line used by the simulator plugin
    pub fn serial_config_secondary(&self) -> SerialConfig {
        SerialConfig {
            device: self.device2.clone(),
            ..self.serial_config()
        }
    }

    /// The master configuration this channel describes
    pub fn master_config(&self) -> MasterConfig {
        let endpoint = if self.transport.is_serial() {
            MasterEndpoint::Rtu(self.serial_config())
        } else {
            MasterEndpoint::Tcp {
                primary: TcpEndpoint {
                    host: self.tcp_host.clone(),
                    port: self.tcp_port,
                },
                backup: if self.backup_host.is_empty() || self.backup_port == 0 {
                    None
                } else {
                    Some(TcpEndpoint {
                        host: self.backup_host.clone(),
                        port: self.backup_port,
                    })
                },
            }
        };
        MasterConfig {
            endpoint,
            timeout: self.timeout(),
            send_interval: self.send_interval(),
            retry_max: self.retry_max,
            retry_delay: self.retry_delay(),
            order: self.register_order(),
        }
    }

    /// Whether switching from `self` to `new` forces a transport restart
    ///
    /// Endpoint, line parameters and framing/ordering all require reopening
    /// the transport; timing and retry knobs take effect on the next loop
    /// iteration.
    pub fn requires_restart(&self, new: &Channel) -> bool {
        self.transport != new.transport
            || self.tcp_host != new.tcp_host
            || self.tcp_port != new.tcp_port
            || self.backup_host != new.backup_host
            || self.backup_port != new.backup_port
            || self.device != new.device
            || self.device2 != new.device2
            || self.baud != new.baud
            || self.data_bits != new.data_bits
            || self.stop_bits != new.stop_bits
            || self.parity != new.parity
            || self.byte_order != new.byte_order
            || self.word_order != new.word_order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_serial_needs_device() {
        let mut channel = Channel::default_serial("/dev/ttyS0", "/dev/ttyS1");
        assert!(channel.validate().is_ok());
        channel.device = String::new();
        assert!(channel.validate().is_err());
    }

    #[test]
    fn test_validate_tcp_needs_endpoint() {
        let mut channel = Channel::default_tcp("ch-1", "127.0.0.1", 1502);
        assert!(channel.validate().is_ok());
        channel.tcp_port = 0;
        assert!(channel.validate().is_err());
    }

    #[test]
    fn test_requires_restart_on_structural_change() {
        let base = Channel::default_tcp("ch-1", "127.0.0.1", 1502);

        let mut timing = base.clone();
        timing.send_interval_ms = 500;
        timing.retry_max = 5;
        assert!(!base.requires_restart(&timing));

        let mut endpoint = base.clone();
        endpoint.tcp_port = 1503;
        assert!(base.requires_restart(&endpoint));

        let mut ordering = base.clone();
        ordering.word_order = WordOrder::LowFirst;
        assert!(base.requires_restart(&ordering));

        let mut serial = Channel::default_serial("/dev/ttyS0", "/dev/ttyS1");
        serial.id = base.id.clone();
        let mut faster = serial.clone();
        faster.baud = 115_200;
        assert!(serial.requires_restart(&faster));
    }

    #[test]
    fn test_master_config_backup_endpoint() {
        let mut channel = Channel::default_tcp("ch-1", "10.0.0.1", 502);
        channel.backup_host = "10.0.0.2".to_string();
        channel.backup_port = 502;
        match channel.master_config().endpoint {
            MasterEndpoint::Tcp { primary, backup } => {
                assert_eq!(primary.to_string(), "10.0.0.1:502");
                assert_eq!(backup.unwrap().to_string(), "10.0.0.2:502");
            }
            other => panic!("unexpected endpoint {:?}", other),
        }
    }
}
