//! Service configuration
//!
//! A YAML document (JSON works too, being a YAML subset) merged with
//! `GRIDFLUX_*` environment overrides; dotted keys map to underscore-
//! separated variable names, so `mqtt.host` is `GRIDFLUX_MQTT_HOST`.
//! Unknown keys are ignored. Several sections exist only for the outer
//! collaborators (HTTP, auth, audit) and are parsed but not consumed here.

use std::path::Path;

use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::{AcqError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpsConfig {
    pub disable: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
}

impl MqttConfig {
    pub fn enabled(&self) -> bool {
        !self.host.is_empty() && self.port > 0
    }
}

/// One serial bus ensured at startup; the secondary line backs the
/// simulator end of a loopback pair
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialEntry {
    pub device: String,
    pub device2: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WebAuthConfig {
    pub idle_minutes: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub jwt: JwtConfig,
    pub web: WebAuthConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub retention_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub debug: bool,
    /// Collaborator switch, parsed but unused here
    pub disable_auth: bool,
    /// Start the embedded simulator channels at boot
    pub simulator: bool,
    /// Directory of optional dynamically loaded factory bundles
    pub plugins: String,
    #[serde(rename = "log-path")]
    pub log_path: String,
    #[serde(rename = "data-path")]
    pub data_path: String,
    /// Seed data (device-type specs under `<extra-path>/types/`)
    #[serde(rename = "extra-path")]
    pub extra_path: String,
    /// PID file path; empty disables
    pub pid: String,
    pub http: HttpConfig,
    pub https: HttpsConfig,
    pub mqtt: MqttConfig,
    pub serial: Vec<SerialEntry>,
    pub auth: AuthConfig,
    pub audit: AuditConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            debug: false,
            disable_auth: false,
            simulator: false,
            plugins: String::new(),
            log_path: "./logs".to_string(),
            data_path: "./data".to_string(),
            extra_path: "./extra".to_string(),
            pid: String::new(),
            http: HttpConfig { port: 8080 },
            https: HttpsConfig {
                disable: false,
                port: 8443,
            },
            mqtt: MqttConfig::default(),
            serial: Vec::new(),
            auth: AuthConfig {
                jwt: JwtConfig {
                    secret: "change-me".to_string(),
                    issuer: "gridflux".to_string(),
                },
                web: WebAuthConfig { idle_minutes: 30 },
            },
            audit: AuditConfig {
                retention_days: 120,
            },
        }
    }
}

impl AppConfig {
    /// Load from a file plus environment overrides; a missing file is fine,
    /// defaults and environment still apply
    pub fn load(config_file: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        match config_file {
            Some(path) => {
                builder = builder.add_source(File::with_name(path).required(Path::new(path).exists()));
            }
            None => {
                builder = builder.add_source(File::with_name("config").required(false));
            }
        }

        let settings = builder
            .add_source(Environment::with_prefix("GRIDFLUX").separator("_"))
            .build()
            .map_err(|e| AcqError::config(format!("read config failed: {e}")))?;

        settings
            .try_deserialize()
            .map_err(|e| AcqError::config(format!("unmarshal config failed: {e}")))
    }

    /// Database file under the data directory
    pub fn db_path(&self) -> std::path::PathBuf {
        Path::new(&self.data_path).join("acqsrv.db")
    }

    /// Device-type seed directory
    pub fn types_dir(&self) -> std::path::PathBuf {
        Path::new(&self.extra_path).join("types")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.http.port, 8080);
        assert_eq!(cfg.audit.retention_days, 120);
        assert!(!cfg.mqtt.enabled());
        assert_eq!(cfg.db_path().to_string_lossy(), "./data/acqsrv.db");
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let cfg = AppConfig::load(Some("/nonexistent/acqsrv.yaml")).unwrap();
        assert_eq!(cfg.data_path, "./data");
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let dir = std::env::temp_dir().join("gridflux-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("acqsrv.yaml");
        std::fs::write(
            &path,
            "debug: true\nfuture_option: 42\nserial:\n  - device: /dev/ttyS0\n    device2: /dev/ttyS1\n",
        )
        .unwrap();

        let cfg = AppConfig::load(Some(path.to_str().unwrap())).unwrap();
        assert!(cfg.debug);
        assert_eq!(cfg.serial.len(), 1);
        assert_eq!(cfg.serial[0].device, "/dev/ttyS0");
    }

    #[test]
    fn test_mqtt_enabled() {
        let mut cfg = AppConfig::default();
        assert!(!cfg.mqtt.enabled());
        cfg.mqtt.host = "localhost".to_string();
        cfg.mqtt.port = 1883;
        assert!(cfg.mqtt.enabled());
    }
}
