//! Host environment
//!
//! The bundle of shared collaborator handles delivered to every worker at
//! `init`: the storage pool, the broker client, the root cancellation
//! token, and per-instance log span bindings. Workers do not own any of
//! these; their lifetime equals the process.

use std::sync::Arc;

use common::SqliteClient;
use rumqttc::{AsyncClient, QoS};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Span};

use crate::config::AppConfig;
use crate::error::Result;

pub struct HostEnv {
    pub config: Arc<AppConfig>,
    pub db: SqliteClient,
    /// Broker client; absent when no broker is configured
    pub mqtt: Option<AsyncClient>,
    /// System-wide cancellation root; worker scopes derive from it
    pub root: CancellationToken,
}

impl HostEnv {
    pub fn new(
        config: Arc<AppConfig>,
        db: SqliteClient,
        mqtt: Option<AsyncClient>,
        root: CancellationToken,
    ) -> Self {
        Self {
            config,
            db,
            mqtt,
            root,
        }
    }

    /// The structured-log span every worker task runs inside
    pub fn instance_span(&self, plugin: &str, instance: &str) -> Span {
        tracing::info_span!("worker", plugin = %plugin, instance = %instance)
    }

    /// Publish one decoded point northbound
    ///
    /// Topic layout: `gridflux/<channel-id>/<unit-id>/<point-code>`. A
    /// missing broker makes this a no-op; publish failures are logged and
    /// swallowed, acquisition never stalls on the broker.
    pub async fn publish_point(
        &self,
        channel_id: &str,
        unit_id: u8,
        point_code: &str,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let Some(client) = &self.mqtt else {
            return Ok(());
        };
        let topic = format!("gridflux/{channel_id}/{unit_id}/{point_code}");
        let body = serde_json::to_vec(payload)?;
        match client.try_publish(&topic, QoS::AtMostOnce, false, body) {
            Ok(()) => debug!(%topic, "published point"),
            Err(e) => warn!(%topic, error = %e, "publish failed"),
        }
        Ok(())
    }
}
