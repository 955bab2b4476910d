//! Worker instance and factory contracts
//!
//! Every plugin worker implements [`Instance`]; every plugin type registers
//! one [`Factory`] under its type tag. Construction is pure, all resources
//! are acquired in `init` and released in `close`.

use std::sync::Arc;

use async_trait::async_trait;
use gridflux_model::{Channel, WorkerStatus};
use tokio_util::sync::CancellationToken;

use crate::env::HostEnv;
use crate::error::Result;

/// A running acquisition actor for one channel
#[async_trait]
pub trait Instance: Send + Sync {
    /// Unique instance id; equals the channel id
    fn id(&self) -> &str;

    /// Plugin type tag, e.g. "mbus"
    fn plugin_type(&self) -> &str;

    /// Derive a child scope from `parent`, construct the protocol object
    /// and spawn the acquisition task. Idempotent: a second call on an
    /// initialised instance is a no-op.
    async fn init(&self, parent: CancellationToken, env: Arc<HostEnv>) -> Result<()>;

    /// Atomically replace the configuration. When a field that affects the
    /// transport or framing changed, the worker restarts under its original
    /// parent scope; otherwise the new values apply from the next loop
    /// iteration. Must not deadlock against the acquisition task.
    async fn update_config(&self, cfg: Channel) -> Result<()>;

    /// A cheap copy of the live status
    fn get(&self) -> WorkerStatus;

    /// Cancel the child scope, wait for the acquisition task to exit and
    /// release the protocol object. Idempotent.
    async fn close(&self) -> Result<()>;
}

impl std::fmt::Debug for dyn Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id())
            .field("plugin_type", &self.plugin_type())
            .finish()
    }
}

/// Produces instances of one plugin type
pub trait Factory: Send + Sync {
    /// Globally unique plugin type tag
    fn plugin_type(&self) -> &'static str;

    /// Pure construction; nothing starts until `init`
    fn create(&self, id: &str, cfg: Channel) -> Result<Arc<dyn Instance>>;
}
