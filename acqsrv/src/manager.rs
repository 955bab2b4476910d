//! Instance manager
//!
//! Owns every live worker in the process behind a two-level map of plugin
//! type to instance id. The map lock is held only around map reads and
//! writes; instance methods, which take their own locks, are always called
//! outside it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use gridflux_model::Channel;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::env::HostEnv;
use crate::error::{AcqError, Result};
use crate::instance::Instance;
use crate::registry;

type InstanceMap = HashMap<String, HashMap<String, Arc<dyn Instance>>>;

pub struct InstanceManager {
    instances: Mutex<InstanceMap>,
    root: CancellationToken,
    env: Arc<HostEnv>,
}

impl InstanceManager {
    pub fn new(root: CancellationToken, env: Arc<HostEnv>) -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
            root,
            env,
        }
    }

    /// Create an instance under the root scope
    pub async fn create(
        &self,
        plugin: &str,
        id: &str,
        cfg: Channel,
    ) -> Result<Arc<dyn Instance>> {
        self.create_with_scope(None, plugin, id, cfg).await
    }

    /// Create an instance under an explicit parent scope
    pub async fn create_with_scope(
        &self,
        parent: Option<CancellationToken>,
        plugin: &str,
        id: &str,
        cfg: Channel,
    ) -> Result<Arc<dyn Instance>> {
        if plugin.is_empty() || id.is_empty() {
            return Err(AcqError::config("empty plugin type or instance id"));
        }

        let factory =
            registry::get_factory(plugin).ok_or_else(|| AcqError::NoFactory(plugin.to_string()))?;

        // Refuse known duplicates before paying for construction
        if self.lookup(plugin, id).is_some() {
            return Err(AcqError::DuplicateInstance {
                plugin: plugin.to_string(),
                id: id.to_string(),
            });
        }

        let instance = factory.create(id, cfg)?;
        let parent = parent.unwrap_or_else(|| self.root.clone());

        // Init happens outside the map lock; a failed init leaves no trace
        if let Err(e) = instance.init(parent, self.env.clone()).await {
            return Err(e);
        }

        // Another create may have raced us while init ran
        let raced = {
            let mut instances = self.instances.lock().expect("instance map lock");
            let by_type = instances.entry(plugin.to_string()).or_default();
            if by_type.contains_key(id) {
                true
            } else {
                by_type.insert(id.to_string(), instance.clone());
                false
            }
        };
        if raced {
            let _ = instance.close().await;
            return Err(AcqError::DuplicateInstance {
                plugin: plugin.to_string(),
                id: id.to_string(),
            });
        }

        info!(plugin, id, "instance created");
        Ok(instance)
    }

    /// Forward a configuration update to a live instance
    pub async fn update(&self, plugin: &str, id: &str, cfg: Channel) -> Result<()> {
        let instance = self.lookup(plugin, id).ok_or_else(|| AcqError::NoInstance {
            plugin: plugin.to_string(),
            id: id.to_string(),
        })?;
        instance.update_config(cfg).await
    }

    pub fn get(&self, plugin: &str, id: &str) -> Option<Arc<dyn Instance>> {
        self.lookup(plugin, id)
    }

    /// Tear one instance down and drop it from the map
    pub async fn destroy(&self, plugin: &str, id: &str) -> Result<()> {
        let instance = {
            let mut instances = self.instances.lock().expect("instance map lock");
            let by_type = instances.get_mut(plugin).ok_or_else(|| AcqError::NoInstance {
                plugin: plugin.to_string(),
                id: id.to_string(),
            })?;
            let instance = by_type.remove(id).ok_or_else(|| AcqError::NoInstance {
                plugin: plugin.to_string(),
                id: id.to_string(),
            })?;
            if by_type.is_empty() {
                instances.remove(plugin);
            }
            instance
        };

        instance.close().await?;
        info!(plugin, id, "instance destroyed");
        Ok(())
    }

    /// Tear everything down, in no particular order
    pub async fn destroy_all(&self) {
        let drained: Vec<(String, String, Arc<dyn Instance>)> = {
            let mut instances = self.instances.lock().expect("instance map lock");
            instances
                .drain()
                .flat_map(|(plugin, by_type)| {
                    by_type
                        .into_iter()
                        .map(move |(id, instance)| (plugin.clone(), id, instance))
                })
                .collect()
        };

        for (plugin, id, instance) in drained {
            if let Err(e) = instance.close().await {
                warn!(plugin, id, error = %e, "close failed during shutdown");
            }
        }
    }

    /// (plugin, id) of every live instance
    pub fn live_instances(&self) -> Vec<(String, String)> {
        let instances = self.instances.lock().expect("instance map lock");
        let mut live: Vec<(String, String)> = instances
            .iter()
            .flat_map(|(plugin, by_type)| {
                by_type
                    .keys()
                    .map(move |id| (plugin.clone(), id.clone()))
            })
            .collect();
        live.sort();
        live
    }

    fn lookup(&self, plugin: &str, id: &str) -> Option<Arc<dyn Instance>> {
        self.instances
            .lock()
            .expect("instance map lock")
            .get(plugin)
            .and_then(|by_type| by_type.get(id))
            .cloned()
    }
}
