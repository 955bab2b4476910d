//! Factory registry
//!
//! A process-wide table of plugin factories. Plugins do not self-register
//! through load-order side effects; `main` calls each plugin's `register`
//! explicitly during startup. Registration is exclusive, lookup is shared.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use crate::error::{AcqError, Result};
use crate::instance::Factory;

static FACTORIES: OnceLock<RwLock<HashMap<String, Arc<dyn Factory>>>> = OnceLock::new();

fn table() -> &'static RwLock<HashMap<String, Arc<dyn Factory>>> {
    FACTORIES.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register a plugin factory; refuses empty type tags and duplicates
pub fn register_factory(factory: Arc<dyn Factory>) -> Result<()> {
    let tag = factory.plugin_type();
    if tag.is_empty() {
        return Err(AcqError::config("empty factory type tag"));
    }
    let mut factories = table().write().expect("factory table lock");
    if factories.contains_key(tag) {
        return Err(AcqError::DuplicateFactory(tag.to_string()));
    }
    factories.insert(tag.to_string(), factory);
    tracing::debug!(plugin = tag, "registered factory");
    Ok(())
}

/// Look up a factory by type tag
pub fn get_factory(plugin: &str) -> Option<Arc<dyn Factory>> {
    table()
        .read()
        .expect("factory table lock")
        .get(plugin)
        .cloned()
}

/// All registered type tags, for diagnostics
pub fn registered_types() -> Vec<String> {
    let mut types: Vec<String> = table()
        .read()
        .expect("factory table lock")
        .keys()
        .cloned()
        .collect();
    types.sort();
    types
}
