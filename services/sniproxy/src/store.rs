//! Holder of the active configuration record.
//!
//! Uses ArcSwap for lock-free atomic config updates. Connection tasks load a
//! snapshot once per connection; a reload stores a new record in a single
//! pointer swap.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::info;

use crate::config::Config;

/// Lock-free holder of the active [`Config`].
pub struct ConfigStore {
    current: ArcSwap<Config>,
}

impl ConfigStore {
    /// Create a store holding `config`.
    pub fn new(config: Config) -> Self {
        Self {
            current: ArcSwap::from_pointee(config),
        }
    }

    /// Snapshot of the active record. Never blocks.
    pub fn get(&self) -> Arc<Config> {
        self.current.load_full()
    }

    /// Replace the active record.
    ///
    /// Readers holding an older snapshot keep it until they drop it.
    pub fn set(&self, config: Config) {
        let rule_count = config.forward_rules.len();
        self.current.store(Arc::new(config));
        info!(rule_count = rule_count, "Configuration replaced");
    }
}

/// Shared config store reference.
pub type SharedConfigStore = Arc<ConfigStore>;
