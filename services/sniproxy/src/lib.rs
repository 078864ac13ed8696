pub mod config;
pub mod proxy;
pub mod reload;
pub mod store;

pub use config::{Config, ConfigError};
pub use proxy::{
    identify, sniff, Listener, ListenerConfig, ListenerStats, Resolved, RouteKind, RouteTable,
    SniError, SniResult, Sniffed,
};
pub use reload::{ReloadTrigger, Reloader};
pub use store::{ConfigStore, SharedConfigStore};
