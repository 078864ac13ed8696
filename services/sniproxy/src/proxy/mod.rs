//! L4 TCP proxy implementation.
//!
//! This module provides:
//! - TCP listener management
//! - Hostname sniffing from TLS ClientHello (SNI) or HTTP `Host:`
//! - Forward rule lookup
//! - Connection relaying
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Sniffer -> RouteTable (active Config) -> Backend
//!                          |
//!              initial bytes replayed to backend
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use sniproxy::{Config, ConfigStore, Listener, ListenerConfig};
//!
//! let store = Arc::new(ConfigStore::new(Config::load("config.yaml")?));
//! let listener = Listener::bind(ListenerConfig::any_v4(443), store).await?;
//! Arc::new(listener).run().await?;
//! ```

mod listener;
mod router;
mod sniff;

pub use listener::{
    relay, Listener, ListenerConfig, ListenerStats, RelayDirection, RelayOutcome,
};
pub use router::{substitute_wildcard, Resolved, RouteKey, RouteKind, RouteTable, WILDCARD};
pub use sniff::{
    http_host, identify, parse_client_hello, sniff, SniError, SniResult, Sniffed,
    DEFAULT_INITIAL_READ_SIZE,
};
