//! Proxy configuration.
//!
//! A configuration record is loaded from a YAML file:
//!
//! ```yaml
//! listen: [80, 443]
//! default: "*:443"
//! forward_rules:
//!   www.example.com:80: 127.0.0.1:8080
//!   www.example.com: 127.0.0.1:8443
//!   "*:8541": 127.0.0.1:8541
//! ```
//!
//! Records are immutable once built; reloads replace them wholesale through
//! the [`ConfigStore`](crate::store::ConfigStore).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::proxy::{substitute_wildcard, Resolved, RouteKey, RouteKind, RouteTable};

/// Errors from loading or validating a configuration record.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// One immutable configuration record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// TCP ports to bind on all interfaces. Only read at startup.
    pub listen: Vec<u16>,

    /// Destination used when no forward rule matches. May contain `*`.
    #[serde(default)]
    pub default: String,

    /// Routing key to destination template.
    #[serde(default)]
    pub forward_rules: RouteTable,
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Config = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a configuration from YAML text.
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check the record for values that can never route.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.is_empty() {
            return Err(ConfigError::Invalid("listen must name at least one port".into()));
        }

        if self.listen.contains(&0) {
            return Err(ConfigError::Invalid("listen port 0 is not allowed".into()));
        }

        for (key, destination) in self.forward_rules.iter() {
            if key.is_empty() {
                return Err(ConfigError::Invalid("empty forward rule key".into()));
            }

            if let RouteKey::AnyHost { port } = RouteKey::classify(key) {
                if port.parse::<u16>().is_err() {
                    return Err(ConfigError::Invalid(format!(
                        "forward rule '{}': wildcard port '{}' is not a valid port",
                        key, port
                    )));
                }
            }

            if destination.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "forward rule '{}' has an empty destination",
                    key
                )));
            }
        }

        Ok(())
    }

    /// Route a connection, or `None` if it cannot be routed.
    ///
    /// Falls back to `default` when no rule matches, substituting its first
    /// `*` with the hostname.
    pub fn route(&self, hostname: &str, port: u16) -> Option<Resolved> {
        if let Some(resolved) = self.forward_rules.resolve(hostname, port) {
            return Some(resolved);
        }

        if self.default.is_empty() {
            return None;
        }

        Some(Resolved {
            kind: RouteKind::Default,
            destination: substitute_wildcard(&self.default, hostname),
        })
    }

    /// Backend address for a connection, or `None` if it cannot be routed.
    pub fn destination(&self, hostname: &str, port: u16) -> Option<String> {
        self.route(hostname, port).map(|r| r.destination)
    }
}
