//! Forward rules and routing decisions.
//!
//! Routes are keyed by plain strings in one of three forms:
//! - `host:port` - exact hostname on an exact listener port
//! - `host` - exact hostname on any listener port
//! - `*:port` - any hostname on an exact listener port
//!
//! Lookups format the candidate keys from the sniffed hostname and the port
//! the client connected to, then compare them byte-for-byte. Hostnames are
//! not case-folded or trimmed.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Placeholder replaced by the requested hostname in wildcard destinations.
pub const WILDCARD: char = '*';

/// Which form of routing key produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    /// `host:port`
    HostPort,
    /// `host`
    Host,
    /// `*:port`
    AnyHost,
    /// No rule matched; the configured default was used.
    Default,
}

impl fmt::Display for RouteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RouteKind::HostPort => "host_port",
            RouteKind::Host => "host",
            RouteKind::AnyHost => "any_host",
            RouteKind::Default => "default",
        };
        f.write_str(label)
    }
}

/// Classification of a configured routing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteKey<'a> {
    HostPort { host: &'a str, port: &'a str },
    Host(&'a str),
    AnyHost { port: &'a str },
}

impl<'a> RouteKey<'a> {
    /// Classify a key by its declared shape.
    ///
    /// A key is `host:port` only when the text after the last `:` is all
    /// ASCII digits; anything else is an opaque hostname.
    pub fn classify(key: &'a str) -> Self {
        match key.rsplit_once(':') {
            Some(("*", port)) => RouteKey::AnyHost { port },
            Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
                RouteKey::HostPort { host, port }
            }
            _ => RouteKey::Host(key),
        }
    }

    /// The rule form this key belongs to.
    pub fn kind(&self) -> RouteKind {
        match self {
            RouteKey::HostPort { .. } => RouteKind::HostPort,
            RouteKey::Host(_) => RouteKind::Host,
            RouteKey::AnyHost { .. } => RouteKind::AnyHost,
        }
    }
}

/// Result of a successful lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    /// Which rule form matched.
    pub kind: RouteKind,
    /// Backend address, with the wildcard already substituted.
    pub destination: String,
}

/// Immutable map of routing keys to destination templates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteTable {
    rules: HashMap<String, String>,
}

impl RouteTable {
    /// Resolve a hostname and listener port to a backend.
    ///
    /// Precedence: `host:port`, then `host`, then `*:port`. Only a `*:port`
    /// match has its destination's first `*` replaced by the hostname.
    pub fn resolve(&self, hostname: &str, port: u16) -> Option<Resolved> {
        if let Some(dst) = self.rules.get(&format!("{}:{}", hostname, port)) {
            return Some(Resolved {
                kind: RouteKind::HostPort,
                destination: dst.clone(),
            });
        }

        if let Some(dst) = self.rules.get(hostname) {
            return Some(Resolved {
                kind: RouteKind::Host,
                destination: dst.clone(),
            });
        }

        self.rules
            .get(&format!("{}:{}", WILDCARD, port))
            .map(|template| Resolved {
                kind: RouteKind::AnyHost,
                destination: substitute_wildcard(template, hostname),
            })
    }

    /// Destination string for a hostname and port, if any rule matches.
    pub fn destination(&self, hostname: &str, port: u16) -> Option<String> {
        self.resolve(hostname, port).map(|r| r.destination)
    }

    /// Iterate over `(key, destination)` pairs in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.rules.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of configured rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for RouteTable
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            rules: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Replace the first `*` in `template` with `hostname`.
pub fn substitute_wildcard(template: &str, hostname: &str) -> String {
    template.replacen(WILDCARD, hostname, 1)
}
