use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An addressable storage backend.
///
/// A depot is keyed by its access point URI and carries an opaque
/// configuration blob that only the matching protocol driver understands.
/// The table of depots is immutable for the lifetime of a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Depot {
    /// Access point URI, e.g. `posix://host:6714`. Unique per depot.
    pub access_point: String,
    /// Backend kind tag, matched against the protocol registry.
    pub service_type: String,
    /// Disabled depots stay in the table but are skipped by schedules.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Driver-specific configuration, passed through untouched.
    #[serde(default)]
    pub config: serde_json::Value,
}

fn default_enabled() -> bool {
    true
}

impl Depot {
    pub fn new(access_point: impl Into<String>, service_type: impl Into<String>) -> Self {
        Self {
            access_point: access_point.into(),
            service_type: service_type.into(),
            enabled: true,
            config: serde_json::Value::Null,
        }
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    /// The `host:port` component of the access point, used for display
    /// and visualization messages.
    pub fn host(&self) -> &str {
        let rest = match self.access_point.split_once("//") {
            Some((_, rest)) => rest,
            None => self.access_point.as_str(),
        };
        rest.split('/').next().unwrap_or(rest)
    }
}

/// Depot table keyed by access point. BTreeMap keeps iteration order
/// stable so round-robin scheduling is deterministic.
pub type DepotMap = BTreeMap<String, Depot>;
