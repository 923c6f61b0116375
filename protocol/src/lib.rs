mod capability;
mod mem;
mod posix;

pub use capability::*;
pub use mem::*;
pub use posix::*;

use async_trait::async_trait;
use common::{Allocation, Depot};
use std::{collections::HashMap, sync::Arc, time::Duration};
use thiserror::Error;

/// A Result type specialized for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed allocation: {0}")]
    Malformed(String),
    #[error("no driver registered for backend: {0}")]
    UnknownBackend(String),
    #[error("allocation failed: {0}")]
    Allocation(String),
    #[error("fatal backend error: {0}")]
    Fatal(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Transient failures signal the caller to retry the job, possibly on
    /// another depot. Everything else is terminal for the call.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProtocolError::Allocation(_) | ProtocolError::Io(_))
    }
}

/// The contract every backend driver implements.
///
/// One driver instance is shared by all workers of a session. Drivers keep
/// whatever per-backend connection state they need in a process-wide cache
/// keyed by configuration identity, created lazily and kept for the life of
/// the process.
#[async_trait]
pub trait ProtocolDriver: Send + Sync {
    /// Backend kind tag, matched against `Depot::service_type`.
    fn kind(&self) -> &'static str;

    /// Schema URI emitted into allocations created by this driver.
    fn schema(&self) -> &'static str;

    /// Reserves storage on `depot` and transfers `data` into it. Returns
    /// the allocation describing the stored replica.
    async fn make_allocation(
        &self,
        data: &[u8],
        offset: u64,
        depot: &Depot,
        duration: Duration,
    ) -> Result<Allocation>;

    /// Returns exactly `alloc.size` bytes. A short buffer is reported as a
    /// transient allocation failure, never returned.
    async fn read(&self, alloc: &Allocation, depot: &Depot) -> Result<Vec<u8>>;

    /// Overwrites the object behind an existing allocation.
    async fn write(&self, alloc: &Allocation, data: &[u8], depot: &Depot) -> Result<()>;

    /// Replicates `src` onto `dst_depot` without round-tripping the bytes
    /// through the caller. Returns the new allocation at the destination.
    async fn copy(
        &self,
        src: &Allocation,
        src_depot: &Depot,
        dst_depot: &Depot,
        duration: Duration,
    ) -> Result<Allocation>;

    /// Parses this backend's wire form into a typed allocation.
    fn parse_allocation(&self, value: &serde_json::Value) -> Result<Allocation>;
}

/// Maps backend kinds and schema URIs to drivers.
///
/// Both maps are populated at construction and read-only afterwards. The
/// kind map serves allocation creation (the caller picked a depot and knows
/// its kind); the schema map serves reads and copies of allocations
/// received from elsewhere.
pub struct ProtocolRegistry {
    by_kind: HashMap<String, Arc<dyn ProtocolDriver>>,
    by_schema: HashMap<String, Arc<dyn ProtocolDriver>>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self {
            by_kind: HashMap::new(),
            by_schema: HashMap::new(),
        }
    }

    /// A registry with the bundled drivers installed.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PosixDriver::new()));
        registry.register(Arc::new(MemDriver::new()));
        registry
    }

    pub fn register(&mut self, driver: Arc<dyn ProtocolDriver>) {
        self.by_kind.insert(driver.kind().to_string(), driver.clone());
        self.by_schema.insert(driver.schema().to_string(), driver);
    }

    pub fn by_kind(&self, kind: &str) -> Result<Arc<dyn ProtocolDriver>> {
        self.by_kind
            .get(kind)
            .cloned()
            .ok_or_else(|| ProtocolError::UnknownBackend(kind.to_string()))
    }

    pub fn by_schema(&self, schema: &str) -> Result<Arc<dyn ProtocolDriver>> {
        self.by_schema
            .get(schema)
            .cloned()
            .ok_or_else(|| ProtocolError::UnknownBackend(schema.to_string()))
    }

    pub fn for_depot(&self, depot: &Depot) -> Result<Arc<dyn ProtocolDriver>> {
        self.by_kind(&depot.service_type)
    }

    pub fn for_allocation(&self, alloc: &Allocation) -> Result<Arc<dyn ProtocolDriver>> {
        self.by_schema(&alloc.schema)
    }
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Normalizes a received allocation: extracts the schema identifier and
/// delegates to the matching driver's parser.
pub fn build_allocation(registry: &ProtocolRegistry, value: &serde_json::Value) -> Result<Allocation> {
    let schema = value
        .get("$schema")
        .or_else(|| value.get("schema"))
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| ProtocolError::Malformed("missing schema identifier".to_string()))?;
    registry.by_schema(schema)?.parse_allocation(value)
}

/// Like [`build_allocation`] but for a serialized wire form.
pub fn build_allocation_str(registry: &ProtocolRegistry, raw: &str) -> Result<Allocation> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    build_allocation(registry, &value)
}

/// Shared wire-form parser for the bundled drivers: deserializes the
/// allocation, checks the schema and size invariants, restores the kind tag.
pub(crate) fn parse_wire(
    value: &serde_json::Value,
    kind: &'static str,
    schema: &'static str,
) -> Result<Allocation> {
    let mut alloc: Allocation = serde_json::from_value(value.clone())
        .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    if alloc.schema != schema {
        return Err(ProtocolError::Malformed(format!(
            "schema {} does not belong to the {kind} backend",
            alloc.schema
        )));
    }
    if alloc.size == 0 {
        return Err(ProtocolError::Malformed("zero-size allocation".to_string()));
    }
    alloc.kind = kind.to_string();
    Ok(alloc)
}
