use crate::{Capability, ProtocolDriver, ProtocolError, Result};
use async_trait::async_trait;
use common::{Allocation, Depot, Lifetime, Mapping};
use once_cell::sync::Lazy;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use uuid::Uuid;

pub const MEM_EXTENT_URI: &str = "http://schemas.strand.dev/exnode/ext/mem#";

type ObjectMap = HashMap<String, Vec<u8>>;

/// Process-wide object stores keyed by configuration identity, so every
/// driver instance in the process resolves the same backend. Entries are
/// created lazily and never evicted.
static STORES: Lazy<Mutex<HashMap<String, Arc<Mutex<ObjectMap>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// In-memory backend. Exists for tests and local experiments; it honors
/// the full driver contract including capability tokens.
pub struct MemDriver;

impl MemDriver {
    pub fn new() -> Self {
        Self
    }

    fn cache_key(depot: &Depot) -> String {
        depot
            .config
            .get("namespace")
            .and_then(serde_json::Value::as_str)
            .map(ToString::to_string)
            .unwrap_or_else(|| depot.access_point.clone())
    }

    fn store_for(depot: &Depot) -> Arc<Mutex<ObjectMap>> {
        let mut stores = STORES.lock().expect("mem store cache poisoned");
        stores
            .entry(Self::cache_key(depot))
            .or_insert_with(|| Arc::new(Mutex::new(HashMap::new())))
            .clone()
    }

    fn store_for_location(location: &str) -> Result<Arc<Mutex<ObjectMap>>> {
        let stores = STORES.lock().expect("mem store cache poisoned");
        stores
            .get(location)
            .cloned()
            .ok_or_else(|| ProtocolError::Allocation(format!("no mem backend at {location}")))
    }
}

impl Default for MemDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProtocolDriver for MemDriver {
    fn kind(&self) -> &'static str {
        "mem"
    }

    fn schema(&self) -> &'static str {
        MEM_EXTENT_URI
    }

    async fn make_allocation(
        &self,
        data: &[u8],
        offset: u64,
        depot: &Depot,
        duration: Duration,
    ) -> Result<Allocation> {
        if data.is_empty() {
            return Err(ProtocolError::Fatal("cannot allocate zero bytes".to_string()));
        }

        let key = Uuid::new_v4().simple().to_string();
        let store = Self::store_for(depot);
        store
            .lock()
            .expect("mem store poisoned")
            .insert(key.clone(), data.to_vec());

        let authority = depot.host();
        let token = |code: &str| {
            Capability::build(
                "mem",
                authority,
                &key,
                &Uuid::new_v4().simple().to_string(),
                code,
            )
        };

        Ok(Allocation {
            schema: MEM_EXTENT_URI.to_string(),
            kind: "mem".to_string(),
            location: depot.access_point.clone(),
            offset,
            size: data.len() as u64,
            parent: None,
            lifetime: Lifetime::starting_now(duration),
            mapping: Mapping {
                read: token("READ"),
                write: token("WRITE"),
                manage: token("MANAGE"),
            },
        })
    }

    async fn read(&self, alloc: &Allocation, depot: &Depot) -> Result<Vec<u8>> {
        let cap = Capability::parse(&alloc.mapping.read)?;
        let store = Self::store_for_location(&Self::cache_key(depot))
            .or_else(|_| Self::store_for_location(&alloc.location))?;
        let data = store
            .lock()
            .expect("mem store poisoned")
            .get(&cap.key)
            .cloned()
            .ok_or_else(|| ProtocolError::Allocation(format!("unknown object {}", cap.key)))?;
        if data.len() as u64 != alloc.size {
            return Err(ProtocolError::Allocation(format!(
                "object {} is {} bytes, expected {}",
                cap.key,
                data.len(),
                alloc.size
            )));
        }
        Ok(data)
    }

    async fn write(&self, alloc: &Allocation, data: &[u8], depot: &Depot) -> Result<()> {
        let cap = Capability::parse(&alloc.mapping.write)?;
        let store = Self::store_for(depot);
        store
            .lock()
            .expect("mem store poisoned")
            .insert(cap.key, data.to_vec());
        Ok(())
    }

    async fn copy(
        &self,
        src: &Allocation,
        src_depot: &Depot,
        dst_depot: &Depot,
        duration: Duration,
    ) -> Result<Allocation> {
        if dst_depot.service_type != self.kind() {
            return Err(ProtocolError::Fatal(format!(
                "cannot copy onto {} depot",
                dst_depot.service_type
            )));
        }
        let data = self.read(src, src_depot).await?;
        self.make_allocation(&data, src.offset, dst_depot, duration)
            .await
    }

    fn parse_allocation(&self, value: &serde_json::Value) -> Result<Allocation> {
        crate::parse_wire(value, self.kind(), self.schema())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn depot(name: &str) -> Depot {
        Depot::new(format!("mem://{name}:1"), "mem")
    }

    #[tokio::test]
    async fn test_make_read_round_trip() {
        let driver = MemDriver::new();
        let depot = depot("rt");
        let data = b"hello extents".to_vec();

        let alloc = driver
            .make_allocation(&data, 64, &depot, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(alloc.offset, 64);
        assert_eq!(alloc.size, data.len() as u64);
        assert_eq!(alloc.location, depot.access_point);

        let back = driver.read(&alloc, &depot).await.unwrap();
        assert_eq!(back, data);
    }

    #[tokio::test]
    async fn test_copy_lands_on_destination() {
        let driver = MemDriver::new();
        let src = depot("copy-src");
        let dst = depot("copy-dst");
        let data = b"replicate me".to_vec();

        let alloc = driver
            .make_allocation(&data, 0, &src, Duration::from_secs(60))
            .await
            .unwrap();
        let copied = driver
            .copy(&alloc, &src, &dst, Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(copied.location, dst.access_point);
        assert_eq!(copied.offset, alloc.offset);
        assert_eq!(driver.read(&copied, &dst).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_write_replaces_object_bytes() {
        let driver = MemDriver::new();
        let depot = depot("rw");
        let alloc = driver
            .make_allocation(b"aaaa", 0, &depot, Duration::from_secs(60))
            .await
            .unwrap();

        driver.write(&alloc, b"bbbb", &depot).await.unwrap();
        assert_eq!(driver.read(&alloc, &depot).await.unwrap(), b"bbbb");
    }

    #[tokio::test]
    async fn test_read_unknown_object_is_transient() {
        let driver = MemDriver::new();
        let depot = depot("missing");
        let alloc = driver
            .make_allocation(b"x", 0, &depot, Duration::from_secs(60))
            .await
            .unwrap();

        let mut gone = alloc.clone();
        gone.mapping.read = Capability::build("mem", depot.host(), "nope", "w", "READ");
        let err = driver.read(&gone, &depot).await.unwrap_err();
        assert!(err.is_transient());
    }
}
