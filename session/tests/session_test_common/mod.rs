use async_trait::async_trait;
use common::{Allocation, Depot, DepotMap};
use protocol::{MemDriver, ProtocolDriver, ProtocolError, ProtocolRegistry};
use sqlx::any::{AnyPoolOptions, install_default_drivers};
use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};
use store::DataStore;

pub const KB: u64 = 1024;

pub async fn setup_registry() -> Arc<DataStore> {
    // Use PoolOptions to ensure the connection stays alive
    install_default_drivers();
    let pool = AnyPoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .connect("sqlite::memory:")
        .await
        .expect("Could not create pool");
    // Using an in-memory database ensures tests are fast and side-effect free
    Arc::new(
        DataStore::with_pool(pool)
            .await
            .expect("Failed to create test store"),
    )
}

/// A depot table of in-memory backends. Names become access points, so
/// each test should pick names that no other test uses.
pub fn mem_depots(names: &[&str]) -> DepotMap {
    let mut map = DepotMap::new();
    for name in names {
        let depot = Depot::new(format!("mem://{name}:1"), "mem");
        map.insert(depot.access_point.clone(), depot);
    }
    map
}

pub const FLAKY_EXTENT_URI: &str = "http://schemas.strand.dev/exnode/ext/flaky#";

/// Mem-backed driver that injects a configurable number of transient
/// failures before behaving normally.
pub struct FlakyDriver {
    inner: MemDriver,
    fail_makes: AtomicU32,
    fail_reads: AtomicU32,
}

impl FlakyDriver {
    pub fn new(fail_makes: u32, fail_reads: u32) -> Self {
        Self {
            inner: MemDriver::new(),
            fail_makes: AtomicU32::new(fail_makes),
            fail_reads: AtomicU32::new(fail_reads),
        }
    }

    fn should_fail(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ProtocolDriver for FlakyDriver {
    fn kind(&self) -> &'static str {
        "flaky"
    }

    fn schema(&self) -> &'static str {
        FLAKY_EXTENT_URI
    }

    async fn make_allocation(
        &self,
        data: &[u8],
        offset: u64,
        depot: &Depot,
        duration: Duration,
    ) -> protocol::Result<Allocation> {
        if Self::should_fail(&self.fail_makes) {
            return Err(ProtocolError::Allocation("injected failure".to_string()));
        }
        let mut alloc = self
            .inner
            .make_allocation(data, offset, depot, duration)
            .await?;
        alloc.schema = FLAKY_EXTENT_URI.to_string();
        alloc.kind = "flaky".to_string();
        Ok(alloc)
    }

    async fn read(&self, alloc: &Allocation, depot: &Depot) -> protocol::Result<Vec<u8>> {
        if Self::should_fail(&self.fail_reads) {
            return Err(ProtocolError::Allocation("injected failure".to_string()));
        }
        self.inner.read(alloc, depot).await
    }

    async fn write(&self, alloc: &Allocation, data: &[u8], depot: &Depot) -> protocol::Result<()> {
        self.inner.write(alloc, data, depot).await
    }

    async fn copy(
        &self,
        src: &Allocation,
        src_depot: &Depot,
        dst_depot: &Depot,
        duration: Duration,
    ) -> protocol::Result<Allocation> {
        self.inner.copy(src, src_depot, dst_depot, duration).await
    }

    fn parse_allocation(&self, value: &serde_json::Value) -> protocol::Result<Allocation> {
        let mut alloc: Allocation = serde_json::from_value(value.clone())
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        alloc.kind = "flaky".to_string();
        Ok(alloc)
    }
}

/// The default drivers plus a flaky one with the given failure counts.
pub fn registry_with_flaky(fail_makes: u32, fail_reads: u32) -> Arc<ProtocolRegistry> {
    let mut registry = ProtocolRegistry::with_defaults();
    registry.register(Arc::new(FlakyDriver::new(fail_makes, fail_reads)));
    Arc::new(registry)
}
