use crate::{Capability, ProtocolDriver, ProtocolError, Result};
use async_trait::async_trait;
use common::{Allocation, Depot, Lifetime, Mapping};
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::Mutex,
    time::Duration,
};
use uuid::Uuid;

pub const POSIX_EXTENT_URI: &str = "http://schemas.strand.dev/exnode/ext/posix#";

/// Directory-backed depot: every allocation is one object file under the
/// configured root, named by a fresh key. Depot config: `{"root": <dir>}`.
///
/// There is no connection to pool, but the verified root directory is
/// cached per configuration identity so repeated calls skip the mkdir.
pub struct PosixDriver {
    roots: Mutex<HashMap<String, PathBuf>>,
}

impl PosixDriver {
    pub fn new() -> Self {
        Self {
            roots: Mutex::new(HashMap::new()),
        }
    }

    async fn root_for(&self, depot: &Depot) -> Result<PathBuf> {
        let configured = depot
            .config
            .get("root")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| {
                ProtocolError::Fatal(format!(
                    "depot {} has no root directory configured",
                    depot.access_point
                ))
            })?;

        {
            let roots = self.roots.lock().expect("posix root cache poisoned");
            if let Some(root) = roots.get(configured) {
                return Ok(root.clone());
            }
        }

        let root = PathBuf::from(configured);
        tokio::fs::create_dir_all(&root).await?;
        self.roots
            .lock()
            .expect("posix root cache poisoned")
            .insert(configured.to_string(), root.clone());
        Ok(root)
    }
}

impl Default for PosixDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProtocolDriver for PosixDriver {
    fn kind(&self) -> &'static str {
        "posix"
    }

    fn schema(&self) -> &'static str {
        POSIX_EXTENT_URI
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

        let root = self.root_for(depot).await?;
        let key = Uuid::new_v4().simple().to_string();
        tokio::fs::write(root.join(&key), data).await?;

        let authority = depot.host();
        let token = |code: &str| {
            Capability::build(
                "posix",
                authority,
                &key,
                &Uuid::new_v4().simple().to_string(),
                code,
            )
        };

        Ok(Allocation {
            schema: POSIX_EXTENT_URI.to_string(),
            kind: "posix".to_string(),
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
        let root = self.root_for(depot).await?;
        let data = tokio::fs::read(root.join(&cap.key)).await?;
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
        let root = self.root_for(depot).await?;
        tokio::fs::write(root.join(&cap.key), data).await?;
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
