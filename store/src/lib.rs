mod depot_store;
mod exnode_store;
mod extent_store;

pub use depot_store::*;
pub use exnode_store::*;
pub use extent_store::*;

use async_trait::async_trait;
use sqlx::{Any, AnyPool, Pool, any::install_default_drivers, migrate::MigrateError};
use thiserror::Error;

/// A Result type specialized for DataStore operations.
pub type Result<T> = std::result::Result<T, DataStoreError>;

/// `DataStore` is the metadata registry: the single hub for exnode, extent
/// and depot records.
///
/// It wraps one `sqlx::Pool` so connection management stays centralized,
/// and exposes the generic `Persist`/`Fetch` traits instead of one struct
/// per table, so callers only ever hold an immutable reference.
pub struct DataStore {
    pub(crate) pool: Pool<Any>,
}

impl DataStore {
    /// Connects to the registry and runs migrations so the schema is ready
    /// before any operation begins.
    pub async fn new(url: &str) -> Result<Self> {
        install_default_drivers();
        let pool = AnyPool::connect(url).await?;
        Self::with_pool(pool).await
    }

    /// Wraps an existing pool (tests pin an in-memory pool to a single
    /// connection this way).
    pub async fn with_pool(pool: AnyPool) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Closes the underlying pool. Best-effort; in-flight queries finish
    /// first.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// `Persist<Data>` is the write side of the registry.
///
/// `store_all` groups records into a single transaction; the transfer
/// assembler uses it to flush every extent of an exnode in one commit.
#[async_trait]
pub trait Persist<Data: Send + Sync> {
    /// Batch insert in one transaction.
    async fn store_all(&self, items: Vec<Data>) -> Result<()>;

    /// Atomic single insert (upsert on the record's natural key).
    async fn store(&self, item: Data) -> Result<()>;
}

/// `Fetch<ID, Data>` is the read side of the registry. Reading is
/// non-destructive and parallelizable, so it never needs mutable access.
#[async_trait]
pub trait Fetch<ID: Send + Sync, Data: Send + Sync> {
    /// Retrieves a single record by its unique identifier.
    async fn fetch_by(&self, key: &ID) -> Result<Data>;

    /// Retrieves multiple records in a single round-trip using an SQL
    /// `IN` clause.
    async fn fetch_many(&self, keys: &[ID]) -> Result<Vec<Data>>;
}

#[derive(Error, Debug)]
pub enum DataStoreError {
    #[error("Database Error: {0}")]
    DbError(#[from] sqlx::Error),
    #[error("Migration Error: {0}")]
    MigrationError(#[from] MigrateError),
    #[error("Requested record was not found in the store")]
    NotFound,
    #[error("Corrupt registry record: {0}")]
    Decode(String),
}

#[cfg(test)]
async fn setup() -> DataStore {
    use sqlx::any::{AnyPoolOptions, install_default_drivers};
    // A single never-idle connection keeps the in-memory database alive for
    // the whole test.
    install_default_drivers();
    let pool = AnyPoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .connect("sqlite::memory:")
        .await
        .expect("Could not create pool");
    DataStore::with_pool(pool)
        .await
        .expect("Failed to create test store")
}
