use crate::{DataStore, DataStoreError, Fetch, Persist, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use common::{Allocation, ExnodeId, LIFETIME_FORMAT, Lifetime, Mapping};
use sqlx::prelude::FromRow;

const INSERT_QUERY: &str = r#"
    INSERT INTO extents (exnode_id, kind, schema_uri, location, offset, size,
                         lifetime_start, lifetime_end, cap_read, cap_write, cap_manage)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
"#;

const SELECT_COLUMNS: &str = "exnode_id, kind, schema_uri, location, offset, size, \
     lifetime_start, lifetime_end, cap_read, cap_write, cap_manage";

#[derive(FromRow)]
pub struct ExtentRecord {
    pub exnode_id: String,
    pub kind: String,
    pub schema_uri: String,
    pub location: String,
    pub offset: i64,
    pub size: i64,
    pub lifetime_start: String,
    pub lifetime_end: String,
    pub cap_read: String,
    pub cap_write: String,
    pub cap_manage: String,
}

impl ExtentRecord {
    /// Converts an assembled allocation into its registry row. The parent
    /// back reference must already be set.
    pub fn from_allocation(alloc: &Allocation) -> Result<Self> {
        let parent = alloc
            .parent
            .ok_or_else(|| DataStoreError::Decode("allocation has no parent exnode".to_string()))?;
        Ok(Self {
            exnode_id: parent.to_string(),
            kind: alloc.kind.clone(),
            schema_uri: alloc.schema.clone(),
            location: alloc.location.clone(),
            offset: alloc.offset as i64,
            size: alloc.size as i64,
            lifetime_start: alloc.lifetime.start.format(LIFETIME_FORMAT).to_string(),
            lifetime_end: alloc.lifetime.end.format(LIFETIME_FORMAT).to_string(),
            cap_read: alloc.mapping.read.clone(),
            cap_write: alloc.mapping.write.clone(),
            cap_manage: alloc.mapping.manage.clone(),
        })
    }
}

impl TryFrom<ExtentRecord> for Allocation {
    type Error = DataStoreError;

    fn try_from(rec: ExtentRecord) -> Result<Self> {
        let parse_ts = |raw: &str| {
            NaiveDateTime::parse_from_str(raw, LIFETIME_FORMAT)
                .map_err(|_| DataStoreError::Decode(format!("bad lifetime timestamp: {raw}")))
        };
        let parent: ExnodeId = rec.exnode_id.parse().map_err(|_| {
            DataStoreError::Decode(format!("bad exnode id: {}", rec.exnode_id))
        })?;
        Ok(Allocation {
            schema: rec.schema_uri,
            kind: rec.kind,
            location: rec.location,
            offset: rec.offset as u64,
            size: rec.size as u64,
            parent: Some(parent),
            lifetime: Lifetime {
                start: parse_ts(&rec.lifetime_start)?,
                end: parse_ts(&rec.lifetime_end)?,
            },
            mapping: Mapping {
                read: rec.cap_read,
                write: rec.cap_write,
                manage: rec.cap_manage,
            },
        })
    }
}

#[async_trait]
impl Persist<ExtentRecord> for DataStore {
    async fn store_all(&self, items: Vec<ExtentRecord>) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for entry in items {
            sqlx::query(INSERT_QUERY)
                .bind(entry.exnode_id)
                .bind(entry.kind)
                .bind(entry.schema_uri)
                .bind(entry.location)
                .bind(entry.offset)
                .bind(entry.size)
                .bind(entry.lifetime_start)
                .bind(entry.lifetime_end)
                .bind(entry.cap_read)
                .bind(entry.cap_write)
                .bind(entry.cap_manage)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn store(&self, item: ExtentRecord) -> Result<()> {
        sqlx::query(INSERT_QUERY)
            .bind(item.exnode_id)
            .bind(item.kind)
            .bind(item.schema_uri)
            .bind(item.location)
            .bind(item.offset)
            .bind(item.size)
            .bind(item.lifetime_start)
            .bind(item.lifetime_end)
            .bind(item.cap_read)
            .bind(item.cap_write)
            .bind(item.cap_manage)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Fetch<ExnodeId, Vec<ExtentRecord>> for DataStore {
    /// Returns ALL extents of one exnode, sorted by offset for
    /// reconstruction. Replicas share an offset and keep insertion order.
    async fn fetch_by(&self, exnode_id: &ExnodeId) -> Result<Vec<ExtentRecord>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM extents WHERE exnode_id = $1 ORDER BY offset ASC, id ASC"
        );
        let entries = sqlx::query_as::<_, ExtentRecord>(&sql)
            .bind(exnode_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        Ok(entries)
    }

    async fn fetch_many(&self, exnode_ids: &[ExnodeId]) -> Result<Vec<Vec<ExtentRecord>>> {
        let mut grouped = Vec::with_capacity(exnode_ids.len());
        for id in exnode_ids {
            grouped.push(self.fetch_by(id).await?);
        }
        Ok(grouped)
    }
}
