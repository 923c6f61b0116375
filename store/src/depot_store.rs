use crate::{DataStore, DataStoreError, Fetch, Persist, Result};
use async_trait::async_trait;
use common::Depot;
use sqlx::prelude::FromRow;

const UPSERT_QUERY: &str = r#"
    INSERT INTO depots (access_point, service_type, enabled, config)
    VALUES ($1, $2, $3, $4)
    ON CONFLICT(access_point) DO UPDATE SET
        service_type = excluded.service_type,
        enabled = excluded.enabled,
        config = excluded.config
"#;

#[derive(FromRow)]
pub struct DepotRecord {
    pub access_point: String,
    pub service_type: String,
    pub enabled: i64,
    pub config: String,
}

impl From<&Depot> for DepotRecord {
    fn from(depot: &Depot) -> Self {
        Self {
            access_point: depot.access_point.clone(),
            service_type: depot.service_type.clone(),
            enabled: depot.enabled as i64,
            config: depot.config.to_string(),
        }
    }
}

impl TryFrom<DepotRecord> for Depot {
    type Error = DataStoreError;

    fn try_from(rec: DepotRecord) -> Result<Self> {
        let config = serde_json::from_str(&rec.config).map_err(|_| {
            DataStoreError::Decode(format!("bad depot config for {}", rec.access_point))
        })?;
        Ok(Depot {
            access_point: rec.access_point,
            service_type: rec.service_type,
            enabled: rec.enabled != 0,
            config,
        })
    }
}

#[async_trait]
impl Persist<DepotRecord> for DataStore {
    async fn store_all(&self, items: Vec<DepotRecord>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for entry in items {
            sqlx::query(UPSERT_QUERY)
                .bind(entry.access_point)
                .bind(entry.service_type)
                .bind(entry.enabled)
                .bind(entry.config)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn store(&self, item: DepotRecord) -> Result<()> {
        sqlx::query(UPSERT_QUERY)
            .bind(item.access_point)
            .bind(item.service_type)
            .bind(item.enabled)
            .bind(item.config)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Fetch<String, DepotRecord> for DataStore {
    async fn fetch_by(&self, access_point: &String) -> Result<DepotRecord> {
        let mut results = self.fetch_many(std::slice::from_ref(access_point)).await?;
        results.pop().ok_or(DataStoreError::NotFound)
    }

    async fn fetch_many(&self, access_points: &[String]) -> Result<Vec<DepotRecord>> {
        if access_points.is_empty() {
            return Ok(vec![]);
        }

        let placeholders = (1..=access_points.len())
            .map(|i| format!("${}", i))
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "SELECT access_point, service_type, enabled, config FROM depots \
             WHERE access_point IN ({placeholders})"
        );

        let mut query = sqlx::query_as::<_, DepotRecord>(&sql);
        for key in access_points {
            query = query.bind(key);
        }

        Ok(query.fetch_all(&self.pool).await?)
    }
}

impl DataStore {
    /// Every registered depot, in access-point order.
    pub async fn depots(&self) -> Result<Vec<DepotRecord>> {
        let rows = sqlx::query_as::<_, DepotRecord>(
            "SELECT access_point, service_type, enabled, config FROM depots \
             ORDER BY access_point ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
