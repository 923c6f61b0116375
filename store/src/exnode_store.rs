use crate::{DataStore, DataStoreError, Fetch, Persist, Result};
use async_trait::async_trait;
use common::{Exnode, ExnodeId, Mode};
use sqlx::prelude::FromRow;

const UPSERT_QUERY: &str = r#"
    INSERT INTO exnodes (id, name, size, parent, mode, created, updated, owner, groupname, permission)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
    ON CONFLICT(id) DO UPDATE SET
        name = excluded.name,
        size = excluded.size,
        parent = excluded.parent,
        updated = excluded.updated,
        permission = excluded.permission
"#;

const SELECT_COLUMNS: &str =
    "id, name, size, parent, mode, created, updated, owner, groupname, permission";

#[derive(FromRow)]
pub struct ExnodeRecord {
    pub id: String,
    pub name: String,
    pub size: i64,
    pub parent: Option<String>,
    pub mode: String,
    pub created: i64,
    pub updated: i64,
    pub owner: String,
    pub groupname: String,
    pub permission: String,
}

impl From<&Exnode> for ExnodeRecord {
    fn from(ex: &Exnode) -> Self {
        Self {
            id: ex.id.to_string(),
            name: ex.name.clone(),
            size: ex.size as i64,
            parent: ex.parent.map(|p| p.to_string()),
            mode: ex.mode.as_str().to_string(),
            created: ex.created,
            updated: ex.updated,
            owner: ex.owner.clone(),
            groupname: ex.group.clone(),
            permission: ex.permission.clone(),
        }
    }
}

impl TryFrom<ExnodeRecord> for Exnode {
    type Error = DataStoreError;

    /// Extents and children are not populated here; the session layer
    /// fetches them separately when it needs them.
    fn try_from(rec: ExnodeRecord) -> Result<Self> {
        let id: ExnodeId = rec.id.parse().map_err(|_| {
            DataStoreError::Decode(format!("bad exnode id: {}", rec.id))
        })?;
        let parent = match rec.parent {
            Some(raw) => Some(raw.parse().map_err(|_| {
                DataStoreError::Decode(format!("bad parent id: {raw}"))
            })?),
            None => None,
        };
        let mode: Mode = rec.mode.parse().map_err(DataStoreError::Decode)?;
        Ok(Exnode {
            id,
            name: rec.name,
            size: rec.size as u64,
            parent,
            mode,
            created: rec.created,
            updated: rec.updated,
            owner: rec.owner,
            group: rec.groupname,
            permission: rec.permission,
            extents: Vec::new(),
            children: Vec::new(),
        })
    }
}

#[async_trait]
impl Persist<ExnodeRecord> for DataStore {
    async fn store_all(&self, items: Vec<ExnodeRecord>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for entry in items {
            sqlx::query(UPSERT_QUERY)
                .bind(entry.id)
                .bind(entry.name)
                .bind(entry.size)
                .bind(entry.parent)
                .bind(entry.mode)
                .bind(entry.created)
                .bind(entry.updated)
                .bind(entry.owner)
                .bind(entry.groupname)
                .bind(entry.permission)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn store(&self, item: ExnodeRecord) -> Result<()> {
        sqlx::query(UPSERT_QUERY)
            .bind(item.id)
            .bind(item.name)
            .bind(item.size)
            .bind(item.parent)
            .bind(item.mode)
            .bind(item.created)
            .bind(item.updated)
            .bind(item.owner)
            .bind(item.groupname)
            .bind(item.permission)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Fetch<ExnodeId, ExnodeRecord> for DataStore {
    async fn fetch_by(&self, key: &ExnodeId) -> Result<ExnodeRecord> {
        let mut results = self.fetch_many(&[*key]).await?;
        results.pop().ok_or(DataStoreError::NotFound)
    }

    async fn fetch_many(&self, keys: &[ExnodeId]) -> Result<Vec<ExnodeRecord>> {
        if keys.is_empty() {
            return Ok(vec![]);
        }

        let placeholders = (1..=keys.len())
            .map(|i| format!("${}", i))
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!("SELECT {SELECT_COLUMNS} FROM exnodes WHERE id IN ({placeholders})");

        let mut query = sqlx::query_as::<_, ExnodeRecord>(&sql);
        for id in keys {
            query = query.bind(id.to_string());
        }

        Ok(query.fetch_all(&self.pool).await?)
    }
}

impl DataStore {
    /// Looks up one child of `parent` by name and mode. `None` parent means
    /// the registry root. Directory traversal (mkdir, ls) is built on this.
    pub async fn find_child(
        &self,
        parent: Option<&ExnodeId>,
        name: &str,
        mode: Mode,
    ) -> Result<Option<ExnodeRecord>> {
        let rows = match parent {
            Some(parent) => {
                let sql = format!(
                    "SELECT {SELECT_COLUMNS} FROM exnodes WHERE parent = $1 AND name = $2 AND mode = $3"
                );
                sqlx::query_as::<_, ExnodeRecord>(&sql)
                    .bind(parent.to_string())
                    .bind(name)
                    .bind(mode.as_str())
                    .fetch_optional(&self.pool)
                    .await?
            }
            None => {
                let sql = format!(
                    "SELECT {SELECT_COLUMNS} FROM exnodes WHERE parent IS NULL AND name = $1 AND mode = $2"
                );
                sqlx::query_as::<_, ExnodeRecord>(&sql)
                    .bind(name)
                    .bind(mode.as_str())
                    .fetch_optional(&self.pool)
                    .await?
            }
        };
        Ok(rows)
    }

    /// All children of a directory (or of the root), ordered by name.
    pub async fn children(&self, parent: Option<&ExnodeId>) -> Result<Vec<ExnodeRecord>> {
        let rows = match parent {
            Some(parent) => {
                let sql = format!(
                    "SELECT {SELECT_COLUMNS} FROM exnodes WHERE parent = $1 ORDER BY name ASC"
                );
                sqlx::query_as::<_, ExnodeRecord>(&sql)
                    .bind(parent.to_string())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!(
                    "SELECT {SELECT_COLUMNS} FROM exnodes WHERE parent IS NULL ORDER BY name ASC"
                );
                sqlx::query_as::<_, ExnodeRecord>(&sql)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows)
    }
}
