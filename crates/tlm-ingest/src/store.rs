use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;

use tlm_db::insert_or_update;
use tlm_schemas::Payload;

use crate::RecordStore;

/// Writes mapped rows into one table by insert-or-update on `key_fields`.
pub struct PgRecordStore {
    pool: PgPool,
    table: String,
    key_fields: Vec<String>,
}

impl PgRecordStore {
    pub fn new(pool: PgPool, table: impl Into<String>, key_fields: Vec<String>) -> Self {
        Self {
            pool,
            table: table.into(),
            key_fields,
        }
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn store(&mut self, row: &Payload) -> Result<()> {
        insert_or_update(&self.pool, &self.table, &self.key_fields, row).await?;
        Ok(())
    }
}
