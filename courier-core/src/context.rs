use std::sync::Arc;

use crate::config::Config;
use crate::db::{create_pool, DbPool};
use crate::store::PgStore;

/// Shared handles for every pipeline stage.
#[derive(Clone)]
pub struct CourierContext {
    pub config: Arc<Config>,
    pub db_pool: Arc<DbPool>,
}

impl CourierContext {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let db_pool = create_pool(&config.database).await?;

        Ok(CourierContext {
            config: Arc::new(config),
            db_pool,
        })
    }

    /// Postgres-backed implementation of every repository trait.
    pub fn store(&self) -> Arc<PgStore> {
        Arc::new(PgStore::new(self.db_pool.clone()))
    }
}
