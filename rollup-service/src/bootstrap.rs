//! Process startup: pool acquisition and wiring of the shared store handle.

use std::{sync::Arc, time::Duration};

use energy_client::{BucketStore, PgBucketStore};
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::{
    config::{AppConfig, ConfigError, DatabaseConfig},
    query::QueryEngine,
    retry::RetryPolicy,
    rollup::RollupUpdater,
};

#[derive(thiserror::Error, Debug)]
pub enum BootstrapError {
    #[error("database unreachable after {attempts} attempts: {source}")]
    Connect {
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Connects with bounded retries. Exhaustion is meant to end the process;
/// steady-state store failures never go through here.
pub async fn connect_pool(cfg: &DatabaseConfig) -> Result<PgPool, BootstrapError> {
    let backoff = Duration::from_millis(cfg.connect_backoff_ms);
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let res = PgPoolOptions::new()
            .max_connections(cfg.max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&cfg.uri)
            .await;
        match res {
            Ok(pool) => {
                tracing::info!(attempt, "connected to database");
                return Ok(pool);
            }
            Err(e) if attempt < cfg.connect_attempts => {
                tracing::warn!(error = %e, attempt, "database connect failed, retrying with backoff");
                tokio::time::sleep(backoff * attempt).await;
            }
            Err(e) => {
                tracing::error!(error = %e, attempt, "database connect failed, giving up");
                return Err(BootstrapError::Connect {
                    attempts: attempt,
                    source: e,
                });
            }
        }
    }
}

/// Everything built from one store handle.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn BucketStore>,
    pub updater: RollupUpdater,
    pub engine: QueryEngine,
    pub store_policy: RetryPolicy,
}

impl Services {
    pub fn new(store: Arc<dyn BucketStore>, cfg: &AppConfig) -> Result<Self, BootstrapError> {
        let updater = RollupUpdater::from_config(store.clone(), &cfg.rollup);
        let engine = QueryEngine::from_config(store.clone(), &cfg.query)?;
        let store_policy = RetryPolicy {
            max_retries: cfg.rollup.max_retries,
            backoff: cfg.rollup.retry_backoff(),
            deadline: cfg.rollup.deadline(),
        };
        Ok(Self {
            store,
            updater,
            engine,
            store_policy,
        })
    }

    pub async fn connect(cfg: &AppConfig) -> Result<Self, BootstrapError> {
        let pool = connect_pool(&cfg.database).await?;
        Self::new(Arc::new(PgBucketStore::new(pool)), cfg)
    }
}
