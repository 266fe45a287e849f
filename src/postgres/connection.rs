use deadpool_postgres::{ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use std::time::Duration;
use tokio_postgres::NoTls;
use tracing::{debug, info};

use crate::config::PostgresConfig;
use crate::{Error, Result};

/// Builds the shared connection pool. Connections are opened lazily.
pub fn create_pool(config: &PostgresConfig) -> Result<Pool> {
    let mut cfg = deadpool_postgres::Config::new();
    cfg.host = Some(config.host.clone());
    cfg.port = Some(config.port);
    cfg.dbname = Some(config.database.clone());
    cfg.user = Some(config.username.clone());
    cfg.password = Some(config.password.clone());
    cfg.connect_timeout = Some(Duration::from_secs(config.connect_timeout_secs));
    cfg.application_name = Some(env!("CARGO_PKG_NAME").to_string());
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });
    cfg.pool = Some(PoolConfig::new(config.pool_size));

    cfg.create_pool(Some(Runtime::Tokio1), NoTls)
        .map_err(|e| Error::Config(format!("Invalid PostgreSQL pool settings: {}", e)))
}

/// Checks a connection out and runs a trivial query.
pub async fn ping(pool: &Pool) -> Result<()> {
    let client = pool.get().await?;
    client.execute("SELECT 1", &[]).await?;
    debug!("PostgreSQL connection successful");
    Ok(())
}

pub async fn connect(config: &PostgresConfig) -> Result<Pool> {
    info!(
        host = %config.host,
        port = config.port,
        database = %config.database,
        pool_size = config.pool_size,
        "Connecting to PostgreSQL"
    );

    let pool = create_pool(config)?;
    ping(&pool).await?;

    info!("Successfully connected to PostgreSQL");
    Ok(pool)
}
