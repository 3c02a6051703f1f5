//! Database connection handling
//!
//! Picks the adapter for the configured driver and connects it.

use std::sync::Arc;

use crate::config::DatabaseConfig;
use crate::db::adapter::DatabaseAdapter;
use crate::db::dialect::Dialect;
use crate::db::mysql::MySqlAdapter;
use crate::db::postgres::PostgresAdapter;
use crate::db::sqlite::SqliteAdapter;
use crate::error::Result;

/// Create a connected adapter from configuration
pub async fn connect(config: &DatabaseConfig) -> Result<Arc<dyn DatabaseAdapter>> {
    let adapter: Arc<dyn DatabaseAdapter> = match Dialect::from_driver(&config.driver)? {
        Dialect::Postgres => Arc::new(PostgresAdapter::connect(config).await?),
        Dialect::MySql => Arc::new(MySqlAdapter::connect(config).await?),
        Dialect::Sqlite => Arc::new(SqliteAdapter::connect(config).await?),
    };

    tracing::info!(driver = %adapter.dialect(), "Database connection established");
    Ok(adapter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[tokio::test]
    async fn rejects_unknown_driver() {
        let config = DatabaseConfig {
            driver: "oracle".to_string(),
            url: "oracle://localhost".to_string(),
            pool_size: None,
            timeout_seconds: None,
        };
        assert!(matches!(connect(&config).await, Err(Error::ConfigError(_))));
    }

    #[tokio::test]
    async fn connects_in_memory_sqlite() {
        let config = DatabaseConfig {
            driver: "sqlite".to_string(),
            url: "sqlite::memory:".to_string(),
            pool_size: None,
            timeout_seconds: Some(5),
        };
        let adapter = connect(&config).await.unwrap();
        adapter.ping().await.unwrap();
        assert_eq!(adapter.default_namespace(), "main");
    }
}
