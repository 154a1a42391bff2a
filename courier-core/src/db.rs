use anyhow::{anyhow, Result};
use diesel_async::pooled_connection::deadpool::{Object, Pool};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;
use std::sync::Arc;
use tokio::time::Duration;

use crate::config::DatabaseConfig;

pub type DbPool = Pool<AsyncPgConnection>;
pub type DbConnection = Object<AsyncPgConnection>;

const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Builds the deadpool and waits until one connection can be checked out,
/// backing off 1s, 2s, 4s, 8s between attempts.
pub async fn create_pool(config: &DatabaseConfig) -> Result<Arc<DbPool>> {
    tracing::info!(
        url = %mask_database_url(&config.url),
        max_connections = config.max_connections,
        "Setting up database connection pool"
    );

    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(&config.url);
    let pool = Pool::builder(manager)
        .max_size(config.max_connections as usize)
        .build()
        .map_err(|e| anyhow!("Failed to create connection pool: {}", e))?;

    let mut last_error = anyhow!("Failed to establish database connection");
    for attempt in 1..=CONNECT_ATTEMPTS {
        match tokio::time::timeout(CONNECT_TIMEOUT, pool.get()).await {
            Ok(Ok(_conn)) => {
                tracing::info!(attempt, "Database connection established");
                return Ok(Arc::new(pool));
            }
            Ok(Err(e)) => {
                tracing::warn!(attempt, "Database connection failed: {}", e);
                last_error = anyhow!("Database connection failed: {}", e);
            }
            Err(_) => {
                tracing::warn!(attempt, "Database connection timed out");
                last_error = anyhow!("Database connection timed out");
            }
        }

        if attempt < CONNECT_ATTEMPTS {
            let wait_time = Duration::from_secs(2_u64.pow(attempt - 1));
            tokio::time::sleep(wait_time).await;
        }
    }

    tracing::error!("All {} database connection attempts failed", CONNECT_ATTEMPTS);
    Err(last_error)
}

/// Hides the password part of a connection URL for logging.
pub fn mask_database_url(url: &str) -> String {
    let Some(at_pos) = url.rfind('@') else {
        return "<unparseable database url>".to_string();
    };
    let (credentials, host) = url.split_at(at_pos);
    match credentials.rfind(':') {
        // `postgres://user:pass` has a colon after the scheme separator
        Some(colon_pos) if colon_pos > credentials.find("://").map_or(0, |p| p + 2) => {
            format!("{}:****{}", &credentials[..colon_pos], host)
        }
        _ => format!("{}{}", credentials, host),
    }
}
