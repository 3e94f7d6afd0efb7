use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::{PgPool, postgres::PgPoolOptions};

/// Checkout and confirmation hold row locks only briefly; a short acquire
/// timeout turns pool exhaustion into an error instead of a hung request.
pub async fn connect_database(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
        .context("database connection failed")?;

    Ok(pool)
}
