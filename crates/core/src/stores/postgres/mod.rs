//! PostgreSQL implementations of the store traits.

mod discussions;
mod ideas;
mod topics;

pub use discussions::PgDiscussionStore;
pub use ideas::PgIdeaStore;
pub use topics::PgTopicStore;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use tracing::info;

use crate::config::DatabaseConfig;

/// Connect to PostgreSQL and run pending migrations.
pub async fn connect(config: &DatabaseConfig) -> Result<Pool<Postgres>> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect(&config.url)
        .await
        .context("Failed to connect to PostgreSQL")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run database migrations")?;

    info!("Database connected and migrations applied");
    Ok(pool)
}
