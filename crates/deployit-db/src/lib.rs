//! PostgreSQL job store for deployit.
//!
//! Provides [`PgJobStore`], the durable [`JobStore`](deployit_core::queue::JobStore)
//! backend, plus pool and migration helpers.

pub mod error;
pub mod job_store;

pub use error::{DbError, DbResult};
pub use job_store::PgJobStore;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str, max_connections: u32) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
