use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};

pub mod memory;
pub mod postgres;
pub mod queries;
pub mod store;

pub use memory::InMemoryIncidentRepository;
pub use postgres::PgIncidentRepository;
pub use store::{
    ActivityBasis, BatchItemError, BatchMetrics, BatchResolveResult, IncidentRepository,
    IncidentStore, ResolutionUpdate, SiteUnit,
};

pub type DbPool = Pool<Postgres>;

pub async fn init_pool(database_url: &str, max_connections: u32) -> Result<DbPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Applies the embedded migrations under `./migrations`.
pub async fn run_migrations(pool: &DbPool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
