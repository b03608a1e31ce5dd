//! Persistence layer
//!
//! One SQLite database owned by [`DatabaseHandler`]. All access goes through
//! its API; nested transactions are disallowed.

pub mod entities;
pub mod handler;
pub mod migrator;

pub use handler::DatabaseHandler;

use sea_orm::{Database, DatabaseConnection};
use sea_orm_migration::MigratorTrait;
use tracing::info;

use migrator::Migrator;

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Database URL (e.g. "sqlite://./station.db?mode=rwc")
    pub url: String,
}

impl DatabaseConfig {
    pub fn sqlite(path: &str) -> Self {
        Self {
            url: format!("sqlite://{}?mode=rwc", path),
        }
    }

    /// In-memory database, used by tests.
    pub fn in_memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self::sqlite("./station.db")
    }
}

/// Connect and bring the schema up to date.
pub async fn init_database(config: &DatabaseConfig) -> Result<DatabaseConnection, sea_orm::DbErr> {
    info!(url = config.url.as_str(), "Connecting to database");
    let db = Database::connect(&config.url).await?;
    Migrator::up(&db, None).await?;
    info!("Database schema up to date");
    Ok(db)
}
