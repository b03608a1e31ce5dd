//! Database migrations module
//!
//! Forward-only, numbered. Never edit a shipped migration; append a new one.

pub use sea_orm_migration::prelude::*;

mod m20250301_000001_create_message_queue;
mod m20250301_000002_create_transactions;
mod m20250301_000003_create_charging_profiles;
mod m20250301_000004_create_auth_cache;
mod m20250301_000005_create_availability;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250301_000001_create_message_queue::Migration),
            Box::new(m20250301_000002_create_transactions::Migration),
            Box::new(m20250301_000003_create_charging_profiles::Migration),
            Box::new(m20250301_000004_create_auth_cache::Migration),
            Box::new(m20250301_000005_create_availability::Migration),
        ]
    }
}
