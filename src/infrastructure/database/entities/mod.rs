//! SeaORM entities for the station's persisted state.

pub mod auth_cache;
pub mod availability;
pub mod charging_profile;
pub mod message_queue;
pub mod transaction;
