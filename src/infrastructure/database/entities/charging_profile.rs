//! Installed charging profiles
//!
//! The full profile is stored as JSON; the filter columns (purpose, stack
//! level, EVSE, transaction) are denormalized so ClearChargingProfile and
//! GetChargingProfiles filters run in SQL.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "charging_profiles")]
pub struct Model {
    /// OCPP profile id.
    #[sea_orm(primary_key, auto_increment = false)]
    pub profile_id: i32,

    /// 0 = the station as a whole.
    pub evse_id: i32,

    pub stack_level: i32,

    pub purpose: String,

    #[sea_orm(nullable)]
    pub transaction_id: Option<String>,

    /// Installation source: Ocpp or External.
    pub source: String,

    /// Full profile serialized as JSON.
    pub profile: String,

    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
