//! Persisted Operative/Inoperative statuses
//!
//! One row per component: (0, 0) is the charging station, (e, 0) an EVSE,
//! (e, c) a connector. Only persistent operator intent is stored here;
//! transient connector facts are rebuilt from events after boot.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "availability")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub evse_id: i32,

    #[sea_orm(primary_key, auto_increment = false)]
    pub connector_id: i32,

    /// Operative or Inoperative.
    pub status: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
