//! Station-side transaction records
//!
//! A row is written when a session starts and kept after the stop until
//! every queued message for it has been acknowledged, so a power cut never
//! loses a StopTransaction.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "transactions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub transaction_id: String,

    pub evse_id: i32,
    pub connector_id: i32,
    pub id_token: String,

    #[sea_orm(nullable)]
    pub group_id_token: Option<String>,

    #[sea_orm(nullable)]
    pub reservation_id: Option<i32>,

    #[sea_orm(nullable)]
    pub remote_start_id: Option<i32>,

    pub start_time: DateTimeUtc,

    /// Meter reading at session start, Wh.
    pub start_meter_wh: f64,

    pub seq_no: i32,

    pub active: bool,

    #[sea_orm(nullable)]
    pub stop_time: Option<DateTimeUtc>,

    #[sea_orm(nullable)]
    pub stop_meter_wh: Option<f64>,

    /// One of the OCPP stop reasons, e.g. PowerLoss, Local, Remote.
    #[sea_orm(nullable)]
    pub stop_reason: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
