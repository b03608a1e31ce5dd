//! Pending outbound transactional messages
//!
//! Only Transactional-kind envelopes are persisted; Normal and Triggered
//! traffic lives in memory. A row exists from `enqueue` until the matching
//! CALLRESULT/CALLERROR is observed or the attempt budget is exhausted.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "message_queue")]
pub struct Model {
    /// OCPP-J unique id of the CALL.
    #[sea_orm(primary_key, auto_increment = false)]
    pub unique_id: String,

    pub action: String,

    /// CALL payload as JSON text.
    pub payload: String,

    /// Transaction this message belongs to; used to rewrite pending
    /// messages when the CSMS assigns the real transaction id.
    #[sea_orm(nullable)]
    pub transaction_id: Option<String>,

    pub attempts: i32,

    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
