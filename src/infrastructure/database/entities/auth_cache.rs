//! Authorization cache entries keyed by token hash

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "auth_cache")]
pub struct Model {
    /// Lowercase hex SHA-256 of the id token.
    #[sea_orm(primary_key, auto_increment = false)]
    pub token_hash: String,

    /// Serialized IdTokenInfo.
    pub id_token_info: String,

    #[sea_orm(nullable)]
    pub expiry: Option<DateTimeUtc>,

    /// LRU bookkeeping: refreshed on every read.
    pub last_used: DateTimeUtc,

    /// Size this entry accounts for against AuthCacheStorage.
    pub size_bytes: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
