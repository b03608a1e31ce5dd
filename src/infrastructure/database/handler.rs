//! DatabaseHandler: the station's contract over the relational store
//!
//! Thin, typed operations over the five persisted schemas. Writes that must
//! be atomic run inside a SeaORM transaction; an uncommitted transaction
//! rolls back on drop, so every exit path either commits fully or leaves no
//! trace.

use chrono::Utc;
use sea_orm::ActiveValue::Set;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DatabaseTransaction, DbErr, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, TransactionTrait,
};
use tracing::{debug, warn};

use super::entities::{auth_cache, availability, charging_profile, message_queue, transaction};
use crate::domain::{
    ChargingProfile, ChargingProfilePurpose, IdTokenInfo, OperationalStatus, ProfileSource,
    StopReason, Transaction,
};

/// A persisted outbound message restored from the queue table.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedMessage {
    pub unique_id: String,
    pub action: String,
    pub payload: serde_json::Value,
    pub transaction_id: Option<String>,
    pub attempts: i32,
}

/// Filter for profile deletion and reporting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileFilter {
    pub profile_id: Option<i32>,
    pub evse_id: Option<i32>,
    pub purpose: Option<ChargingProfilePurpose>,
    pub stack_level: Option<i32>,
    pub transaction_id: Option<String>,
}

/// A stored profile together with its placement and source.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredProfile {
    pub profile: ChargingProfile,
    pub evse_id: i32,
    pub source: ProfileSource,
}

pub struct DatabaseHandler {
    db: DatabaseConnection,
}

impl DatabaseHandler {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Begin a scoped transaction. The returned handle commits explicitly
    /// and rolls back on drop. Nested calls are not supported.
    pub async fn begin(&self) -> Result<DatabaseTransaction, DbErr> {
        self.db.begin().await
    }

    // ── Message queue ──────────────────────────────────────

    /// Persist a transactional outbound message. Durable before the caller
    /// observes the enqueue as successful.
    pub async fn queue_insert(
        &self,
        unique_id: &str,
        action: &str,
        payload: &serde_json::Value,
        transaction_id: Option<&str>,
    ) -> Result<(), DbErr> {
        let record = message_queue::ActiveModel {
            unique_id: Set(unique_id.to_string()),
            action: Set(action.to_string()),
            payload: Set(payload.to_string()),
            transaction_id: Set(transaction_id.map(|s| s.to_string())),
            attempts: Set(0),
            created_at: Set(Utc::now()),
        };
        record.insert(&self.db).await?;
        debug!(unique_id, action, "Queued transactional message");
        Ok(())
    }

    pub async fn queue_remove(&self, unique_id: &str) -> Result<(), DbErr> {
        message_queue::Entity::delete_by_id(unique_id.to_string())
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn queue_update_attempts(&self, unique_id: &str, attempts: i32) -> Result<(), DbErr> {
        if let Some(found) = message_queue::Entity::find_by_id(unique_id.to_string())
            .one(&self.db)
            .await?
        {
            let mut active: message_queue::ActiveModel = found.into();
            active.attempts = Set(attempts);
            active.update(&self.db).await?;
        }
        Ok(())
    }

    /// Rewrite the payloads of every pending record that refers to
    /// `local_id`, substituting the CSMS-assigned transaction id. Runs
    /// atomically: either all referring records are rewritten or none.
    pub async fn queue_rewrite_transaction_id(
        &self,
        local_id: &str,
        csms_id: &str,
        rewrite: impl Fn(&mut serde_json::Value),
    ) -> Result<usize, DbErr> {
        let txn = self.db.begin().await?;
        let pending = message_queue::Entity::find()
            .filter(message_queue::Column::TransactionId.eq(local_id))
            .all(&txn)
            .await?;
        let count = pending.len();
        for found in pending {
            let mut payload: serde_json::Value =
                serde_json::from_str(&found.payload).unwrap_or(serde_json::Value::Null);
            rewrite(&mut payload);
            let mut active: message_queue::ActiveModel = found.into();
            active.transaction_id = Set(Some(csms_id.to_string()));
            active.payload = Set(payload.to_string());
            active.update(&txn).await?;
        }
        txn.commit().await?;
        Ok(count)
    }

    /// All pending messages in insertion order.
    pub async fn queue_pending(&self) -> Result<Vec<PersistedMessage>, DbErr> {
        let rows = message_queue::Entity::find()
            .order_by_asc(message_queue::Column::CreatedAt)
            .all(&self.db)
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|r| {
                let payload = match serde_json::from_str(&r.payload) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(unique_id = r.unique_id.as_str(), error = %e,
                              "Dropping unreadable queue record");
                        return None;
                    }
                };
                Some(PersistedMessage {
                    unique_id: r.unique_id,
                    action: r.action,
                    payload,
                    transaction_id: r.transaction_id,
                    attempts: r.attempts,
                })
            })
            .collect())
    }

    // ── Transactions ───────────────────────────────────────

    pub async fn insert_transaction(&self, tx: &Transaction) -> Result<(), DbErr> {
        let record = transaction::ActiveModel {
            transaction_id: Set(tx.transaction_id.clone()),
            evse_id: Set(tx.evse_id),
            connector_id: Set(tx.connector_id),
            id_token: Set(tx.id_token.clone()),
            group_id_token: Set(tx.group_id_token.clone()),
            reservation_id: Set(tx.reservation_id),
            remote_start_id: Set(tx.remote_start_id),
            start_time: Set(tx.start_time),
            start_meter_wh: Set(tx.start_meter_wh),
            seq_no: Set(tx.seq_no),
            active: Set(tx.active),
            stop_time: Set(tx.stop_time),
            stop_meter_wh: Set(tx.stop_meter_wh),
            stop_reason: Set(tx.stop_reason.map(|r| r.as_str().to_string())),
        };
        record.insert(&self.db).await?;
        Ok(())
    }

    pub async fn update_transaction(&self, tx: &Transaction) -> Result<(), DbErr> {
        let record = transaction::ActiveModel {
            transaction_id: Set(tx.transaction_id.clone()),
            evse_id: Set(tx.evse_id),
            connector_id: Set(tx.connector_id),
            id_token: Set(tx.id_token.clone()),
            group_id_token: Set(tx.group_id_token.clone()),
            reservation_id: Set(tx.reservation_id),
            remote_start_id: Set(tx.remote_start_id),
            start_time: Set(tx.start_time),
            start_meter_wh: Set(tx.start_meter_wh),
            seq_no: Set(tx.seq_no),
            active: Set(tx.active),
            stop_time: Set(tx.stop_time),
            stop_meter_wh: Set(tx.stop_meter_wh),
            stop_reason: Set(tx.stop_reason.map(|r| r.as_str().to_string())),
        };
        record.update(&self.db).await?;
        Ok(())
    }

    /// Change a transaction's primary id (CSMS assignment in OCPP 1.6).
    pub async fn rename_transaction(&self, local_id: &str, csms_id: &str) -> Result<(), DbErr> {
        let txn = self.db.begin().await?;
        if let Some(found) = transaction::Entity::find_by_id(local_id.to_string())
            .one(&txn)
            .await?
        {
            let mut renamed: transaction::ActiveModel = found.clone().into();
            renamed.transaction_id = Set(csms_id.to_string());
            transaction::Entity::delete_by_id(local_id.to_string())
                .exec(&txn)
                .await?;
            renamed.insert(&txn).await?;
        }
        txn.commit().await?;
        Ok(())
    }

    pub async fn get_transaction(&self, transaction_id: &str) -> Result<Option<Transaction>, DbErr> {
        Ok(transaction::Entity::find_by_id(transaction_id.to_string())
            .one(&self.db)
            .await?
            .map(model_to_transaction))
    }

    /// Every transaction still in the database, resurrection input on boot.
    pub async fn all_transactions(&self) -> Result<Vec<Transaction>, DbErr> {
        let rows = transaction::Entity::find()
            .order_by_asc(transaction::Column::StartTime)
            .all(&self.db)
            .await?;
        Ok(rows.into_iter().map(model_to_transaction).collect())
    }

    pub async fn active_transactions(&self) -> Result<Vec<Transaction>, DbErr> {
        let rows = transaction::Entity::find()
            .filter(transaction::Column::Active.eq(true))
            .all(&self.db)
            .await?;
        Ok(rows.into_iter().map(model_to_transaction).collect())
    }

    pub async fn delete_transaction(&self, transaction_id: &str) -> Result<(), DbErr> {
        transaction::Entity::delete_by_id(transaction_id.to_string())
            .exec(&self.db)
            .await?;
        Ok(())
    }

    // ── Charging profiles ──────────────────────────────────

    /// Insert or replace a profile. Durable before SetChargingProfile is
    /// answered Accepted.
    pub async fn upsert_profile(
        &self,
        profile: &ChargingProfile,
        evse_id: i32,
        source: ProfileSource,
    ) -> Result<(), DbErr> {
        let json = serde_json::to_string(profile)
            .map_err(|e| DbErr::Custom(format!("profile serialization: {}", e)))?;
        let txn = self.db.begin().await?;
        charging_profile::Entity::delete_by_id(profile.id)
            .exec(&txn)
            .await?;
        let record = charging_profile::ActiveModel {
            profile_id: Set(profile.id),
            evse_id: Set(evse_id),
            stack_level: Set(profile.stack_level),
            purpose: Set(profile.charging_profile_purpose.as_str().to_string()),
            transaction_id: Set(profile.transaction_id.clone()),
            source: Set(source.as_str().to_string()),
            profile: Set(json),
            created_at: Set(Utc::now()),
        };
        record.insert(&txn).await?;
        txn.commit().await?;
        Ok(())
    }

    pub async fn delete_profiles(&self, filter: &ProfileFilter) -> Result<u64, DbErr> {
        let mut delete = charging_profile::Entity::delete_many();
        if let Some(id) = filter.profile_id {
            delete = delete.filter(charging_profile::Column::ProfileId.eq(id));
        }
        if let Some(evse_id) = filter.evse_id {
            delete = delete.filter(charging_profile::Column::EvseId.eq(evse_id));
        }
        if let Some(purpose) = filter.purpose {
            delete = delete.filter(charging_profile::Column::Purpose.eq(purpose.as_str()));
        }
        if let Some(level) = filter.stack_level {
            delete = delete.filter(charging_profile::Column::StackLevel.eq(level));
        }
        if let Some(ref tx_id) = filter.transaction_id {
            delete = delete.filter(charging_profile::Column::TransactionId.eq(tx_id.clone()));
        }
        let result = delete.exec(&self.db).await?;
        Ok(result.rows_affected)
    }

    pub async fn list_profiles(&self, filter: &ProfileFilter) -> Result<Vec<StoredProfile>, DbErr> {
        let mut select = charging_profile::Entity::find();
        if let Some(id) = filter.profile_id {
            select = select.filter(charging_profile::Column::ProfileId.eq(id));
        }
        if let Some(evse_id) = filter.evse_id {
            select = select.filter(charging_profile::Column::EvseId.eq(evse_id));
        }
        if let Some(purpose) = filter.purpose {
            select = select.filter(charging_profile::Column::Purpose.eq(purpose.as_str()));
        }
        if let Some(level) = filter.stack_level {
            select = select.filter(charging_profile::Column::StackLevel.eq(level));
        }
        if let Some(ref tx_id) = filter.transaction_id {
            select = select.filter(charging_profile::Column::TransactionId.eq(tx_id.clone()));
        }
        let rows = select
            .order_by_asc(charging_profile::Column::ProfileId)
            .all(&self.db)
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|r| {
                let profile: ChargingProfile = match serde_json::from_str(&r.profile) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(profile_id = r.profile_id, error = %e,
                              "Dropping unreadable stored profile");
                        return None;
                    }
                };
                Some(StoredProfile {
                    profile,
                    evse_id: r.evse_id,
                    source: ProfileSource::parse(&r.source).unwrap_or(ProfileSource::Ocpp),
                })
            })
            .collect())
    }

    // ── Availability ───────────────────────────────────────

    /// Persist the individual operational status of a component.
    /// `(0, 0)` addresses the charging station itself.
    pub async fn set_operational_status(
        &self,
        evse_id: i32,
        connector_id: i32,
        status: OperationalStatus,
    ) -> Result<(), DbErr> {
        let txn = self.db.begin().await?;
        availability::Entity::delete_by_id((evse_id, connector_id))
            .exec(&txn)
            .await?;
        let record = availability::ActiveModel {
            evse_id: Set(evse_id),
            connector_id: Set(connector_id),
            status: Set(status.as_str().to_string()),
        };
        record.insert(&txn).await?;
        txn.commit().await?;
        Ok(())
    }

    pub async fn get_operational_status(
        &self,
        evse_id: i32,
        connector_id: i32,
    ) -> Result<Option<OperationalStatus>, DbErr> {
        let row = availability::Entity::find_by_id((evse_id, connector_id))
            .one(&self.db)
            .await?;
        Ok(row.and_then(|r| match r.status.as_str() {
            "Operative" => Some(OperationalStatus::Operative),
            "Inoperative" => Some(OperationalStatus::Inoperative),
            _ => None,
        }))
    }

    // ── Auth cache ─────────────────────────────────────────

    pub async fn auth_cache_put(
        &self,
        token_hash: &str,
        info: &IdTokenInfo,
    ) -> Result<(), DbErr> {
        let json = serde_json::to_string(info)
            .map_err(|e| DbErr::Custom(format!("auth cache serialization: {}", e)))?;
        let size = (token_hash.len() + json.len()) as i64;
        let txn = self.db.begin().await?;
        auth_cache::Entity::delete_by_id(token_hash.to_string())
            .exec(&txn)
            .await?;
        let record = auth_cache::ActiveModel {
            token_hash: Set(token_hash.to_string()),
            id_token_info: Set(json),
            expiry: Set(info.cache_expiry),
            last_used: Set(Utc::now()),
            size_bytes: Set(size),
        };
        record.insert(&txn).await?;
        txn.commit().await?;
        Ok(())
    }

    /// Read an entry and refresh its LRU timestamp. Expired entries are
    /// deleted and reported as absent.
    pub async fn auth_cache_get(&self, token_hash: &str) -> Result<Option<IdTokenInfo>, DbErr> {
        let Some(row) = auth_cache::Entity::find_by_id(token_hash.to_string())
            .one(&self.db)
            .await?
        else {
            return Ok(None);
        };
        if let Some(expiry) = row.expiry {
            if expiry <= Utc::now() {
                auth_cache::Entity::delete_by_id(token_hash.to_string())
                    .exec(&self.db)
                    .await?;
                return Ok(None);
            }
        }
        let info: IdTokenInfo = serde_json::from_str(&row.id_token_info)
            .map_err(|e| DbErr::Custom(format!("auth cache deserialization: {}", e)))?;
        let mut active: auth_cache::ActiveModel = row.into();
        active.last_used = Set(Utc::now());
        active.update(&self.db).await?;
        Ok(Some(info))
    }

    pub async fn auth_cache_delete(&self, token_hash: &str) -> Result<(), DbErr> {
        auth_cache::Entity::delete_by_id(token_hash.to_string())
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn auth_cache_clear(&self) -> Result<(), DbErr> {
        auth_cache::Entity::delete_many().exec(&self.db).await?;
        Ok(())
    }

    pub async fn auth_cache_total_size(&self) -> Result<i64, DbErr> {
        let rows = auth_cache::Entity::find()
            .select_only()
            .column(auth_cache::Column::SizeBytes)
            .into_tuple::<i64>()
            .all(&self.db)
            .await?;
        Ok(rows.into_iter().sum())
    }

    /// Delete least-recently-used entries until the total size fits under
    /// `max_bytes`. Returns the number of evicted entries.
    pub async fn auth_cache_trim_to(&self, max_bytes: i64) -> Result<usize, DbErr> {
        let mut total = self.auth_cache_total_size().await?;
        if total <= max_bytes {
            return Ok(0);
        }
        let rows = auth_cache::Entity::find()
            .order_by_asc(auth_cache::Column::LastUsed)
            .all(&self.db)
            .await?;
        let mut evicted = 0;
        for row in rows {
            if total <= max_bytes {
                break;
            }
            total -= row.size_bytes;
            auth_cache::Entity::delete_by_id(row.token_hash)
                .exec(&self.db)
                .await?;
            evicted += 1;
        }
        Ok(evicted)
    }

    pub async fn auth_cache_len(&self) -> Result<u64, DbErr> {
        auth_cache::Entity::find().count(&self.db).await
    }
}

fn model_to_transaction(m: transaction::Model) -> Transaction {
    Transaction {
        transaction_id: m.transaction_id,
        evse_id: m.evse_id,
        connector_id: m.connector_id,
        id_token: m.id_token,
        group_id_token: m.group_id_token,
        reservation_id: m.reservation_id,
        remote_start_id: m.remote_start_id,
        start_time: m.start_time,
        start_meter_wh: m.start_meter_wh,
        seq_no: m.seq_no,
        active: m.active,
        stop_time: m.stop_time,
        stop_meter_wh: m.stop_meter_wh,
        stop_reason: m.stop_reason.as_deref().and_then(StopReason::parse),
    }
}
