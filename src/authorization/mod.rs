//! Authorization
//!
//! Answers "may this id token charge?" using, in order: the local auth
//! cache, the local authorization list, and a CSMS round-trip bounded by
//! the configured message timeout. Wire payload shapes are version
//! specific, so the station plugs in an [`AuthorizeWire`] that builds the
//! request and parses the response; everything else here is
//! version-agnostic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::device_model::{variables, DeviceModel};
use crate::domain::{AuthorizationStatus, IdTokenInfo};
use crate::infrastructure::database::DatabaseHandler;
use crate::queue::record::{EnqueueOptions, MessageKind};
use crate::queue::{MessageQueue, QueueState};

/// Version glue: how Authorize looks on the wire.
pub trait AuthorizeWire: Send + Sync {
    /// `(action, payload)` for the outbound CALL.
    fn build_request(&self, id_token: &str, certificate: Option<&str>) -> (&'static str, Value);
    /// Extract the token info from the CALLRESULT payload.
    fn parse_response(&self, payload: &Value) -> Option<IdTokenInfo>;
}

/// Lowercase hex SHA-256 of an id token; the only key shape that ever
/// touches storage.
pub fn hash_token(id_token: &str) -> String {
    hex::encode(Sha256::digest(id_token.as_bytes()))
}

/// One entry of the local authorization list.
#[derive(Debug, Clone)]
pub struct LocalListEntry {
    pub id_token: String,
    pub info: Option<IdTokenInfo>,
}

pub struct Authorization {
    db: Arc<DatabaseHandler>,
    device_model: Arc<DeviceModel>,
    queue: Arc<MessageQueue>,
    wire: Arc<dyn AuthorizeWire>,
    local_list: Mutex<HashMap<String, IdTokenInfo>>,
    local_list_version: Mutex<i32>,
}

impl Authorization {
    pub fn new(
        db: Arc<DatabaseHandler>,
        device_model: Arc<DeviceModel>,
        queue: Arc<MessageQueue>,
        wire: Arc<dyn AuthorizeWire>,
    ) -> Self {
        Self {
            db,
            device_model,
            queue,
            wire,
            local_list: Mutex::new(HashMap::new()),
            local_list_version: Mutex::new(0),
        }
    }

    /// Authorize an id token, optionally with the contract certificate and
    /// OCSP data forwarded from ISO 15118 plug-and-charge.
    pub async fn authorize(
        &self,
        id_token: &str,
        certificate: Option<&str>,
    ) -> IdTokenInfo {
        let token_hash = hash_token(id_token);

        // 1. local auth cache (expiry enforced by the read)
        if self.cache_enabled() && self.pre_authorize_enabled() {
            match self.db.auth_cache_get(&token_hash).await {
                Ok(Some(info)) => {
                    debug!(token_hash = token_hash.as_str(), status = info.status.as_str(),
                           "Auth cache hit");
                    return info;
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Auth cache read failed"),
            }
        }

        // 2. local authorization list
        if self.local_list_enabled() {
            let hit = self.local_list.lock().unwrap().get(&token_hash).cloned();
            if let Some(info) = hit {
                if !info.is_expired(Utc::now()) {
                    debug!(token_hash = token_hash.as_str(), "Local list hit");
                    return info;
                }
            }
        }

        // 3. offline rule
        if self.queue.state() != QueueState::Booted {
            return self.offline_fallback();
        }

        // 4. CSMS round-trip, bounded by MessageTimeout inside the queue
        let (action, payload) = self.wire.build_request(id_token, certificate);
        let enqueued = self
            .queue
            .enqueue_with_response(action, payload, MessageKind::Normal, EnqueueOptions::default())
            .await;
        let response = match enqueued {
            Ok((_, rx)) => rx.await,
            Err(e) => {
                warn!(error = %e, "Failed to enqueue Authorize");
                return self.offline_fallback();
            }
        };
        match response {
            Ok(Ok(payload)) => {
                let info = self
                    .wire
                    .parse_response(&payload)
                    .unwrap_or_else(|| IdTokenInfo::with_status(AuthorizationStatus::Invalid));
                if self.cache_enabled() {
                    self.cache_store(&token_hash, &info).await;
                }
                info
            }
            Ok(Err(e)) => {
                // 5. never block the caller forever: timeout and transport
                // failures fall back to the offline rule
                warn!(error = %e, "Authorize round-trip failed");
                self.offline_fallback()
            }
            Err(_) => self.offline_fallback(),
        }
    }

    fn offline_fallback(&self) -> IdTokenInfo {
        if self
            .device_model
            .get_bool(&variables::OFFLINE_TX_FOR_UNKNOWN_ID_ENABLED)
            .unwrap_or(false)
        {
            info!("Offline: accepting unknown token per OfflineTxForUnknownIdEnabled");
            IdTokenInfo::accepted()
        } else {
            IdTokenInfo::with_status(AuthorizationStatus::Unknown)
        }
    }

    async fn cache_store(&self, token_hash: &str, info: &IdTokenInfo) {
        if let Err(e) = self.db.auth_cache_put(token_hash, info).await {
            warn!(error = %e, "Auth cache write failed");
            return;
        }
        // the aggregate byte size must stay under AuthCacheStorage; evict
        // least-recently-used entries as needed
        let capacity = self
            .device_model
            .get_int(&variables::AUTH_CACHE_STORAGE)
            .unwrap_or(1024 * 1024);
        match self.db.auth_cache_trim_to(capacity).await {
            Ok(evicted) if evicted > 0 => {
                debug!(evicted, "Auth cache trimmed to capacity");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Auth cache trim failed"),
        }
    }

    /// ClearCache support.
    pub async fn clear_cache(&self) -> bool {
        match self.db.auth_cache_clear().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Auth cache clear failed");
                false
            }
        }
    }

    // ── Local authorization list ───────────────────────────

    pub fn local_list_version(&self) -> i32 {
        *self.local_list_version.lock().unwrap()
    }

    /// Apply a SendLocalList. A full update replaces the list; a
    /// differential update upserts entries (absent info removes the entry).
    pub fn update_local_list(
        &self,
        version: i32,
        entries: Vec<LocalListEntry>,
        full_update: bool,
    ) -> bool {
        if !self.local_list_enabled() {
            return false;
        }
        {
            let mut list = self.local_list.lock().unwrap();
            if full_update {
                list.clear();
            }
            for entry in entries {
                let hash = hash_token(&entry.id_token);
                match entry.info {
                    Some(info) => {
                        list.insert(hash, info);
                    }
                    None => {
                        list.remove(&hash);
                    }
                }
            }
        }
        *self.local_list_version.lock().unwrap() = version;
        true
    }

    fn cache_enabled(&self) -> bool {
        self.device_model
            .get_bool(&variables::AUTH_CACHE_ENABLED)
            .unwrap_or(true)
    }

    fn pre_authorize_enabled(&self) -> bool {
        self.device_model
            .get_bool(&variables::LOCAL_PRE_AUTHORIZE)
            .unwrap_or(true)
    }

    fn local_list_enabled(&self) -> bool {
        self.device_model
            .get_bool(&variables::LOCAL_AUTH_LIST_ENABLED)
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database::{init_database, DatabaseConfig};
    use chrono::Duration;

    struct PlainWire;

    impl AuthorizeWire for PlainWire {
        fn build_request(&self, id_token: &str, _certificate: Option<&str>) -> (&'static str, Value) {
            ("Authorize", serde_json::json!({"idTag": id_token}))
        }

        fn parse_response(&self, payload: &Value) -> Option<IdTokenInfo> {
            let status = payload["idTagInfo"]["status"].as_str()?;
            Some(IdTokenInfo::with_status(AuthorizationStatus::parse(status)?))
        }
    }

    async fn block() -> Authorization {
        let db = Arc::new(DatabaseHandler::new(
            init_database(&DatabaseConfig::in_memory()).await.unwrap(),
        ));
        let model = Arc::new(DeviceModel::with_defaults());
        let queue = MessageQueue::new(db.clone(), model.clone());
        // queue deliberately NOT started/connected: offline in all tests
        Authorization::new(db, model, queue, Arc::new(PlainWire))
    }

    #[tokio::test]
    async fn cache_hit_answers_without_outbound_call() {
        let auth = block().await;
        let mut seeded = IdTokenInfo::accepted();
        seeded.cache_expiry = Some(Utc::now() + Duration::hours(1));
        auth.db
            .auth_cache_put(&hash_token("ABCD"), &seeded)
            .await
            .unwrap();

        // connection is down; a cache hit must still answer Accepted
        let result = auth.authorize("ABCD", None).await;
        assert_eq!(result.status, AuthorizationStatus::Accepted);
        // and nothing was queued
        assert!(auth.db.queue_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_cache_entry_falls_through_to_unknown_offline() {
        let auth = block().await;
        let mut seeded = IdTokenInfo::accepted();
        seeded.cache_expiry = Some(Utc::now() - Duration::hours(1));
        auth.db
            .auth_cache_put(&hash_token("ABCD"), &seeded)
            .await
            .unwrap();

        let result = auth.authorize("ABCD", None).await;
        assert_eq!(result.status, AuthorizationStatus::Unknown);
    }

    #[tokio::test]
    async fn offline_unknown_token_accepted_when_configured() {
        let auth = block().await;
        auth.device_model.set_internal(
            &variables::OFFLINE_TX_FOR_UNKNOWN_ID_ENABLED,
            crate::device_model::VariableValue::Bool(true),
        );
        let result = auth.authorize("NEVER-SEEN", None).await;
        assert_eq!(result.status, AuthorizationStatus::Accepted);
    }

    #[tokio::test]
    async fn local_list_consulted_before_csms() {
        let auth = block().await;
        assert!(auth.update_local_list(
            3,
            vec![LocalListEntry {
                id_token: "LISTED".into(),
                info: Some(IdTokenInfo::with_status(AuthorizationStatus::Blocked)),
            }],
            true,
        ));
        assert_eq!(auth.local_list_version(), 3);

        let result = auth.authorize("LISTED", None).await;
        assert_eq!(result.status, AuthorizationStatus::Blocked);
    }

    #[tokio::test]
    async fn differential_update_removes_entry_without_info() {
        let auth = block().await;
        auth.update_local_list(
            1,
            vec![LocalListEntry {
                id_token: "A".into(),
                info: Some(IdTokenInfo::accepted()),
            }],
            true,
        );
        auth.update_local_list(
            2,
            vec![LocalListEntry {
                id_token: "A".into(),
                info: None,
            }],
            false,
        );
        let result = auth.authorize("A", None).await;
        assert_eq!(result.status, AuthorizationStatus::Unknown);
    }

    #[tokio::test]
    async fn clear_cache_empties_storage() {
        let auth = block().await;
        auth.db
            .auth_cache_put(&hash_token("X"), &IdTokenInfo::accepted())
            .await
            .unwrap();
        assert!(auth.clear_cache().await);
        assert_eq!(auth.db.auth_cache_len().await.unwrap(), 0);
    }
}
