//! Security functional block
//!
//! Drives the certificate lifecycle: CSR issuance through SignCertificate,
//! CertificateSigned handling (verify, install, follow-ups per use),
//! periodic expiry checks that re-trigger the CSR flow, OCSP cache
//! refresh, and SecurityEventNotification emission. The heavy lifting on
//! certificate material lives in [`EvseSecurity`]; this block owns the
//! protocol choreography.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::connectivity::ConnectivityManager;
use crate::device_model::{variables, DeviceModel};
use crate::domain::{DomainError, SecurityProfileLevel};
use crate::infrastructure::security::{
    CertificateSigningUse, EvseSecurity, InstallCertificateResult, OcspRequestData,
};
use crate::queue::record::{EnqueueOptions, MessageKind};
use crate::queue::MessageQueue;
use crate::support::RepeatingTimer;

/// Standardized security event types this block emits.
pub mod events {
    pub const RECONFIGURATION_OF_SECURITY_PARAMETERS: &str = "ReconfigurationOfSecurityParameters";
    pub const INVALID_CHARGING_STATION_CERTIFICATE: &str = "InvalidChargingStationCertificate";
    pub const INVALID_CSMS_CERTIFICATE: &str = "InvalidCsmsCertificate";
    pub const SECURITY_LOG_WAS_CLEARED: &str = "SecurityLogWasCleared";
    pub const STARTUP_OF_THE_DEVICE: &str = "StartupOfTheDevice";
    pub const SETTING_SYSTEM_TIME: &str = "SettingSystemTime";
}

/// Events the OCPP security appendix marks critical are forwarded to the
/// CSMS; the rest are only logged locally.
fn is_critical(event_type: &str) -> bool {
    matches!(
        event_type,
        events::RECONFIGURATION_OF_SECURITY_PARAMETERS
            | events::INVALID_CHARGING_STATION_CERTIFICATE
            | events::INVALID_CSMS_CERTIFICATE
            | events::SECURITY_LOG_WAS_CLEARED
            | events::STARTUP_OF_THE_DEVICE
            | events::SETTING_SYSTEM_TIME
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateSignedResult {
    Accepted,
    Rejected,
}

/// Fetches an OCSP response for the given request data. Network access is
/// the embedder's concern; without a fetcher the OCSP cache is left alone.
type OcspFetcher = dyn Fn(&OcspRequestData) -> Option<Vec<u8>> + Send + Sync;

pub struct Security {
    evse_security: Arc<EvseSecurity>,
    device_model: Arc<DeviceModel>,
    queue: Arc<MessageQueue>,
    connectivity: Arc<ConnectivityManager>,
    /// Which use the outstanding CSR was generated for.
    pending_csr: Mutex<Option<CertificateSigningUse>>,
    ocsp_fetcher: Mutex<Option<Arc<OcspFetcher>>>,
    timers: Mutex<Vec<RepeatingTimer>>,
}

impl Security {
    pub fn new(
        evse_security: Arc<EvseSecurity>,
        device_model: Arc<DeviceModel>,
        queue: Arc<MessageQueue>,
        connectivity: Arc<ConnectivityManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            evse_security,
            device_model,
            queue,
            connectivity,
            pending_csr: Mutex::new(None),
            ocsp_fetcher: Mutex::new(None),
            timers: Mutex::new(Vec::new()),
        })
    }

    pub fn set_ocsp_fetcher(
        &self,
        fetcher: impl Fn(&OcspRequestData) -> Option<Vec<u8>> + Send + Sync + 'static,
    ) {
        *self.ocsp_fetcher.lock().unwrap() = Some(Arc::new(fetcher));
    }

    // ── CSR flow ───────────────────────────────────────────

    /// Generate a CSR for `use_` and ask the CSMS to sign it. The signed
    /// chain is expected back as a CertificateSigned CALL.
    pub async fn sign_certificate(
        &self,
        use_: CertificateSigningUse,
        station_id: &str,
    ) -> Result<(), DomainError> {
        let organization = self
            .device_model
            .get_text(&variables::ORGANIZATION_NAME)
            .unwrap_or_else(|| "OcppStation".to_string());
        let csr = self
            .evse_security
            .generate_csr(use_, station_id, &organization, "DE")?;

        let certificate_type = match use_ {
            CertificateSigningUse::ChargingStationCertificate => "ChargingStationCertificate",
            CertificateSigningUse::V2GCertificate => "V2GCertificate",
        };
        *self.pending_csr.lock().unwrap() = Some(use_);
        self.queue
            .enqueue(
                "SignCertificate",
                serde_json::json!({"csr": csr, "certificateType": certificate_type}),
                MessageKind::Normal,
                EnqueueOptions::default(),
            )
            .await
            .map_err(|e| DomainError::Security(format!("SignCertificate enqueue: {}", e)))?;
        info!(?use_, "SignCertificate sent");
        Ok(())
    }

    /// Handle a CertificateSigned CALL from the CSMS.
    pub async fn on_certificate_signed(
        self: &Arc<Self>,
        chain_pem: &str,
        certificate_type: Option<&str>,
    ) -> CertificateSignedResult {
        let use_ = match certificate_type {
            Some("V2GCertificate") => CertificateSigningUse::V2GCertificate,
            Some("ChargingStationCertificate") => CertificateSigningUse::ChargingStationCertificate,
            Some(other) => {
                warn!(certificate_type = other, "Unknown certificate type");
                return CertificateSignedResult::Rejected;
            }
            // 1.6 security whitepaper: the type is implied by the pending CSR
            None => self
                .pending_csr
                .lock()
                .unwrap()
                .unwrap_or(CertificateSigningUse::ChargingStationCertificate),
        };

        match self.evse_security.install_certificate_chain(chain_pem, use_) {
            InstallCertificateResult::Accepted => {}
            _ => {
                self.security_event(
                    events::INVALID_CHARGING_STATION_CERTIFICATE,
                    Some("chain verification or installation failed"),
                )
                .await;
                return CertificateSignedResult::Rejected;
            }
        }
        *self.pending_csr.lock().unwrap() = None;

        match use_ {
            CertificateSigningUse::V2GCertificate => {
                // fresh leaf: bring the stapled OCSP data up to date
                self.refresh_ocsp_cache();
            }
            CertificateSigningUse::ChargingStationCertificate => {
                let level = self
                    .device_model
                    .get_int(&variables::SECURITY_PROFILE)
                    .and_then(|v| SecurityProfileLevel::from_i32(v as i32));
                if level == Some(SecurityProfileLevel::MutualTls) {
                    info!("Reconnecting with the rotated client certificate");
                    self.connectivity.reconnect();
                    self.security_event(events::RECONFIGURATION_OF_SECURITY_PARAMETERS, None)
                        .await;
                }
            }
        }
        CertificateSignedResult::Accepted
    }

    // ── Security events ────────────────────────────────────

    /// Record a security event; critical ones are reported to the CSMS.
    pub async fn security_event(&self, event_type: &str, tech_info: Option<&str>) {
        info!(event_type, tech_info = tech_info.unwrap_or(""), "Security event");
        if !is_critical(event_type) {
            return;
        }
        let mut payload = serde_json::json!({
            "type": event_type,
            "timestamp": Utc::now().to_rfc3339(),
        });
        if let Some(info) = tech_info {
            payload["techInfo"] = serde_json::json!(info);
        }
        if let Err(e) = self
            .queue
            .enqueue(
                "SecurityEventNotification",
                payload,
                MessageKind::Normal,
                EnqueueOptions::default(),
            )
            .await
        {
            error!(error = %e, "Failed to enqueue SecurityEventNotification");
        }
    }

    // ── Timers ─────────────────────────────────────────────

    /// Arm the certificate-expiry and OCSP-refresh timers. The handles are
    /// owned by this block and cancel on drop.
    pub fn start_timers(self: &Arc<Self>, station_id: String) {
        let expiry_interval = Duration::from_secs(
            self.device_model
                .get_int(&variables::CERT_EXPIRY_CHECK_INTERVAL)
                .unwrap_or(12 * 60 * 60)
                .max(60) as u64,
        );
        let ocsp_interval = Duration::from_secs(
            self.device_model
                .get_int(&variables::OCSP_REQUEST_INTERVAL)
                .unwrap_or(7 * 24 * 60 * 60)
                .max(60) as u64,
        );

        let this = Arc::downgrade(self);
        let id = station_id.clone();
        let expiry_timer = RepeatingTimer::every(expiry_interval, move || {
            let this = this.clone();
            let station_id = id.clone();
            async move {
                if let Some(security) = this.upgrade() {
                    security.check_certificate_expiry(&station_id).await;
                }
            }
        });

        let this = Arc::downgrade(self);
        let ocsp_timer = RepeatingTimer::every(ocsp_interval, move || {
            let this = this.clone();
            async move {
                if let Some(security) = this.upgrade() {
                    security.refresh_ocsp_cache();
                }
            }
        });

        let mut timers = self.timers.lock().unwrap();
        timers.clear();
        timers.push(expiry_timer);
        timers.push(ocsp_timer);
    }

    pub fn stop_timers(&self) {
        self.timers.lock().unwrap().clear();
    }

    /// Trigger a new CSR for every installed leaf whose remaining validity
    /// fell below the notification threshold.
    async fn check_certificate_expiry(self: &Arc<Self>, station_id: &str) {
        let threshold_days = self
            .device_model
            .get_int(&variables::CERT_EXPIRY_NOTIFICATION_DAYS)
            .unwrap_or(30);
        for use_ in [
            CertificateSigningUse::ChargingStationCertificate,
            CertificateSigningUse::V2GCertificate,
        ] {
            if !self.evse_security.has_leaf_certificate(use_) {
                continue;
            }
            match self.evse_security.days_until_leaf_expires(use_) {
                Ok(days) if days <= threshold_days => {
                    warn!(?use_, days_left = days, "Certificate close to expiry, requesting renewal");
                    if let Err(e) = self.sign_certificate(use_, station_id).await {
                        error!(?use_, error = %e, "Renewal CSR failed");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(?use_, error = %e, "Expiry check failed"),
            }
        }
    }

    /// Walk the installed V2G leaves and refresh their cached OCSP
    /// responses through the configured fetcher.
    pub fn refresh_ocsp_cache(&self) {
        let fetcher = self.ocsp_fetcher.lock().unwrap().clone();
        let Some(fetcher) = fetcher else {
            return;
        };
        for request in self.evse_security.get_v2g_ocsp_request_data() {
            match fetcher(&request) {
                Some(response) => {
                    if let Err(e) = self
                        .evse_security
                        .update_ocsp_cache(&request.serial_number, &response)
                    {
                        warn!(serial = request.serial_number.as_str(), error = %e,
                              "OCSP cache update failed");
                    }
                }
                None => {
                    warn!(serial = request.serial_number.as_str(), "OCSP fetch yielded no response");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::websocket::{WebSocketConnection, WebSocketTransport};
    use crate::domain::{ConnectionProfile, InfraError, OcppVersion};
    use crate::infrastructure::database::{init_database, DatabaseConfig, DatabaseHandler};
    use async_trait::async_trait;
    use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};

    use crate::support::OcppFrame;
    use std::sync::Mutex as StdMutex;

    struct NoTransport;

    #[async_trait]
    impl WebSocketTransport for NoTransport {
        async fn connect(
            &self,
            _profile: &ConnectionProfile,
            _version: OcppVersion,
        ) -> Result<WebSocketConnection, InfraError> {
            Err(InfraError::WebSocket("unused".to_string()))
        }
    }

    type SentFrames = Arc<StdMutex<Vec<OcppFrame>>>;

    async fn setup() -> (Arc<Security>, Arc<EvseSecurity>, SentFrames) {
        let db = Arc::new(DatabaseHandler::new(
            init_database(&DatabaseConfig::in_memory()).await.unwrap(),
        ));
        let model = Arc::new(DeviceModel::with_defaults());
        let queue = MessageQueue::new(db.clone(), model.clone());
        let sent: SentFrames = Arc::new(StdMutex::new(Vec::new()));
        let sent_clone = sent.clone();
        queue.set_send_fn(move |text| {
            sent_clone
                .lock()
                .unwrap()
                .push(OcppFrame::parse(&text).unwrap());
            true
        });
        queue.start();
        queue.on_booted();
        let connectivity =
            ConnectivityManager::new(model.clone(), Arc::new(NoTransport), OcppVersion::V201);
        let store_dir = std::env::temp_dir().join(format!("security-block-{}", uuid::Uuid::new_v4()));
        let evse_security = Arc::new(EvseSecurity::new(store_dir).unwrap());
        let security = Security::new(evse_security.clone(), model, queue, connectivity);
        (security, evse_security, sent)
    }

    fn sent_event_types(sent: &SentFrames) -> Vec<String> {
        sent.lock()
            .unwrap()
            .iter()
            .filter_map(|f| match f {
                OcppFrame::Call { action, payload, .. } if action == "SecurityEventNotification" => {
                    payload["type"].as_str().map(|s| s.to_string())
                }
                _ => None,
            })
            .collect()
    }

    fn make_signed_chain(evse_security: &EvseSecurity) -> String {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::new()).unwrap();
        ca_params.distinguished_name.push(DnType::CommonName, "CSMS CA");
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca = ca_params.self_signed(&ca_key).unwrap();
        evse_security.install_ca_certificate(
            &ca.pem(),
            crate::infrastructure::security::CaCertificateType::Csms,
        );

        let leaf_key = KeyPair::generate().unwrap();
        let mut leaf_params = CertificateParams::new(Vec::new()).unwrap();
        leaf_params.distinguished_name.push(DnType::CommonName, "station-001");
        let leaf = leaf_params.signed_by(&leaf_key, &ca, &ca_key).unwrap();
        format!("{}{}", leaf.pem(), ca.pem())
    }

    #[tokio::test]
    async fn sign_certificate_enqueues_csr() {
        let (security, _, _) = setup().await;
        security
            .sign_certificate(CertificateSigningUse::ChargingStationCertificate, "station-001")
            .await
            .unwrap();
        assert_eq!(
            *security.pending_csr.lock().unwrap(),
            Some(CertificateSigningUse::ChargingStationCertificate)
        );
    }

    #[tokio::test]
    async fn valid_certificate_signed_installs_leaf() {
        let (security, evse_security, _) = setup().await;
        let chain = make_signed_chain(&evse_security);
        let result = security
            .on_certificate_signed(&chain, Some("ChargingStationCertificate"))
            .await;
        assert_eq!(result, CertificateSignedResult::Accepted);
        assert!(evse_security.has_leaf_certificate(CertificateSigningUse::ChargingStationCertificate));
    }

    #[tokio::test]
    async fn invalid_chain_rejected_with_security_event() {
        let (security, evse_security, sent) = setup().await;
        let result = security
            .on_certificate_signed("garbage", Some("ChargingStationCertificate"))
            .await;
        assert_eq!(result, CertificateSignedResult::Rejected);
        assert!(!evse_security.has_leaf_certificate(CertificateSigningUse::ChargingStationCertificate));
        // the critical security event went out to the CSMS
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(
            sent_event_types(&sent),
            vec!["InvalidChargingStationCertificate"]
        );
    }

    #[tokio::test]
    async fn rotation_at_mutual_tls_triggers_reconnect_event() {
        let (security, evse_security, sent) = setup().await;
        security
            .device_model
            .set_value("SecurityCtrlr", "SecurityProfile", "3");
        let chain = make_signed_chain(&evse_security);
        let result = security
            .on_certificate_signed(&chain, Some("ChargingStationCertificate"))
            .await;
        assert_eq!(result, CertificateSignedResult::Accepted);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(
            sent_event_types(&sent),
            vec!["ReconfigurationOfSecurityParameters"]
        );
    }

    #[tokio::test]
    async fn non_critical_events_stay_local() {
        let (security, _, sent) = setup().await;
        security.security_event("UnusualActivity", Some("door open")).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(sent_event_types(&sent).is_empty());
    }
}
