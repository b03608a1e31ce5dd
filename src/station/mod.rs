//! Charge point facade
//!
//! Wires the subsystems together, owns the message-processing loop and the
//! periodic timers, and exposes the public API the embedding application
//! drives. The protocol version is a tag chosen at construction: the
//! queue, scheduler and state manager stay version-agnostic while the
//! `v16` / `v201` glue translates at the wire boundary.

pub mod callbacks;
mod v16;
mod v201;

pub use callbacks::{ResetKind, StationCallbacks};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::BoxFuture;
use serde_json::json;
use tokio::sync::oneshot;
use tracing::{info, warn};
use uuid::Uuid;

use crate::authorization::Authorization;
use crate::availability::{Availability, AvailabilityScope};
use crate::component_state::ComponentStateManager;
use crate::connectivity::websocket::{TungsteniteTransport, WebSocketTransport};
use crate::connectivity::ConnectivityManager;
use crate::device_model::{variables, DeviceModel, VariableValue};
use crate::domain::{
    AppError, ChargingRateUnit, CompositeSchedule, ConnectionProfile, DomainError, IdTokenInfo,
    MeterValue, OcppVersion, ReadingContext, SampledValue, StopReason, Transaction,
};
use crate::infrastructure::database::{init_database, DatabaseConfig, DatabaseHandler};
use crate::infrastructure::security::EvseSecurity;
use crate::queue::record::{EnqueueOptions, MessageKind};
use crate::queue::{MessageQueue, QueueState};
use crate::reservation::{Reservation, ReservationUpdateStatus};
use crate::security::Security;
use crate::smart_charging::{SessionContext, SmartChargingCore};
use crate::support::{OwnedTimer, RepeatingTimer, ShutdownSignal};

/// Static station identity and physical layout.
#[derive(Debug, Clone)]
pub struct StationConfig {
    pub station_id: String,
    pub vendor: String,
    pub model: String,
    pub firmware_version: Option<String>,
    pub version: OcppVersion,
    /// EVSE id to connector count.
    pub evse_structure: BTreeMap<i32, i32>,
    /// EVSE id to `(connector id, connector type)` pairs.
    pub connector_types: HashMap<i32, Vec<(i32, String)>>,
    pub connection_profiles: Vec<ConnectionProfile>,
    pub database: DatabaseConfig,
    pub certificate_store_dir: PathBuf,
}

pub struct ChargePoint {
    config: StationConfig,
    callbacks: StationCallbacks,
    device_model: Arc<DeviceModel>,
    db: Arc<DatabaseHandler>,
    queue: Arc<MessageQueue>,
    connectivity: Arc<ConnectivityManager>,
    state: Arc<ComponentStateManager>,
    smart_charging: Arc<SmartChargingCore>,
    authorization: Arc<Authorization>,
    reservation: Arc<Reservation>,
    availability: Arc<Availability>,
    security: Arc<Security>,

    /// Active transaction per EVSE.
    active_transactions: Mutex<HashMap<i32, Transaction>>,
    /// 1.6 local transaction ids still awaiting the CSMS-assigned id.
    unresolved_tx_ids: Mutex<HashSet<String>>,
    /// 1.6 local id to CSMS id, for bookkeeping started before resolution.
    resolved_aliases: Mutex<HashMap<String, String>>,
    /// Triggered when [`ChargePoint::stop`] runs; embedder tasks that
    /// outlive single calls can wait on it.
    shutdown: ShutdownSignal,
    first_boot_done: AtomicBool,
    heartbeat_timer: Mutex<Option<RepeatingTimer>>,
    aligned_meter_timer: Mutex<Option<RepeatingTimer>>,
    sampled_meter_timer: Mutex<Option<RepeatingTimer>>,
    boot_retry_timer: Mutex<Option<OwnedTimer>>,
}

impl ChargePoint {
    /// Build a station over the production WebSocket transport.
    pub async fn new(
        config: StationConfig,
        callbacks: StationCallbacks,
    ) -> Result<Arc<Self>, AppError> {
        Self::with_transport(
            config,
            callbacks,
            Arc::new(DeviceModel::with_defaults()),
            Arc::new(TungsteniteTransport),
        )
        .await
    }

    /// Full constructor with an injected device model and transport.
    pub async fn with_transport(
        config: StationConfig,
        callbacks: StationCallbacks,
        device_model: Arc<DeviceModel>,
        transport: Arc<dyn WebSocketTransport>,
    ) -> Result<Arc<Self>, AppError> {
        let db = Arc::new(DatabaseHandler::new(init_database(&config.database).await.map_err(
            crate::domain::InfraError::from,
        )?));
        let evse_security = Arc::new(
            EvseSecurity::new(config.certificate_store_dir.clone())
                .map_err(AppError::Infra)?,
        );
        let state = ComponentStateManager::new(&config.evse_structure, db.clone())
            .await
            .map_err(AppError::Domain)?;
        let queue = MessageQueue::new(db.clone(), device_model.clone());
        let connectivity =
            ConnectivityManager::new(device_model.clone(), transport, config.version);
        let wire: Arc<dyn crate::authorization::AuthorizeWire> = match config.version {
            OcppVersion::V16 => Arc::new(v16::V16Wire),
            OcppVersion::V201 | OcppVersion::V21 => Arc::new(v201::V201Wire),
        };
        let authorization = Arc::new(Authorization::new(
            db.clone(),
            device_model.clone(),
            queue.clone(),
            wire,
        ));
        let smart_charging = Arc::new(SmartChargingCore::new(db.clone(), device_model.clone()));
        let reservation = Reservation::new(
            device_model.clone(),
            state.clone(),
            config.connector_types.clone(),
        );
        let availability = Arc::new(Availability::new(state.clone()));
        let security = Security::new(
            evse_security,
            device_model.clone(),
            queue.clone(),
            connectivity.clone(),
        );

        let cp = Arc::new(Self {
            config,
            callbacks,
            device_model,
            db,
            queue,
            connectivity,
            state,
            smart_charging,
            authorization,
            reservation,
            availability,
            security,
            active_transactions: Mutex::new(HashMap::new()),
            unresolved_tx_ids: Mutex::new(HashSet::new()),
            resolved_aliases: Mutex::new(HashMap::new()),
            shutdown: ShutdownSignal::new(),
            first_boot_done: AtomicBool::new(false),
            heartbeat_timer: Mutex::new(None),
            aligned_meter_timer: Mutex::new(None),
            sampled_meter_timer: Mutex::new(None),
            boot_retry_timer: Mutex::new(None),
        });
        cp.wire_components();
        Ok(cp)
    }

    // ── Wiring ─────────────────────────────────────────────

    fn wire_components(self: &Arc<Self>) {
        // connectivity <-> queue
        let queue = self.queue.clone();
        self.connectivity
            .set_message_callback(move |text| queue.on_wire_message(&text));

        let weak = Arc::downgrade(self);
        self.connectivity.set_open_callback(move |slot, _level| {
            if let Some(cp) = weak.upgrade() {
                info!(slot, "Connected, starting boot sequence");
                cp.queue.on_connected();
                cp.spawn_boot_notification();
            }
        });

        let weak = Arc::downgrade(self);
        self.connectivity.set_close_callback(move || {
            if let Some(cp) = weak.upgrade() {
                cp.queue.on_disconnected();
                *cp.heartbeat_timer.lock().unwrap() = None;
            }
        });

        // inbound CALLs, serialized by the queue, land in the version glue
        let weak = Arc::downgrade(self);
        let version = self.config.version;
        self.queue
            .set_call_handler(move |unique_id, action, payload| -> BoxFuture<'static, crate::support::OcppFrame> {
                let weak = weak.clone();
                Box::pin(async move {
                    let Some(cp) = weak.upgrade() else {
                        return crate::support::OcppFrame::error(
                            unique_id,
                            crate::support::RpcErrorCode::InternalError,
                            "station is shutting down",
                        );
                    };
                    match version {
                        OcppVersion::V16 => v16::dispatch(cp, unique_id, action, payload).await,
                        OcppVersion::V201 | OcppVersion::V21 => {
                            v201::dispatch(cp, unique_id, action, payload).await
                        }
                    }
                })
            });

        // state manager -> wire StatusNotifications
        let weak = Arc::downgrade(self);
        self.state
            .set_send_status_notification_callback(move |evse_id, connector_id, status, triggered| {
                let Some(cp) = weak.upgrade() else {
                    return false;
                };
                let sendable = match cp.queue.state() {
                    QueueState::Booted => true,
                    QueueState::Connected => triggered,
                    _ => false,
                };
                if !sendable {
                    return false;
                }
                let payload = match cp.config.version {
                    OcppVersion::V16 => v16::status_notification(evse_id, connector_id, status),
                    OcppVersion::V201 | OcppVersion::V21 => {
                        v201::status_notification(evse_id, connector_id, status)
                    }
                };
                let kind = if triggered {
                    MessageKind::Triggered
                } else {
                    MessageKind::Normal
                };
                let queue = cp.queue.clone();
                tokio::spawn(async move {
                    let _ = queue
                        .enqueue("StatusNotification", payload, kind, EnqueueOptions::default())
                        .await;
                });
                true
            });

        // availability-changed hooks straight through to the application
        if let Some(hook) = self.callbacks.cs_effective_availability_changed.clone() {
            self.state
                .set_cs_effective_availability_changed_callback(move |status| hook(status));
        }
        if let Some(hook) = self.callbacks.evse_effective_availability_changed.clone() {
            self.state
                .set_evse_effective_availability_changed_callback(move |evse, status| {
                    hook(evse, status)
                });
        }
        if let Some(hook) = self.callbacks.connector_effective_availability_changed.clone() {
            self.state
                .set_connector_effective_availability_changed_callback(
                    move |evse, connector, status| hook(evse, connector, status),
                );
        }

        // availability block probes and hooks
        let weak = Arc::downgrade(self);
        self.availability.set_transaction_probe(move |scope| {
            weak.upgrade()
                .map(|cp| cp.transaction_active_in_scope(scope))
                .unwrap_or(false)
        });
        if let Some(hook) = self.callbacks.all_connectors_unavailable.clone() {
            self.availability
                .set_all_connectors_unavailable_callback(move || hook());
        }

        // reservation status updates go upstream (2.x only)
        let weak = Arc::downgrade(self);
        let version = self.config.version;
        self.reservation.set_status_update_callback(move |id, status| {
            if version == OcppVersion::V16 {
                return;
            }
            let Some(cp) = weak.upgrade() else {
                return;
            };
            let status = match status {
                ReservationUpdateStatus::Expired => "Expired",
                ReservationUpdateStatus::Removed => "Removed",
            };
            let queue = cp.queue.clone();
            let payload = json!({"reservationId": id, "reservationUpdateStatus": status});
            tokio::spawn(async move {
                let _ = queue
                    .enqueue(
                        "ReservationStatusUpdate",
                        payload,
                        MessageKind::Normal,
                        EnqueueOptions::default(),
                    )
                    .await;
            });
        });
    }

    // ── Lifecycle ──────────────────────────────────────────

    /// Restore persisted state and open the connection. Returns once the
    /// background machinery is running; connection state is reported via
    /// callbacks.
    pub async fn start(self: &Arc<Self>) -> Result<(), AppError> {
        self.queue.restore_pending().await?;
        self.smart_charging.load_installed_profiles().await?;
        self.resurrect_transactions().await?;
        self.queue.start();
        self.security.start_timers(self.config.station_id.clone());
        self.connectivity
            .configure_profiles(self.config.connection_profiles.clone());
        self.queue.on_connecting();
        self.connectivity.connect();
        Ok(())
    }

    /// Signal the embedding application's long-running tasks.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Graceful stop: drain transactional messages, then close.
    pub async fn stop(&self, grace: Duration) {
        self.shutdown.trigger();
        *self.heartbeat_timer.lock().unwrap() = None;
        *self.aligned_meter_timer.lock().unwrap() = None;
        *self.sampled_meter_timer.lock().unwrap() = None;
        *self.boot_retry_timer.lock().unwrap() = None;
        self.security.stop_timers();
        self.queue.drain(grace).await;
        self.connectivity.disconnect("shutdown");
    }

    /// Bring transactions from before the restart back to life: stopped
    /// ones whose StopTransaction never went out are re-queued (the stored
    /// stop data is used), and still-active ones are closed with
    /// PowerLoss.
    async fn resurrect_transactions(self: &Arc<Self>) -> Result<(), AppError> {
        let transactions = self
            .db
            .all_transactions()
            .await
            .map_err(crate::domain::InfraError::from)?;
        if transactions.is_empty() {
            return Ok(());
        }
        let pending = self
            .db
            .queue_pending()
            .await
            .map_err(crate::domain::InfraError::from)?;

        for mut tx in transactions {
            let has_pending_message = pending
                .iter()
                .any(|m| m.transaction_id.as_deref() == Some(tx.transaction_id.as_str()));

            // 1.6 ids that never got their CSMS assignment stay held until
            // the restored StartTransaction resolves
            if self.config.version == OcppVersion::V16
                && tx.transaction_id.parse::<i64>().is_err()
            {
                self.unresolved_tx_ids
                    .lock()
                    .unwrap()
                    .insert(tx.transaction_id.clone());
                self.queue.hold_transaction(&tx.transaction_id);
                for message in pending
                    .iter()
                    .filter(|m| m.action == "StartTransaction")
                    .filter(|m| m.transaction_id.as_deref() == Some(tx.transaction_id.as_str()))
                {
                    let rx = self.queue.watch_response(&message.unique_id);
                    self.spawn_v16_resolution(tx.transaction_id.clone(), rx);
                }
            }

            if tx.active {
                // the session died with the process
                let stop_meter = tx.stop_meter_wh.unwrap_or(tx.start_meter_wh);
                tx.stop(Utc::now(), stop_meter, StopReason::PowerLoss);
                self.db
                    .update_transaction(&tx)
                    .await
                    .map_err(crate::domain::InfraError::from)?;
                info!(transaction_id = tx.transaction_id.as_str(),
                      "Closing transaction interrupted by restart");
                self.enqueue_stop_message(&tx).await?;
            } else if tx.has_unreported_stop() && !has_pending_message {
                info!(transaction_id = tx.transaction_id.as_str(),
                      "Re-sending StopTransaction lost before restart");
                self.enqueue_stop_message(&tx).await?;
            } else if has_pending_message {
                // the restored queue already carries the stop; just make
                // sure the acknowledgement deletes the row
                for message in pending
                    .iter()
                    .filter(|m| m.transaction_id.as_deref() == Some(tx.transaction_id.as_str()))
                    .filter(|m| Self::is_stop_message(&m.action, &m.payload))
                {
                    let rx = self.queue.watch_response(&message.unique_id);
                    self.spawn_transaction_cleanup(tx.transaction_id.clone(), rx);
                }
            }
        }
        Ok(())
    }

    fn is_stop_message(action: &str, payload: &serde_json::Value) -> bool {
        action == "StopTransaction"
            || (action == "TransactionEvent" && payload["eventType"] == "Ended")
    }

    // ── Boot sequence ──────────────────────────────────────

    fn spawn_boot_notification(self: &Arc<Self>) {
        let cp = self.clone();
        tokio::spawn(async move {
            cp.run_boot_notification().await;
        });
    }

    async fn run_boot_notification(self: Arc<Self>) {
        let payload = match self.config.version {
            OcppVersion::V16 => v16::boot_notification(
                &self.config.vendor,
                &self.config.model,
                self.config.firmware_version.as_deref(),
            ),
            OcppVersion::V201 | OcppVersion::V21 => v201::boot_notification(
                &self.config.vendor,
                &self.config.model,
                self.config.firmware_version.as_deref(),
            ),
        };
        let enqueued = self
            .queue
            .enqueue_with_response(
                "BootNotification",
                payload,
                MessageKind::Triggered,
                EnqueueOptions::default(),
            )
            .await;
        let Ok((_, rx)) = enqueued else {
            return;
        };
        match rx.await {
            Ok(Ok(response)) => {
                let status = response["status"].as_str().unwrap_or("Rejected");
                let interval = response["interval"].as_i64().unwrap_or(0);
                match status {
                    "Accepted" => self.on_boot_accepted(interval).await,
                    other => {
                        // Pending / Rejected: retry at the indicated interval
                        let delay = Duration::from_secs(interval.max(30) as u64);
                        warn!(status = other, retry_in_s = delay.as_secs(),
                              "BootNotification not accepted");
                        let cp = self.clone();
                        *self.boot_retry_timer.lock().unwrap() =
                            Some(OwnedTimer::once(delay, move || async move {
                                cp.spawn_boot_notification();
                            }));
                    }
                }
            }
            Ok(Err(e)) => warn!(error = %e, "BootNotification failed"),
            Err(_) => {}
        }
    }

    async fn on_boot_accepted(self: &Arc<Self>, interval: i64) {
        info!("BootNotification accepted");
        if interval > 0 {
            self.device_model
                .set_internal(&variables::HEARTBEAT_INTERVAL, VariableValue::Int(interval));
        }
        self.queue.on_booted();

        if !self.first_boot_done.swap(true, Ordering::SeqCst) {
            // announcement to the application, then advertisement upstream
            self.state.trigger_all_effective_availability_changed_callbacks();
            self.state.send_status_notification_all_connectors();
        } else {
            self.state.send_status_notification_changed_connectors();
        }

        self.start_heartbeat_timer();
        self.start_meter_timers();
    }

    fn start_heartbeat_timer(self: &Arc<Self>) {
        let interval = self
            .device_model
            .get_int(&variables::HEARTBEAT_INTERVAL)
            .unwrap_or(300)
            .max(1) as u64;
        let weak = Arc::downgrade(self);
        let timer = RepeatingTimer::every(Duration::from_secs(interval), move || {
            let weak = weak.clone();
            async move {
                if let Some(cp) = weak.upgrade() {
                    cp.send_heartbeat(MessageKind::Normal).await;
                }
            }
        });
        *self.heartbeat_timer.lock().unwrap() = Some(timer);
    }

    fn start_meter_timers(self: &Arc<Self>) {
        if self.callbacks.sample_meter.is_none() {
            return;
        }
        let aligned_interval = self
            .device_model
            .get_int(&variables::CLOCK_ALIGNED_DATA_INTERVAL)
            .unwrap_or(0);
        if aligned_interval > 0 {
            let weak = Arc::downgrade(self);
            let timer = RepeatingTimer::clock_aligned(
                Duration::from_secs(aligned_interval as u64),
                move || {
                    let weak = weak.clone();
                    async move {
                        if let Some(cp) = weak.upgrade() {
                            cp.sample_active_transactions(ReadingContext::SampleClock).await;
                        }
                    }
                },
            );
            *self.aligned_meter_timer.lock().unwrap() = Some(timer);
        }
        let sample_interval = self
            .device_model
            .get_int(&variables::METER_VALUE_SAMPLE_INTERVAL)
            .unwrap_or(0);
        if sample_interval > 0 {
            let weak = Arc::downgrade(self);
            let timer =
                RepeatingTimer::every(Duration::from_secs(sample_interval as u64), move || {
                    let weak = weak.clone();
                    async move {
                        if let Some(cp) = weak.upgrade() {
                            cp.sample_active_transactions(ReadingContext::SamplePeriodic).await;
                        }
                    }
                });
            *self.sampled_meter_timer.lock().unwrap() = Some(timer);
        }
    }

    async fn sample_active_transactions(self: &Arc<Self>, context: ReadingContext) {
        let Some(sampler) = self.callbacks.sample_meter.clone() else {
            return;
        };
        let targets: Vec<(i32, i32)> = {
            let map = self.active_transactions.lock().unwrap();
            map.values().map(|tx| (tx.evse_id, tx.connector_id)).collect()
        };
        for (evse_id, connector_id) in targets {
            if let Some(mut sample) = sampler(evse_id, connector_id) {
                for sv in &mut sample.sampled_values {
                    sv.context.get_or_insert(context);
                }
                let _ = self.send_meter_sample(evse_id, &sample).await;
            }
        }
    }

    // ── Public API: sessions ───────────────────────────────

    /// Authorize an id token against cache, local list and CSMS.
    pub async fn authorize(&self, id_token: &str, certificate: Option<&str>) -> IdTokenInfo {
        self.authorization.authorize(id_token, certificate).await
    }

    /// The application established an authorized charging session.
    /// Returns the station-side transaction id.
    pub async fn on_session_started(
        self: &Arc<Self>,
        evse_id: i32,
        connector_id: i32,
        id_token: &str,
        meter_wh: f64,
        reservation_id: Option<i32>,
        remote_start_id: Option<i32>,
    ) -> Result<String, AppError> {
        let _ = self.state.set_connector_occupied(evse_id, connector_id, true);

        let mut tx = Transaction::new(
            Uuid::new_v4().to_string(),
            evse_id,
            connector_id,
            id_token,
            Utc::now(),
            meter_wh,
        );
        tx.reservation_id = reservation_id;
        tx.remote_start_id = remote_start_id;
        if let Some(reservation_id) = reservation_id {
            self.reservation.consume(reservation_id);
            let _ = self.state.set_connector_reserved(evse_id, connector_id, false);
        }

        self.db
            .insert_transaction(&tx)
            .await
            .map_err(crate::domain::InfraError::from)?;

        match self.config.version {
            OcppVersion::V16 => {
                self.unresolved_tx_ids
                    .lock()
                    .unwrap()
                    .insert(tx.transaction_id.clone());
                let (_, rx) = self
                    .queue
                    .enqueue_with_response(
                        "StartTransaction",
                        v16::start_transaction(&tx),
                        MessageKind::Transactional,
                        EnqueueOptions {
                            transaction_id: Some(tx.transaction_id.clone()),
                            held: false,
                        },
                    )
                    .await?;
                self.spawn_v16_resolution(tx.transaction_id.clone(), rx);
            }
            OcppVersion::V201 | OcppVersion::V21 => {
                let seq_no = tx.next_seq_no();
                let trigger = if remote_start_id.is_some() {
                    "RemoteStart"
                } else {
                    "Authorized"
                };
                let payload =
                    v201::transaction_event(v201::TxEventKind::Started, trigger, seq_no, &tx, None);
                self.db
                    .update_transaction(&tx)
                    .await
                    .map_err(crate::domain::InfraError::from)?;
                self.queue
                    .enqueue(
                        "TransactionEvent",
                        payload,
                        MessageKind::Transactional,
                        EnqueueOptions {
                            transaction_id: Some(tx.transaction_id.clone()),
                            held: false,
                        },
                    )
                    .await?;
            }
        }

        let transaction_id = tx.transaction_id.clone();
        self.active_transactions.lock().unwrap().insert(evse_id, tx);
        self.availability.on_transaction_state_changed().await;
        Ok(transaction_id)
    }

    /// A meter sample for the active session on `evse_id`.
    pub async fn on_meter_value(
        self: &Arc<Self>,
        evse_id: i32,
        sample: MeterValue,
    ) -> Result<(), AppError> {
        self.send_meter_sample(evse_id, &sample).await
    }

    async fn send_meter_sample(
        self: &Arc<Self>,
        evse_id: i32,
        sample: &MeterValue,
    ) -> Result<(), AppError> {
        let (payload, action, options) = {
            let mut map = self.active_transactions.lock().unwrap();
            let Some(tx) = map.get_mut(&evse_id) else {
                return Err(AppError::Domain(DomainError::NotFound {
                    entity: "transaction",
                    field: "evse_id",
                    value: evse_id.to_string(),
                }));
            };
            match self.config.version {
                OcppVersion::V16 => {
                    let held = self
                        .unresolved_tx_ids
                        .lock()
                        .unwrap()
                        .contains(&tx.transaction_id);
                    let wire_id = wire_tx_id(&tx.transaction_id);
                    (
                        v16::meter_values(tx, wire_id, sample),
                        "MeterValues",
                        EnqueueOptions {
                            transaction_id: Some(tx.transaction_id.clone()),
                            held,
                        },
                    )
                }
                OcppVersion::V201 | OcppVersion::V21 => {
                    let seq_no = tx.next_seq_no();
                    (
                        v201::transaction_event(
                            v201::TxEventKind::Updated,
                            "MeterValuePeriodic",
                            seq_no,
                            tx,
                            Some(sample),
                        ),
                        "TransactionEvent",
                        EnqueueOptions {
                            transaction_id: Some(tx.transaction_id.clone()),
                            held: false,
                        },
                    )
                }
            }
        };
        if let Some(tx) = self.active_transactions.lock().unwrap().get(&evse_id).cloned() {
            // persist the advanced sequence number
            let db = self.db.clone();
            tokio::spawn(async move {
                let _ = db.update_transaction(&tx).await;
            });
        }
        self.queue
            .enqueue(action, payload, MessageKind::Transactional, options)
            .await?;
        Ok(())
    }

    /// The application finished the charging session on `evse_id`.
    pub async fn on_session_finished(
        self: &Arc<Self>,
        evse_id: i32,
        meter_wh: f64,
        reason: StopReason,
    ) -> Result<(), AppError> {
        let tx = {
            let mut map = self.active_transactions.lock().unwrap();
            map.remove(&evse_id)
        };
        let Some(mut tx) = tx else {
            return Err(AppError::Domain(DomainError::NotFound {
                entity: "transaction",
                field: "evse_id",
                value: evse_id.to_string(),
            }));
        };
        tx.stop(Utc::now(), meter_wh, reason);
        self.db
            .update_transaction(&tx)
            .await
            .map_err(crate::domain::InfraError::from)?;

        self.enqueue_stop_message(&tx).await?;

        let _ = self.state.set_connector_occupied(evse_id, tx.connector_id, false);
        self.smart_charging
            .on_transaction_finished(&tx.transaction_id)
            .await;
        self.availability.on_transaction_state_changed().await;
        Ok(())
    }

    /// Queue the stop message for a stopped transaction and arrange for
    /// the database row to be deleted once the CSMS acknowledges it.
    async fn enqueue_stop_message(self: &Arc<Self>, tx: &Transaction) -> Result<(), AppError> {
        let (action, payload, held) = match self.config.version {
            OcppVersion::V16 => {
                let held = self
                    .unresolved_tx_ids
                    .lock()
                    .unwrap()
                    .contains(&tx.transaction_id);
                (
                    "StopTransaction",
                    v16::stop_transaction(tx, wire_tx_id(&tx.transaction_id)),
                    held,
                )
            }
            OcppVersion::V201 | OcppVersion::V21 => {
                let mut tx = tx.clone();
                let seq_no = tx.next_seq_no();
                let payload = v201::transaction_event(
                    v201::TxEventKind::Ended,
                    "StopAuthorized",
                    seq_no,
                    &tx,
                    None,
                );
                ("TransactionEvent", payload, false)
            }
        };
        let (_, rx) = self
            .queue
            .enqueue_with_response(
                action,
                payload,
                MessageKind::Transactional,
                EnqueueOptions {
                    transaction_id: Some(tx.transaction_id.clone()),
                    held,
                },
            )
            .await?;
        self.spawn_transaction_cleanup(tx.transaction_id.clone(), rx);
        Ok(())
    }

    fn spawn_transaction_cleanup(
        self: &Arc<Self>,
        transaction_id: String,
        rx: oneshot::Receiver<Result<serde_json::Value, DomainError>>,
    ) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            if let Ok(Ok(_)) = rx.await {
                if let Some(cp) = weak.upgrade() {
                    // the id may have been renamed by a racing CSMS
                    // assignment; follow the alias
                    let current_id = cp
                        .resolved_aliases
                        .lock()
                        .unwrap()
                        .get(&transaction_id)
                        .cloned()
                        .unwrap_or(transaction_id);
                    // the terminated transaction is only kept until all its
                    // queued messages have been acknowledged
                    if let Err(e) = cp.db.delete_transaction(&current_id).await {
                        warn!(transaction_id = current_id.as_str(), error = %e,
                              "Failed to delete acknowledged transaction");
                    }
                }
            }
        });
    }

    fn spawn_v16_resolution(
        self: &Arc<Self>,
        local_id: String,
        rx: oneshot::Receiver<Result<serde_json::Value, DomainError>>,
    ) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let Ok(Ok(response)) = rx.await else {
                return;
            };
            let Some(cp) = weak.upgrade() else {
                return;
            };
            let Some(csms_id) = response["transactionId"].as_i64() else {
                warn!(local_id = local_id.as_str(),
                      "StartTransactionResponse without transactionId");
                return;
            };
            if let Some(status) = response["idTagInfo"]["status"].as_str() {
                if status != "Accepted" {
                    warn!(local_id = local_id.as_str(), status,
                          "Transaction started with non-accepted token");
                }
            }
            cp.resolve_v16_transaction(&local_id, csms_id).await;
        });
    }

    async fn resolve_v16_transaction(self: &Arc<Self>, local_id: &str, csms_id: i64) {
        let csms = csms_id.to_string();
        if let Err(e) = self
            .queue
            .resolve_transaction_id(local_id, &csms, |payload| {
                payload["transactionId"] = json!(csms_id);
            })
            .await
        {
            warn!(local_id, error = %e, "Transaction id substitution failed");
            return;
        }
        if let Err(e) = self.db.rename_transaction(local_id, &csms).await {
            warn!(local_id, error = %e, "Transaction rename failed");
        }
        self.unresolved_tx_ids.lock().unwrap().remove(local_id);
        self.resolved_aliases
            .lock()
            .unwrap()
            .insert(local_id.to_string(), csms.clone());
        let mut map = self.active_transactions.lock().unwrap();
        for tx in map.values_mut() {
            if tx.transaction_id == local_id {
                tx.transaction_id = csms.clone();
            }
        }
    }

    // ── Public API: status facts ───────────────────────────

    pub fn on_faulted(&self, evse_id: i32, connector_id: i32) -> Result<(), DomainError> {
        self.state.set_connector_faulted(evse_id, connector_id, true)
    }

    pub fn on_fault_cleared(&self, evse_id: i32, connector_id: i32) -> Result<(), DomainError> {
        self.state.set_connector_faulted(evse_id, connector_id, false)
    }

    /// Reservation mark maintained by the application (e.g. an out-of-band
    /// booking system); OCPP ReserveNow manages the mark itself.
    pub fn on_reserved(&self, evse_id: i32, connector_id: i32) -> Result<(), DomainError> {
        self.state.set_connector_reserved(evse_id, connector_id, true)
    }

    pub fn on_reservation_cleared(&self, evse_id: i32, connector_id: i32) -> Result<(), DomainError> {
        self.state.set_connector_reserved(evse_id, connector_id, false)
    }

    pub fn on_unavailable(&self, evse_id: i32, connector_id: i32) -> Result<(), DomainError> {
        self.state.set_connector_unavailable(evse_id, connector_id, true)
    }

    pub fn on_enabled(&self, evse_id: i32, connector_id: i32) -> Result<(), DomainError> {
        self.state.set_connector_unavailable(evse_id, connector_id, false)
    }

    pub fn connector_status(
        &self,
        evse_id: i32,
        connector_id: i32,
    ) -> Result<crate::domain::ConnectorStatus, DomainError> {
        self.state.get_connector_effective_status(evse_id, connector_id)
    }

    // ── Public API: smart charging & security ──────────────

    /// The composite limit schedule for an EVSE over the next `duration`.
    pub fn get_composite_schedule(
        &self,
        evse_id: i32,
        duration: Duration,
        unit: ChargingRateUnit,
    ) -> CompositeSchedule {
        let start = Utc::now();
        let end = start + chrono::Duration::from_std(duration).unwrap_or_default();
        let session = self.session_context(evse_id);
        self.smart_charging
            .get_composite_schedule(evse_id, start, end, unit, session.as_ref())
    }

    /// Report an application-level security event.
    pub async fn on_security_event(&self, event_type: &str, tech_info: Option<&str>) {
        self.security.security_event(event_type, tech_info).await;
    }

    // ── Internals shared with the version glue ─────────────

    fn session_context(&self, evse_id: i32) -> Option<SessionContext> {
        let map = self.active_transactions.lock().unwrap();
        map.get(&evse_id).map(|tx| SessionContext {
            transaction_id: tx.transaction_id.clone(),
            started_at: tx.start_time,
        })
    }

    fn find_transaction_by_wire_id(&self, wire_id: &str) -> Option<Transaction> {
        let map = self.active_transactions.lock().unwrap();
        map.values().find(|tx| tx.transaction_id == wire_id).cloned()
    }

    fn transaction_active_in_scope(&self, scope: AvailabilityScope) -> bool {
        let map = self.active_transactions.lock().unwrap();
        match scope.evse_id {
            None => !map.is_empty(),
            Some(evse_id) => map.contains_key(&evse_id),
        }
    }

    fn notify_charging_limit_changed(&self, evse_id: i32) {
        if let Some(hook) = self.callbacks.charging_limit_changed.clone() {
            hook(evse_id);
        }
    }

    async fn send_heartbeat(&self, kind: MessageKind) {
        if let Err(e) = self
            .queue
            .enqueue("Heartbeat", json!({}), kind, EnqueueOptions::default())
            .await
        {
            warn!(error = %e, "Heartbeat enqueue failed");
        }
    }

    async fn send_triggered_meter_values(self: &Arc<Self>, evse_id: Option<i32>) {
        let Some(sampler) = self.callbacks.sample_meter.clone() else {
            return;
        };
        let targets: Vec<(i32, i32)> = {
            let map = self.active_transactions.lock().unwrap();
            map.values()
                .filter(|tx| evse_id.map(|e| e == tx.evse_id).unwrap_or(true))
                .map(|tx| (tx.evse_id, tx.connector_id))
                .collect()
        };
        for (evse, connector) in targets {
            if let Some(mut sample) = sampler(evse, connector) {
                for sv in &mut sample.sampled_values {
                    sv.context.get_or_insert(ReadingContext::Trigger);
                }
                let _ = self.send_meter_sample(evse, &sample).await;
            }
        }
    }
}

/// 1.6 transaction ids are integers on the wire; before the CSMS assigns
/// one, the local placeholder travels in the payload and is rewritten by
/// the queue.
fn wire_tx_id(transaction_id: &str) -> serde_json::Value {
    match transaction_id.parse::<i64>() {
        Ok(numeric) => json!(numeric),
        Err(_) => json!(transaction_id),
    }
}

/// Convenience helper for building a minimal sampled energy reading.
pub fn energy_sample(meter_wh: f64) -> MeterValue {
    MeterValue {
        timestamp: Utc::now(),
        sampled_values: vec![SampledValue::energy_wh(meter_wh)],
    }
}

#[cfg(test)]
mod tests;
