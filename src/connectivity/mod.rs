//! Connectivity manager
//!
//! Owns the WebSocket and the network-profile iteration. Exactly one
//! connection attempt is in flight at any time; profile iteration is
//! deterministic given the configured priorities: each profile is tried up
//! to `NetworkProfileConnectionAttempts` times, then the next slot, and
//! after the last slot the manager backs off and restarts from the top.

pub mod websocket;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::device_model::{variables, DeviceModel};
use crate::domain::{ConnectionProfile, OcppVersion, SecurityProfileLevel};
use websocket::{ConnectionEvent, WebSocketTransport};

const MAX_BACKOFF: Duration = Duration::from_secs(3600);

/// Callbacks the station wires into the manager.
type OpenCallback = dyn Fn(i32, SecurityProfileLevel) + Send + Sync;
type CloseCallback = dyn Fn() + Send + Sync;
type FailedCallback = dyn Fn(i32) + Send + Sync;
type MessageCallback = dyn Fn(String) + Send + Sync;
type PurgedCallback = dyn Fn(Vec<i32>) + Send + Sync;

#[derive(Clone)]
struct Control {
    stop: bool,
    /// Bumped to force the current connection to be dropped and the
    /// iteration restarted (profile switch, certificate rotation).
    generation: u64,
}

pub struct ConnectivityManager {
    device_model: Arc<DeviceModel>,
    transport: Arc<dyn WebSocketTransport>,
    version: OcppVersion,

    profiles: Mutex<Vec<ConnectionProfile>>,
    /// Start iteration at this slot when set (SwitchProfile).
    preferred_slot: Mutex<Option<i32>>,
    /// Once connected at a level >= the configured minimum, never go below
    /// that minimum again within this session.
    security_floor: Mutex<Option<SecurityProfileLevel>>,

    connected: AtomicBool,
    current_outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    control: watch::Sender<Control>,

    on_open: Mutex<Option<Arc<OpenCallback>>>,
    on_close: Mutex<Option<Arc<CloseCallback>>>,
    on_failed: Mutex<Option<Arc<FailedCallback>>>,
    on_message: Mutex<Option<Arc<MessageCallback>>>,
    on_profiles_purged: Mutex<Option<Arc<PurgedCallback>>>,
}

impl ConnectivityManager {
    pub fn new(
        device_model: Arc<DeviceModel>,
        transport: Arc<dyn WebSocketTransport>,
        version: OcppVersion,
    ) -> Arc<Self> {
        let (control, _) = watch::channel(Control {
            stop: false,
            generation: 0,
        });
        Arc::new(Self {
            device_model,
            transport,
            version,
            profiles: Mutex::new(Vec::new()),
            preferred_slot: Mutex::new(None),
            security_floor: Mutex::new(None),
            connected: AtomicBool::new(false),
            current_outbound: Mutex::new(None),
            control,
            on_open: Mutex::new(None),
            on_close: Mutex::new(None),
            on_failed: Mutex::new(None),
            on_message: Mutex::new(None),
            on_profiles_purged: Mutex::new(None),
        })
    }

    // ── Callback registration ──────────────────────────────

    pub fn set_open_callback(&self, cb: impl Fn(i32, SecurityProfileLevel) + Send + Sync + 'static) {
        *self.on_open.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_close_callback(&self, cb: impl Fn() + Send + Sync + 'static) {
        *self.on_close.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_failed_callback(&self, cb: impl Fn(i32) + Send + Sync + 'static) {
        *self.on_failed.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_message_callback(&self, cb: impl Fn(String) + Send + Sync + 'static) {
        *self.on_message.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_profiles_purged_callback(&self, cb: impl Fn(Vec<i32>) + Send + Sync + 'static) {
        *self.on_profiles_purged.lock().unwrap() = Some(Arc::new(cb));
    }

    // ── Profile configuration ──────────────────────────────

    /// Install the configured connection profiles. Profiles whose security
    /// profile is below the configured minimum (or below the session floor
    /// after a successful secure connection) are purged before they can be
    /// used, and the purge is reported so the persisted list follows.
    pub fn configure_profiles(&self, mut profiles: Vec<ConnectionProfile>) {
        let minimum = self.minimum_security_level();
        let (kept, purged): (Vec<_>, Vec<_>) = {
            ConnectionProfile::sort_by_priority(&mut profiles);
            profiles
                .into_iter()
                .partition(|p| p.security_profile >= minimum)
        };
        if !purged.is_empty() {
            let slots: Vec<i32> = purged.iter().map(|p| p.slot).collect();
            warn!(?slots, minimum = minimum.as_i32(), "Purging connection profiles below minimum security profile");
            if let Some(cb) = self.on_profiles_purged.lock().unwrap().clone() {
                cb(slots);
            }
        }
        *self.profiles.lock().unwrap() = kept;
    }

    fn minimum_security_level(&self) -> SecurityProfileLevel {
        let configured = self
            .device_model
            .get_int(&variables::SECURITY_PROFILE)
            .and_then(|v| SecurityProfileLevel::from_i32(v as i32))
            .unwrap_or(SecurityProfileLevel::BasicUnsecured);
        let floor = self.security_floor.lock().unwrap();
        match *floor {
            Some(f) if f > configured => f,
            _ => configured,
        }
    }

    fn candidates(&self) -> Vec<ConnectionProfile> {
        let minimum = self.minimum_security_level();
        let profiles = self.profiles.lock().unwrap();
        let mut list: Vec<ConnectionProfile> = profiles
            .iter()
            .filter(|p| p.security_profile >= minimum)
            .cloned()
            .collect();
        if let Some(slot) = *self.preferred_slot.lock().unwrap() {
            if let Some(pos) = list.iter().position(|p| p.slot == slot) {
                list.rotate_left(pos);
            }
        }
        list
    }

    // ── Public control surface ─────────────────────────────

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Send a serialized frame over the active connection.
    pub fn send(&self, text: String) -> bool {
        let guard = self.current_outbound.lock().unwrap();
        match guard.as_ref() {
            Some(sender) => sender.send(text).is_ok(),
            None => false,
        }
    }

    /// Restart iteration from a specific slot, dropping any live connection.
    pub fn switch_profile(&self, slot: i32) {
        *self.preferred_slot.lock().unwrap() = Some(slot);
        self.reconnect();
    }

    /// Drop the current connection and re-run profile iteration; used when
    /// the CSMS URL, security profile or client certificate changes.
    pub fn reconnect(&self) {
        self.control.send_modify(|c| c.generation += 1);
    }

    pub fn disconnect(&self, reason: &str) {
        info!(reason, "Disconnecting from CSMS");
        self.control.send_modify(|c| c.stop = true);
        *self.current_outbound.lock().unwrap() = None;
    }

    /// Start the connection loop. Returns immediately; connection state is
    /// reported through the registered callbacks.
    pub fn connect(self: &Arc<Self>) {
        self.control.send_modify(|c| c.stop = false);
        let manager = self.clone();
        tokio::spawn(async move {
            manager.run_loop().await;
        });
    }

    // ── Connection loop ────────────────────────────────────

    async fn run_loop(self: Arc<Self>) {
        let mut control_rx = self.control.subscribe();
        let mut round: u32 = 0;

        'outer: loop {
            if control_rx.borrow().stop {
                break;
            }
            let candidates = self.candidates();
            if candidates.is_empty() {
                warn!("No usable connection profiles configured");
                tokio::time::sleep(self.backoff_delay(round)).await;
                round = round.saturating_add(1);
                continue;
            }

            let attempts_per_profile = self
                .device_model
                .get_int(&variables::NETWORK_PROFILE_CONNECTION_ATTEMPTS)
                .unwrap_or(1)
                .max(1) as u32;
            let connect_timeout = Duration::from_secs(
                self.device_model
                    .get_int(&variables::MESSAGE_TIMEOUT)
                    .unwrap_or(30)
                    .max(1) as u64,
            );

            for profile in &candidates {
                for _attempt in 0..attempts_per_profile {
                    if control_rx.borrow().stop {
                        break 'outer;
                    }
                    let generation = control_rx.borrow().generation;

                    let result = tokio::time::timeout(
                        connect_timeout,
                        self.transport.connect(profile, self.version),
                    )
                    .await;

                    match result {
                        Ok(Ok(connection)) => {
                            round = 0;
                            self.on_connection_open(profile);
                            self.pump_connection(connection, &mut control_rx, generation)
                                .await;
                            self.on_connection_closed();
                            if control_rx.borrow().stop {
                                break 'outer;
                            }
                            // after any close, restart iteration from the top
                            continue 'outer;
                        }
                        Ok(Err(e)) => {
                            warn!(slot = profile.slot, error = %e, "Connection attempt failed");
                        }
                        Err(_) => {
                            warn!(slot = profile.slot, "Connection attempt timed out");
                        }
                    }
                    if let Some(cb) = self.on_failed.lock().unwrap().clone() {
                        cb(profile.slot);
                    }
                }
            }

            let delay = self.backoff_delay(round);
            info!(round, delay_s = delay.as_secs(), "All profiles exhausted, backing off");
            round = round.saturating_add(1);
            tokio::time::sleep(delay).await;
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    fn on_connection_open(&self, profile: &ConnectionProfile) {
        info!(slot = profile.slot, security = profile.security_profile.as_i32(), "Connected to CSMS");
        self.connected.store(true, Ordering::SeqCst);
        let configured = self
            .device_model
            .get_int(&variables::SECURITY_PROFILE)
            .and_then(|v| SecurityProfileLevel::from_i32(v as i32))
            .unwrap_or(SecurityProfileLevel::BasicUnsecured);
        if profile.security_profile >= configured {
            *self.security_floor.lock().unwrap() = Some(configured);
        }
        if let Some(cb) = self.on_open.lock().unwrap().clone() {
            cb(profile.slot, profile.security_profile);
        }
    }

    fn on_connection_closed(&self) {
        self.connected.store(false, Ordering::SeqCst);
        *self.current_outbound.lock().unwrap() = None;
        if let Some(cb) = self.on_close.lock().unwrap().clone() {
            cb();
        }
    }

    async fn pump_connection(
        &self,
        mut connection: websocket::WebSocketConnection,
        control_rx: &mut watch::Receiver<Control>,
        generation: u64,
    ) {
        *self.current_outbound.lock().unwrap() = Some(connection.outbound.clone());
        loop {
            tokio::select! {
                event = connection.events.recv() => match event {
                    Some(ConnectionEvent::Message(text)) => {
                        if let Some(cb) = self.on_message.lock().unwrap().clone() {
                            cb(text);
                        }
                    }
                    Some(ConnectionEvent::Closed(reason)) => {
                        warn!(reason = reason.as_str(), "Connection closed by peer");
                        return;
                    }
                    None => return,
                },
                changed = control_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let c = control_rx.borrow().clone();
                    if c.stop || c.generation != generation {
                        return;
                    }
                }
            }
        }
    }

    fn backoff_delay(&self, round: u32) -> Duration {
        let minimum = self
            .device_model
            .get_int(&variables::RETRY_BACK_OFF_WAIT_MINIMUM)
            .unwrap_or(3)
            .max(0) as u64;
        let random_range = self
            .device_model
            .get_int(&variables::RETRY_BACK_OFF_RANDOM_RANGE)
            .unwrap_or(0)
            .max(0) as u64;
        let jitter = if random_range > 0 {
            rand::thread_rng().gen_range(0..=random_range)
        } else {
            0
        };
        let base = minimum.saturating_mul(1u64 << round.min(20));
        Duration::from_secs(base + jitter).min(MAX_BACKOFF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::InfraError;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// Transport that fails every attempt and records the slot order.
    struct FailingTransport {
        attempts: StdMutex<Vec<i32>>,
    }

    #[async_trait]
    impl WebSocketTransport for FailingTransport {
        async fn connect(
            &self,
            profile: &ConnectionProfile,
            _version: OcppVersion,
        ) -> Result<websocket::WebSocketConnection, InfraError> {
            self.attempts.lock().unwrap().push(profile.slot);
            Err(InfraError::WebSocket("refused".to_string()))
        }
    }

    fn profile(slot: i32, priority: i32, level: SecurityProfileLevel) -> ConnectionProfile {
        ConnectionProfile {
            slot,
            priority,
            csms_url: format!("ws://csms.example/{}", slot),
            security_profile: level,
            interface: None,
            basic_auth: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failover_order_is_deterministic() {
        let model = Arc::new(DeviceModel::with_defaults());
        // one attempt per profile keeps the expected sequence simple
        model.set_value("OCPPCommCtrlr", "NetworkProfileConnectionAttempts", "1");
        let transport = Arc::new(FailingTransport {
            attempts: StdMutex::new(Vec::new()),
        });
        let manager = ConnectivityManager::new(model, transport.clone(), OcppVersion::V201);
        manager.configure_profiles(vec![
            profile(2, 20, SecurityProfileLevel::BasicTls),
            profile(1, 10, SecurityProfileLevel::BasicTls),
            profile(3, 30, SecurityProfileLevel::BasicTls),
        ]);

        manager.connect();
        // paused clock auto-advances through the backoff sleeps
        tokio::time::sleep(Duration::from_secs(120)).await;
        manager.disconnect("test over");

        let attempts = transport.attempts.lock().unwrap().clone();
        assert!(attempts.len() >= 6, "expected at least two rounds, got {:?}", attempts);
        for chunk in attempts.chunks(3) {
            if chunk.len() == 3 {
                assert_eq!(chunk, [1, 2, 3]);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn profiles_below_minimum_security_are_purged() {
        let model = Arc::new(DeviceModel::with_defaults());
        model.set_value("SecurityCtrlr", "SecurityProfile", "2");
        let transport = Arc::new(FailingTransport {
            attempts: StdMutex::new(Vec::new()),
        });
        let manager = ConnectivityManager::new(model, transport.clone(), OcppVersion::V201);

        let purged: Arc<StdMutex<Vec<i32>>> = Arc::new(StdMutex::new(Vec::new()));
        let purged_clone = purged.clone();
        manager.set_profiles_purged_callback(move |slots| {
            purged_clone.lock().unwrap().extend(slots);
        });

        manager.configure_profiles(vec![
            profile(1, 10, SecurityProfileLevel::BasicUnsecured),
            profile(2, 20, SecurityProfileLevel::BasicTls),
        ]);
        assert_eq!(*purged.lock().unwrap(), vec![1]);

        manager.connect();
        tokio::time::sleep(Duration::from_secs(30)).await;
        manager.disconnect("test over");

        let attempts = transport.attempts.lock().unwrap().clone();
        assert!(!attempts.is_empty());
        assert!(attempts.iter().all(|&slot| slot == 2), "{:?}", attempts);
    }

    #[tokio::test(start_paused = true)]
    async fn send_without_connection_reports_failure() {
        let model = Arc::new(DeviceModel::with_defaults());
        let transport = Arc::new(FailingTransport {
            attempts: StdMutex::new(Vec::new()),
        });
        let manager = ConnectivityManager::new(model, transport, OcppVersion::V16);
        assert!(!manager.is_connected());
        assert!(!manager.send("[2,\"x\",\"Heartbeat\",{}]".to_string()));
    }
}
