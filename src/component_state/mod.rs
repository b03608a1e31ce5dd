//! Component state manager
//!
//! Holds the Operative/Inoperative triples for the charging station, every
//! EVSE and every connector, plus the transient connector facts, and keeps
//! two bookkeeping mirrors:
//!
//! 1. the last *effective* status reported through the availability-changed
//!    callbacks, used to suppress no-op callback storms, and
//! 2. the last wire status *successfully sent* as a StatusNotification,
//!    used to recompute which connectors need re-advertising after a
//!    reconnect. A failed send leaves this mirror stale on purpose.
//!
//! All mutations are serialized under one coarse lock; callbacks fire from
//! the mutating thread outside the lock, parents before children.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::domain::{ConnectorStatus, DomainError, FullConnectorStatus, OperationalStatus};
use crate::infrastructure::database::DatabaseHandler;

type CsChangedCallback = dyn Fn(OperationalStatus) + Send + Sync;
type EvseChangedCallback = dyn Fn(i32, OperationalStatus) + Send + Sync;
type ConnectorChangedCallback = dyn Fn(i32, i32, OperationalStatus) + Send + Sync;
/// `(evse_id, connector_id, status, initiated_by_trigger_message)` -> sent ok
type StatusNotificationCallback = dyn Fn(i32, i32, ConnectorStatus, bool) -> bool + Send + Sync;

struct EvseState {
    individual: OperationalStatus,
    connectors: Vec<FullConnectorStatus>,
}

struct StateInner {
    cs_individual: OperationalStatus,
    evses: Vec<EvseState>,
    // mirror 1: last effective status reported via callbacks
    last_cs_effective: OperationalStatus,
    last_evse_effective: Vec<OperationalStatus>,
    last_connector_effective: Vec<Vec<OperationalStatus>>,
    // mirror 2: last wire status successfully sent upstream
    last_reported_wire: Vec<Vec<ConnectorStatus>>,
}

impl StateInner {
    fn evse(&self, evse_id: i32) -> Result<&EvseState, DomainError> {
        self.evses
            .get((evse_id - 1).max(0) as usize)
            .filter(|_| evse_id >= 1)
            .ok_or(DomainError::NotFound {
                entity: "evse",
                field: "evse_id",
                value: evse_id.to_string(),
            })
    }

    fn connector(&self, evse_id: i32, connector_id: i32) -> Result<&FullConnectorStatus, DomainError> {
        self.evse(evse_id)?
            .connectors
            .get((connector_id - 1).max(0) as usize)
            .filter(|_| connector_id >= 1)
            .ok_or(DomainError::NotFound {
                entity: "connector",
                field: "connector_id",
                value: format!("{}/{}", evse_id, connector_id),
            })
    }

    fn connector_mut(
        &mut self,
        evse_id: i32,
        connector_id: i32,
    ) -> Result<&mut FullConnectorStatus, DomainError> {
        self.connector(evse_id, connector_id)?;
        Ok(&mut self.evses[(evse_id - 1) as usize].connectors[(connector_id - 1) as usize])
    }

    fn evse_effective(&self, evse_id: i32) -> Result<OperationalStatus, DomainError> {
        Ok(self.cs_individual.merge(self.evse(evse_id)?.individual))
    }

    fn connector_effective_operational(
        &self,
        evse_id: i32,
        connector_id: i32,
    ) -> Result<OperationalStatus, DomainError> {
        let conn = self.connector(evse_id, connector_id)?;
        Ok(self
            .evse_effective(evse_id)?
            .merge(conn.individual_operational_status))
    }

    /// Wire-level status: the connector's own projection, forced to
    /// Unavailable when the EVSE or CS is Inoperative.
    fn connector_wire_status(
        &self,
        evse_id: i32,
        connector_id: i32,
    ) -> Result<ConnectorStatus, DomainError> {
        let conn = self.connector(evse_id, connector_id)?;
        Ok(conn.effective_status(self.evse_effective(evse_id)?))
    }
}

/// One pending availability-changed callback, ordered parent to child.
enum AvailabilityChange {
    Cs(OperationalStatus),
    Evse(i32, OperationalStatus),
    Connector(i32, i32, OperationalStatus),
}

pub struct ComponentStateManager {
    db: Arc<DatabaseHandler>,
    inner: Mutex<StateInner>,
    cs_changed: Mutex<Option<Arc<CsChangedCallback>>>,
    evse_changed: Mutex<Option<Arc<EvseChangedCallback>>>,
    connector_changed: Mutex<Option<Arc<ConnectorChangedCallback>>>,
    send_status_notification: Mutex<Option<Arc<StatusNotificationCallback>>>,
}

impl ComponentStateManager {
    /// Build the state manager for the given physical structure (EVSE id to
    /// connector count). Persisted individual statuses are loaded from the
    /// database, defaulting to Operative; the reported-status mirrors are
    /// initialized from the current derived values and **no callbacks are
    /// fired** at this stage.
    pub async fn new(
        structure: &BTreeMap<i32, i32>,
        db: Arc<DatabaseHandler>,
    ) -> Result<Arc<Self>, DomainError> {
        let load = |evse_id: i32, connector_id: i32| {
            let db = db.clone();
            async move {
                db.get_operational_status(evse_id, connector_id)
                    .await
                    .ok()
                    .flatten()
                    .unwrap_or(OperationalStatus::Operative)
            }
        };

        let cs_individual = load(0, 0).await;
        let mut evses = Vec::new();
        for (&evse_id, &connector_count) in structure {
            let individual = load(evse_id, 0).await;
            let mut connectors = Vec::new();
            for connector_id in 1..=connector_count {
                let status = load(evse_id, connector_id).await;
                connectors.push(FullConnectorStatus::new(status));
            }
            evses.push(EvseState {
                individual,
                connectors,
            });
        }

        let mut inner = StateInner {
            cs_individual,
            evses,
            last_cs_effective: cs_individual,
            last_evse_effective: Vec::new(),
            last_connector_effective: Vec::new(),
            last_reported_wire: Vec::new(),
        };
        for evse_index in 0..inner.evses.len() {
            let evse_id = evse_index as i32 + 1;
            inner
                .last_evse_effective
                .push(inner.evse_effective(evse_id)?);
            let connector_count = inner.evses[evse_index].connectors.len() as i32;
            let mut effective = Vec::new();
            let mut wire = Vec::new();
            for connector_id in 1..=connector_count {
                effective.push(inner.connector_effective_operational(evse_id, connector_id)?);
                wire.push(inner.connector_wire_status(evse_id, connector_id)?);
            }
            inner.last_connector_effective.push(effective);
            inner.last_reported_wire.push(wire);
        }

        Ok(Arc::new(Self {
            db,
            inner: Mutex::new(inner),
            cs_changed: Mutex::new(None),
            evse_changed: Mutex::new(None),
            connector_changed: Mutex::new(None),
            send_status_notification: Mutex::new(None),
        }))
    }

    // ── Callback registration ──────────────────────────────

    pub fn set_cs_effective_availability_changed_callback(
        &self,
        cb: impl Fn(OperationalStatus) + Send + Sync + 'static,
    ) {
        *self.cs_changed.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_evse_effective_availability_changed_callback(
        &self,
        cb: impl Fn(i32, OperationalStatus) + Send + Sync + 'static,
    ) {
        *self.evse_changed.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_connector_effective_availability_changed_callback(
        &self,
        cb: impl Fn(i32, i32, OperationalStatus) + Send + Sync + 'static,
    ) {
        *self.connector_changed.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_send_status_notification_callback(
        &self,
        cb: impl Fn(i32, i32, ConnectorStatus, bool) -> bool + Send + Sync + 'static,
    ) {
        *self.send_status_notification.lock().unwrap() = Some(Arc::new(cb));
    }

    // ── Getters ────────────────────────────────────────────

    pub fn get_cs_individual_operational_status(&self) -> OperationalStatus {
        self.inner.lock().unwrap().cs_individual
    }

    pub fn get_evse_individual_operational_status(
        &self,
        evse_id: i32,
    ) -> Result<OperationalStatus, DomainError> {
        Ok(self.inner.lock().unwrap().evse(evse_id)?.individual)
    }

    pub fn get_connector_individual_operational_status(
        &self,
        evse_id: i32,
        connector_id: i32,
    ) -> Result<OperationalStatus, DomainError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .connector(evse_id, connector_id)?
            .individual_operational_status)
    }

    pub async fn get_cs_persisted_operational_status(&self) -> OperationalStatus {
        self.db
            .get_operational_status(0, 0)
            .await
            .ok()
            .flatten()
            .unwrap_or(OperationalStatus::Operative)
    }

    pub async fn get_evse_persisted_operational_status(&self, evse_id: i32) -> OperationalStatus {
        self.db
            .get_operational_status(evse_id, 0)
            .await
            .ok()
            .flatten()
            .unwrap_or(OperationalStatus::Operative)
    }

    pub async fn get_connector_persisted_operational_status(
        &self,
        evse_id: i32,
        connector_id: i32,
    ) -> OperationalStatus {
        self.db
            .get_operational_status(evse_id, connector_id)
            .await
            .ok()
            .flatten()
            .unwrap_or(OperationalStatus::Operative)
    }

    pub fn get_evse_effective_operational_status(
        &self,
        evse_id: i32,
    ) -> Result<OperationalStatus, DomainError> {
        self.inner.lock().unwrap().evse_effective(evse_id)
    }

    pub fn get_connector_effective_operational_status(
        &self,
        evse_id: i32,
        connector_id: i32,
    ) -> Result<OperationalStatus, DomainError> {
        self.inner
            .lock()
            .unwrap()
            .connector_effective_operational(evse_id, connector_id)
    }

    /// The wire status the CSMS should currently see for a connector.
    pub fn get_connector_effective_status(
        &self,
        evse_id: i32,
        connector_id: i32,
    ) -> Result<ConnectorStatus, DomainError> {
        self.inner
            .lock()
            .unwrap()
            .connector_wire_status(evse_id, connector_id)
    }

    pub fn evse_count(&self) -> usize {
        self.inner.lock().unwrap().evses.len()
    }

    pub fn connector_count(&self, evse_id: i32) -> Result<usize, DomainError> {
        Ok(self.inner.lock().unwrap().evse(evse_id)?.connectors.len())
    }

    // ── Individual status setters ──────────────────────────

    pub async fn set_cs_individual_operational_status(
        &self,
        new_status: OperationalStatus,
        persist: bool,
    ) -> Result<(), DomainError> {
        if persist {
            self.db
                .set_operational_status(0, 0, new_status)
                .await
                .map_err(|e| DomainError::Validation(format!("availability persistence: {}", e)))?;
        }
        self.mutate(|inner| {
            inner.cs_individual = new_status;
            Ok(())
        })?;
        Ok(())
    }

    pub async fn set_evse_individual_operational_status(
        &self,
        evse_id: i32,
        new_status: OperationalStatus,
        persist: bool,
    ) -> Result<(), DomainError> {
        if persist {
            self.db
                .set_operational_status(evse_id, 0, new_status)
                .await
                .map_err(|e| DomainError::Validation(format!("availability persistence: {}", e)))?;
        }
        self.mutate(|inner| {
            inner.evse(evse_id)?;
            inner.evses[(evse_id - 1) as usize].individual = new_status;
            Ok(())
        })?;
        Ok(())
    }

    pub async fn set_connector_individual_operational_status(
        &self,
        evse_id: i32,
        connector_id: i32,
        new_status: OperationalStatus,
        persist: bool,
    ) -> Result<(), DomainError> {
        if persist {
            self.db
                .set_operational_status(evse_id, connector_id, new_status)
                .await
                .map_err(|e| DomainError::Validation(format!("availability persistence: {}", e)))?;
        }
        self.mutate(|inner| {
            inner
                .connector_mut(evse_id, connector_id)?
                .individual_operational_status = new_status;
            Ok(())
        })?;
        Ok(())
    }

    // ── Transient connector fact setters ───────────────────

    pub fn set_connector_occupied(
        &self,
        evse_id: i32,
        connector_id: i32,
        occupied: bool,
    ) -> Result<(), DomainError> {
        self.mutate(|inner| {
            inner.connector_mut(evse_id, connector_id)?.occupied = occupied;
            Ok(())
        })
    }

    pub fn set_connector_reserved(
        &self,
        evse_id: i32,
        connector_id: i32,
        reserved: bool,
    ) -> Result<(), DomainError> {
        self.mutate(|inner| {
            inner.connector_mut(evse_id, connector_id)?.reserved = reserved;
            Ok(())
        })
    }

    pub fn set_connector_faulted(
        &self,
        evse_id: i32,
        connector_id: i32,
        faulted: bool,
    ) -> Result<(), DomainError> {
        self.mutate(|inner| {
            inner.connector_mut(evse_id, connector_id)?.faulted = faulted;
            Ok(())
        })
    }

    pub fn set_connector_unavailable(
        &self,
        evse_id: i32,
        connector_id: i32,
        unavailable: bool,
    ) -> Result<(), DomainError> {
        self.mutate(|inner| {
            inner.connector_mut(evse_id, connector_id)?.unavailable = unavailable;
            Ok(())
        })
    }

    // ── Bulk announcements ─────────────────────────────────

    /// Fire the availability-changed callbacks once for every component,
    /// unconditionally. Done once on boot to announce the expected state.
    pub fn trigger_all_effective_availability_changed_callbacks(&self) {
        let changes = {
            let mut inner = self.inner.lock().unwrap();
            self.collect_changes(&mut inner, false)
        };
        self.fire(changes);
    }

    /// Advertise every connector's wire status. Done on first connect and
    /// after long offline periods.
    pub fn send_status_notification_all_connectors(&self) {
        self.send_notifications(false, false);
    }

    /// Advertise only the connectors whose wire status changed since the
    /// last *successful* send. Done after short offline periods.
    pub fn send_status_notification_changed_connectors(&self) {
        self.send_notifications(true, false);
    }

    /// Advertise a single connector (TriggerMessage).
    pub fn send_status_notification_single_connector(
        &self,
        evse_id: i32,
        connector_id: i32,
    ) -> Result<(), DomainError> {
        let status = self.get_connector_effective_status(evse_id, connector_id)?;
        self.dispatch_notification(evse_id, connector_id, status, true);
        Ok(())
    }

    // ── Internals ──────────────────────────────────────────

    /// Apply a mutation, then fire the availability callbacks for every
    /// component whose effective status changed (parents before children)
    /// and re-advertise connectors whose wire status moved.
    fn mutate(
        &self,
        f: impl FnOnce(&mut StateInner) -> Result<(), DomainError>,
    ) -> Result<(), DomainError> {
        let (changes, notifications) = {
            let mut inner = self.inner.lock().unwrap();
            f(&mut inner)?;
            let changes = self.collect_changes(&mut inner, true);
            let notifications = self.collect_wire_changes(&inner);
            (changes, notifications)
        };
        self.fire(changes);
        for (evse_id, connector_id, status) in notifications {
            self.dispatch_notification(evse_id, connector_id, status, false);
        }
        Ok(())
    }

    /// Diff effective statuses against mirror 1, update the mirror, and
    /// return the ordered callback list.
    fn collect_changes(
        &self,
        inner: &mut StateInner,
        only_if_changed: bool,
    ) -> Vec<AvailabilityChange> {
        let mut changes = Vec::new();

        let cs_effective = inner.cs_individual;
        if !only_if_changed || cs_effective != inner.last_cs_effective {
            inner.last_cs_effective = cs_effective;
            changes.push(AvailabilityChange::Cs(cs_effective));
        }

        for evse_index in 0..inner.evses.len() {
            let evse_id = evse_index as i32 + 1;
            let effective = inner
                .evse_effective(evse_id)
                .expect("structure indices are internally consistent");
            if !only_if_changed || effective != inner.last_evse_effective[evse_index] {
                inner.last_evse_effective[evse_index] = effective;
                changes.push(AvailabilityChange::Evse(evse_id, effective));
            }
            for connector_index in 0..inner.evses[evse_index].connectors.len() {
                let connector_id = connector_index as i32 + 1;
                let effective = inner
                    .connector_effective_operational(evse_id, connector_id)
                    .expect("structure indices are internally consistent");
                if !only_if_changed
                    || effective != inner.last_connector_effective[evse_index][connector_index]
                {
                    inner.last_connector_effective[evse_index][connector_index] = effective;
                    changes.push(AvailabilityChange::Connector(evse_id, connector_id, effective));
                }
            }
        }
        changes
    }

    /// Connectors whose wire status differs from mirror 2.
    fn collect_wire_changes(&self, inner: &StateInner) -> Vec<(i32, i32, ConnectorStatus)> {
        let mut out = Vec::new();
        for evse_index in 0..inner.evses.len() {
            let evse_id = evse_index as i32 + 1;
            for connector_index in 0..inner.evses[evse_index].connectors.len() {
                let connector_id = connector_index as i32 + 1;
                let wire = inner
                    .connector_wire_status(evse_id, connector_id)
                    .expect("structure indices are internally consistent");
                if wire != inner.last_reported_wire[evse_index][connector_index] {
                    out.push((evse_id, connector_id, wire));
                }
            }
        }
        out
    }

    fn fire(&self, changes: Vec<AvailabilityChange>) {
        let cs_cb = self.cs_changed.lock().unwrap().clone();
        let evse_cb = self.evse_changed.lock().unwrap().clone();
        let connector_cb = self.connector_changed.lock().unwrap().clone();
        for change in changes {
            match change {
                AvailabilityChange::Cs(status) => {
                    debug!(%status, "CS effective availability changed");
                    if let Some(cb) = &cs_cb {
                        cb(status);
                    }
                }
                AvailabilityChange::Evse(evse_id, status) => {
                    debug!(evse_id, %status, "EVSE effective availability changed");
                    if let Some(cb) = &evse_cb {
                        cb(evse_id, status);
                    }
                }
                AvailabilityChange::Connector(evse_id, connector_id, status) => {
                    debug!(evse_id, connector_id, %status, "Connector effective availability changed");
                    if let Some(cb) = &connector_cb {
                        cb(evse_id, connector_id, status);
                    }
                }
            }
        }
    }

    fn send_notifications(&self, only_if_changed: bool, initiated_by_trigger: bool) {
        let targets = {
            let inner = self.inner.lock().unwrap();
            let mut out = Vec::new();
            for evse_index in 0..inner.evses.len() {
                let evse_id = evse_index as i32 + 1;
                for connector_index in 0..inner.evses[evse_index].connectors.len() {
                    let connector_id = connector_index as i32 + 1;
                    let wire = inner
                        .connector_wire_status(evse_id, connector_id)
                        .expect("structure indices are internally consistent");
                    if !only_if_changed
                        || wire != inner.last_reported_wire[evse_index][connector_index]
                    {
                        out.push((evse_id, connector_id, wire));
                    }
                }
            }
            out
        };
        for (evse_id, connector_id, status) in targets {
            self.dispatch_notification(evse_id, connector_id, status, initiated_by_trigger);
        }
    }

    /// Send one StatusNotification; the reported-status mirror is only
    /// updated when the send succeeds, so a failed send re-advertises on
    /// the next reconnect.
    fn dispatch_notification(
        &self,
        evse_id: i32,
        connector_id: i32,
        status: ConnectorStatus,
        initiated_by_trigger: bool,
    ) {
        let cb = self.send_status_notification.lock().unwrap().clone();
        let Some(cb) = cb else {
            return;
        };
        if cb(evse_id, connector_id, status, initiated_by_trigger) {
            let mut inner = self.inner.lock().unwrap();
            inner.last_reported_wire[(evse_id - 1) as usize][(connector_id - 1) as usize] = status;
        } else {
            warn!(evse_id, connector_id, %status,
                  "StatusNotification send failed, will re-advertise on reconnect");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database::{init_database, DatabaseConfig};
    use std::sync::Mutex as StdMutex;

    async fn manager() -> Arc<ComponentStateManager> {
        let db = Arc::new(DatabaseHandler::new(
            init_database(&DatabaseConfig::in_memory()).await.unwrap(),
        ));
        let mut structure = BTreeMap::new();
        structure.insert(1, 2);
        structure.insert(2, 1);
        ComponentStateManager::new(&structure, db).await.unwrap()
    }

    #[tokio::test]
    async fn wire_status_projection_scenario() {
        let m = manager().await;
        m.set_connector_reserved(1, 1, true).unwrap();
        m.set_connector_occupied(1, 1, true).unwrap();
        assert_eq!(
            m.get_connector_effective_status(1, 1).unwrap(),
            ConnectorStatus::Reserved
        );

        m.set_connector_faulted(1, 1, true).unwrap();
        assert_eq!(
            m.get_connector_effective_status(1, 1).unwrap(),
            ConnectorStatus::Faulted
        );

        m.set_evse_individual_operational_status(1, OperationalStatus::Inoperative, false)
            .await
            .unwrap();
        assert_eq!(
            m.get_connector_effective_status(1, 1).unwrap(),
            ConnectorStatus::Unavailable
        );
        // sibling EVSE untouched
        assert_eq!(
            m.get_connector_effective_status(2, 1).unwrap(),
            ConnectorStatus::Available
        );
    }

    #[tokio::test]
    async fn projection_matches_rules_for_every_combination() {
        let m = manager().await;
        let statuses = [OperationalStatus::Operative, OperationalStatus::Inoperative];
        let bools = [false, true];
        for cs in statuses {
            for evse in statuses {
                for conn in statuses {
                    for faulted in bools {
                        for reserved in bools {
                            for occupied in bools {
                                for unavailable in bools {
                                    m.set_cs_individual_operational_status(cs, false).await.unwrap();
                                    m.set_evse_individual_operational_status(1, evse, false)
                                        .await
                                        .unwrap();
                                    m.set_connector_individual_operational_status(1, 1, conn, false)
                                        .await
                                        .unwrap();
                                    m.set_connector_faulted(1, 1, faulted).unwrap();
                                    m.set_connector_reserved(1, 1, reserved).unwrap();
                                    m.set_connector_occupied(1, 1, occupied).unwrap();
                                    m.set_connector_unavailable(1, 1, unavailable).unwrap();

                                    let full = FullConnectorStatus {
                                        individual_operational_status: conn,
                                        faulted,
                                        reserved,
                                        occupied,
                                        unavailable,
                                    };
                                    let expected = full.effective_status(cs.merge(evse));
                                    assert_eq!(
                                        m.get_connector_effective_status(1, 1).unwrap(),
                                        expected,
                                        "cs={:?} evse={:?} conn={:?} f={} r={} o={} u={}",
                                        cs, evse, conn, faulted, reserved, occupied, unavailable
                                    );
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn callbacks_fire_parents_before_children_and_only_on_change() {
        let m = manager().await;
        let order: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));

        let o = order.clone();
        m.set_cs_effective_availability_changed_callback(move |s| {
            o.lock().unwrap().push(format!("cs:{}", s));
        });
        let o = order.clone();
        m.set_evse_effective_availability_changed_callback(move |id, s| {
            o.lock().unwrap().push(format!("evse{}:{}", id, s));
        });
        let o = order.clone();
        m.set_connector_effective_availability_changed_callback(move |e, c, s| {
            o.lock().unwrap().push(format!("conn{}/{}:{}", e, c, s));
        });

        m.set_cs_individual_operational_status(OperationalStatus::Inoperative, false)
            .await
            .unwrap();
        assert_eq!(
            *order.lock().unwrap(),
            vec![
                "cs:Inoperative",
                "evse1:Inoperative",
                "conn1/1:Inoperative",
                "conn1/2:Inoperative",
                "evse2:Inoperative",
                "conn2/1:Inoperative",
            ]
        );

        // a no-op set fires nothing
        order.lock().unwrap().clear();
        m.set_cs_individual_operational_status(OperationalStatus::Inoperative, false)
            .await
            .unwrap();
        assert!(order.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_send_leaves_mirror_stale_for_readvertising() {
        let m = manager().await;
        let send_ok = Arc::new(StdMutex::new(false));
        let sent: Arc<StdMutex<Vec<(i32, i32, ConnectorStatus)>>> =
            Arc::new(StdMutex::new(Vec::new()));

        let ok = send_ok.clone();
        let s = sent.clone();
        m.set_send_status_notification_callback(move |e, c, status, _trigger| {
            s.lock().unwrap().push((e, c, status));
            *ok.lock().unwrap()
        });

        // send fails: mirror stays Available
        m.set_connector_occupied(1, 1, true).unwrap();
        assert_eq!(sent.lock().unwrap().len(), 1);

        // the changed-connectors pass re-sends it once sending works again
        *send_ok.lock().unwrap() = true;
        m.send_status_notification_changed_connectors();
        let all = sent.lock().unwrap().clone();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1], (1, 1, ConnectorStatus::Occupied));

        // now the mirror is current, nothing further to re-send
        m.send_status_notification_changed_connectors();
        assert_eq!(sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn persisted_status_restored_on_construction() {
        let db = Arc::new(DatabaseHandler::new(
            init_database(&DatabaseConfig::in_memory()).await.unwrap(),
        ));
        db.set_operational_status(1, 0, OperationalStatus::Inoperative)
            .await
            .unwrap();
        let mut structure = BTreeMap::new();
        structure.insert(1, 1);
        let m = ComponentStateManager::new(&structure, db).await.unwrap();
        assert_eq!(
            m.get_evse_individual_operational_status(1).unwrap(),
            OperationalStatus::Inoperative
        );
        assert_eq!(
            m.get_connector_effective_status(1, 1).unwrap(),
            ConnectorStatus::Unavailable
        );
    }

    #[tokio::test]
    async fn out_of_range_ids_are_rejected() {
        let m = manager().await;
        assert!(m.get_evse_individual_operational_status(9).is_err());
        assert!(m.get_connector_effective_status(1, 9).is_err());
        assert!(m.set_connector_occupied(0, 1, true).is_err());
    }
}
