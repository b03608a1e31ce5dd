//! Availability
//!
//! Routes ChangeAvailability to the state manager. A change affecting a
//! scope with an active transaction is scheduled instead of applied and
//! retried after every transaction state change. When every connector has
//! become Inoperative and no transaction is running, the
//! all-connectors-unavailable callback fires once.

use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::component_state::ComponentStateManager;
use crate::domain::OperationalStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAvailabilityStatus {
    Accepted,
    Scheduled,
    Rejected,
}

/// Scope of a change: the whole station, one EVSE, or one connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailabilityScope {
    pub evse_id: Option<i32>,
    pub connector_id: Option<i32>,
}

impl AvailabilityScope {
    pub fn station() -> Self {
        Self {
            evse_id: None,
            connector_id: None,
        }
    }

    pub fn evse(evse_id: i32) -> Self {
        Self {
            evse_id: Some(evse_id),
            connector_id: None,
        }
    }

    pub fn connector(evse_id: i32, connector_id: i32) -> Self {
        Self {
            evse_id: Some(evse_id),
            connector_id: Some(connector_id),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ScheduledChange {
    scope: AvailabilityScope,
    status: OperationalStatus,
}

/// Probe: is a transaction active anywhere in the scope?
type TransactionProbe = dyn Fn(AvailabilityScope) -> bool + Send + Sync;
type AllUnavailableCallback = dyn Fn() + Send + Sync;

pub struct Availability {
    state: Arc<ComponentStateManager>,
    scheduled: Mutex<Vec<ScheduledChange>>,
    transaction_probe: Mutex<Option<Arc<TransactionProbe>>>,
    all_unavailable: Mutex<Option<Arc<AllUnavailableCallback>>>,
    all_unavailable_fired: Mutex<bool>,
}

impl Availability {
    pub fn new(state: Arc<ComponentStateManager>) -> Self {
        Self {
            state,
            scheduled: Mutex::new(Vec::new()),
            transaction_probe: Mutex::new(None),
            all_unavailable: Mutex::new(None),
            all_unavailable_fired: Mutex::new(false),
        }
    }

    pub fn set_transaction_probe(
        &self,
        probe: impl Fn(AvailabilityScope) -> bool + Send + Sync + 'static,
    ) {
        *self.transaction_probe.lock().unwrap() = Some(Arc::new(probe));
    }

    pub fn set_all_connectors_unavailable_callback(&self, cb: impl Fn() + Send + Sync + 'static) {
        *self.all_unavailable.lock().unwrap() = Some(Arc::new(cb));
    }

    /// Handle a ChangeAvailability request.
    pub async fn change_availability(
        &self,
        scope: AvailabilityScope,
        status: OperationalStatus,
    ) -> ChangeAvailabilityStatus {
        if let Some(evse_id) = scope.evse_id {
            if evse_id < 1 || evse_id as usize > self.state.evse_count() {
                return ChangeAvailabilityStatus::Rejected;
            }
            if let Some(connector_id) = scope.connector_id {
                match self.state.connector_count(evse_id) {
                    Ok(count) if connector_id >= 1 && connector_id as usize <= count => {}
                    _ => return ChangeAvailabilityStatus::Rejected,
                }
            }
        }

        if self.transaction_active(scope) {
            info!(?scope, %status, "Transaction active, scheduling availability change");
            self.scheduled.lock().unwrap().push(ScheduledChange { scope, status });
            return ChangeAvailabilityStatus::Scheduled;
        }

        match self.apply(scope, status).await {
            Ok(()) => ChangeAvailabilityStatus::Accepted,
            Err(()) => ChangeAvailabilityStatus::Rejected,
        }
    }

    /// Called after every transaction state change; retries scheduled
    /// changes whose scope became transaction-free.
    pub async fn on_transaction_state_changed(&self) {
        let pending: Vec<ScheduledChange> = {
            let mut scheduled = self.scheduled.lock().unwrap();
            std::mem::take(&mut *scheduled)
        };
        for change in pending {
            if self.transaction_active(change.scope) {
                self.scheduled.lock().unwrap().push(change);
            } else {
                info!(scope = ?change.scope, status = %change.status,
                      "Applying deferred availability change");
                let _ = self.apply(change.scope, change.status).await;
            }
        }
    }

    pub fn has_scheduled_changes(&self) -> bool {
        !self.scheduled.lock().unwrap().is_empty()
    }

    async fn apply(
        &self,
        scope: AvailabilityScope,
        status: OperationalStatus,
    ) -> Result<(), ()> {
        let result = match (scope.evse_id, scope.connector_id) {
            (None, _) => {
                self.state
                    .set_cs_individual_operational_status(status, true)
                    .await
            }
            (Some(evse_id), None) => {
                self.state
                    .set_evse_individual_operational_status(evse_id, status, true)
                    .await
            }
            (Some(evse_id), Some(connector_id)) => {
                self.state
                    .set_connector_individual_operational_status(evse_id, connector_id, status, true)
                    .await
            }
        };
        if let Err(e) = result {
            warn!(?scope, %status, error = %e, "Availability change failed");
            return Err(());
        }
        self.check_all_connectors_unavailable();
        Ok(())
    }

    fn transaction_active(&self, scope: AvailabilityScope) -> bool {
        let probe = self.transaction_probe.lock().unwrap().clone();
        probe.map(|p| p(scope)).unwrap_or(false)
    }

    /// Fire the all-connectors-unavailable callback exactly once per
    /// transition into the all-Inoperative state.
    fn check_all_connectors_unavailable(&self) {
        let mut all_inoperative = true;
        'outer: for evse_id in 1..=self.state.evse_count() as i32 {
            let connector_count = match self.state.connector_count(evse_id) {
                Ok(count) => count,
                Err(_) => continue,
            };
            for connector_id in 1..=connector_count as i32 {
                match self
                    .state
                    .get_connector_effective_operational_status(evse_id, connector_id)
                {
                    Ok(OperationalStatus::Inoperative) => {}
                    _ => {
                        all_inoperative = false;
                        break 'outer;
                    }
                }
            }
        }
        if self.transaction_active(AvailabilityScope::station()) {
            return;
        }

        let mut fired = self.all_unavailable_fired.lock().unwrap();
        if all_inoperative && !*fired {
            *fired = true;
            let cb = self.all_unavailable.lock().unwrap().clone();
            drop(fired);
            if let Some(cb) = cb {
                cb();
            }
        } else if !all_inoperative {
            *fired = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database::{init_database, DatabaseConfig, DatabaseHandler};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    async fn setup() -> (Arc<ComponentStateManager>, Availability) {
        let db = Arc::new(DatabaseHandler::new(
            init_database(&DatabaseConfig::in_memory()).await.unwrap(),
        ));
        let mut structure = BTreeMap::new();
        structure.insert(1, 1);
        structure.insert(2, 1);
        let state = ComponentStateManager::new(&structure, db).await.unwrap();
        let availability = Availability::new(state.clone());
        (state, availability)
    }

    #[tokio::test]
    async fn applies_immediately_without_transaction() {
        let (state, availability) = setup().await;
        let status = availability
            .change_availability(AvailabilityScope::evse(1), OperationalStatus::Inoperative)
            .await;
        assert_eq!(status, ChangeAvailabilityStatus::Accepted);
        assert_eq!(
            state.get_evse_individual_operational_status(1).unwrap(),
            OperationalStatus::Inoperative
        );
        // persisted for the next boot
        assert_eq!(
            state.get_evse_persisted_operational_status(1).await,
            OperationalStatus::Inoperative
        );
    }

    #[tokio::test]
    async fn schedules_while_transaction_active_and_applies_after() {
        let (state, availability) = setup().await;
        let tx_active = Arc::new(AtomicBool::new(true));
        let probe = tx_active.clone();
        availability.set_transaction_probe(move |_| probe.load(Ordering::SeqCst));

        let status = availability
            .change_availability(AvailabilityScope::evse(1), OperationalStatus::Inoperative)
            .await;
        assert_eq!(status, ChangeAvailabilityStatus::Scheduled);
        assert!(availability.has_scheduled_changes());
        assert_eq!(
            state.get_evse_individual_operational_status(1).unwrap(),
            OperationalStatus::Operative
        );

        // transaction still running: stays scheduled
        availability.on_transaction_state_changed().await;
        assert!(availability.has_scheduled_changes());

        tx_active.store(false, Ordering::SeqCst);
        availability.on_transaction_state_changed().await;
        assert!(!availability.has_scheduled_changes());
        assert_eq!(
            state.get_evse_individual_operational_status(1).unwrap(),
            OperationalStatus::Inoperative
        );
    }

    #[tokio::test]
    async fn unknown_scope_rejected() {
        let (_, availability) = setup().await;
        assert_eq!(
            availability
                .change_availability(AvailabilityScope::evse(9), OperationalStatus::Inoperative)
                .await,
            ChangeAvailabilityStatus::Rejected
        );
        assert_eq!(
            availability
                .change_availability(
                    AvailabilityScope::connector(1, 5),
                    OperationalStatus::Inoperative
                )
                .await,
            ChangeAvailabilityStatus::Rejected
        );
    }

    #[tokio::test]
    async fn all_connectors_unavailable_fires_once() {
        let (_, availability) = setup().await;
        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        availability.set_all_connectors_unavailable_callback(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        availability
            .change_availability(AvailabilityScope::evse(1), OperationalStatus::Inoperative)
            .await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        availability
            .change_availability(AvailabilityScope::evse(2), OperationalStatus::Inoperative)
            .await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // further Inoperative sets do not re-fire
        availability
            .change_availability(AvailabilityScope::evse(2), OperationalStatus::Inoperative)
            .await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // re-arming after recovery
        availability
            .change_availability(AvailabilityScope::evse(1), OperationalStatus::Operative)
            .await;
        availability
            .change_availability(AvailabilityScope::evse(1), OperationalStatus::Inoperative)
            .await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
