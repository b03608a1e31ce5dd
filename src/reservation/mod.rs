//! Reservation
//!
//! Books an EVSE or connector slot for an id token with an expiry. An
//! accepted reservation marks the chosen connector reserved in the state
//! manager and arms an expiry timer; cancellation and expiry clear the
//! mark and report a ReservationStatusUpdate upstream.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::component_state::ComponentStateManager;
use crate::device_model::{variables, DeviceModel};
use crate::domain::ConnectorStatus;
use crate::support::OwnedTimer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveNowStatus {
    Accepted,
    Faulted,
    Occupied,
    Rejected,
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReservationStatus {
    Accepted,
    Rejected,
}

/// Reported through ReservationStatusUpdate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationUpdateStatus {
    Expired,
    Removed,
}

#[derive(Debug, Clone)]
pub struct ReservationRequest {
    pub id: i32,
    pub evse_id: Option<i32>,
    pub connector_type: Option<String>,
    pub id_token: String,
    pub group_id_token: Option<String>,
    pub expiry: DateTime<Utc>,
}

struct ActiveReservation {
    evse_id: i32,
    connector_id: i32,
    id_token: String,
    _expiry_timer: OwnedTimer,
}

type StatusUpdateCallback = dyn Fn(i32, ReservationUpdateStatus) + Send + Sync;

pub struct Reservation {
    device_model: Arc<DeviceModel>,
    state: Arc<ComponentStateManager>,
    /// Physical connector types per EVSE: `evse_id -> [(connector_id, type)]`.
    connector_types: HashMap<i32, Vec<(i32, String)>>,
    active: Arc<Mutex<HashMap<i32, ActiveReservation>>>,
    status_update: Arc<Mutex<Option<Arc<StatusUpdateCallback>>>>,
}

impl Reservation {
    pub fn new(
        device_model: Arc<DeviceModel>,
        state: Arc<ComponentStateManager>,
        connector_types: HashMap<i32, Vec<(i32, String)>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            device_model,
            state,
            connector_types,
            active: Arc::new(Mutex::new(HashMap::new())),
            status_update: Arc::new(Mutex::new(None)),
        })
    }

    /// Fired asynchronously after a reservation expires or is cancelled.
    pub fn set_status_update_callback(
        &self,
        cb: impl Fn(i32, ReservationUpdateStatus) + Send + Sync + 'static,
    ) {
        *self.status_update.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn reserve_now(self: &Arc<Self>, request: ReservationRequest) -> ReserveNowStatus {
        let available = self
            .device_model
            .get_bool(&variables::RESERVATION_AVAILABLE)
            .unwrap_or(false);
        let enabled = self
            .device_model
            .get_bool(&variables::RESERVATION_ENABLED)
            .unwrap_or(false);
        if !available || !enabled {
            return ReserveNowStatus::Rejected;
        }

        let evse_id = match request.evse_id {
            Some(evse_id) => evse_id,
            None => {
                let non_evse_specific = self
                    .device_model
                    .get_bool(&variables::RESERVATION_NON_EVSE_SPECIFIC)
                    .unwrap_or(false);
                if !non_evse_specific {
                    return ReserveNowStatus::Rejected;
                }
                // pick the first EVSE with a free matching connector
                match self.find_any_evse(&request.connector_type) {
                    Some(evse_id) => evse_id,
                    None => return ReserveNowStatus::Unavailable,
                }
            }
        };

        let Some(connector_id) = self.matching_connector(evse_id, &request.connector_type) else {
            // the named connector type does not exist on this EVSE
            return ReserveNowStatus::Rejected;
        };

        match self.state.get_connector_effective_status(evse_id, connector_id) {
            Ok(ConnectorStatus::Available) => {}
            Ok(ConnectorStatus::Faulted) => return ReserveNowStatus::Faulted,
            Ok(ConnectorStatus::Occupied) => return ReserveNowStatus::Occupied,
            Ok(ConnectorStatus::Reserved) => return ReserveNowStatus::Occupied,
            Ok(ConnectorStatus::Unavailable) => return ReserveNowStatus::Unavailable,
            Err(_) => return ReserveNowStatus::Rejected,
        }

        if self.state.set_connector_reserved(evse_id, connector_id, true).is_err() {
            return ReserveNowStatus::Rejected;
        }

        // replacing an existing reservation with the same id re-arms it
        self.remove_reservation(request.id, false);

        let timer = self.arm_expiry_timer(request.id, request.expiry);
        self.active.lock().unwrap().insert(
            request.id,
            ActiveReservation {
                evse_id,
                connector_id,
                id_token: request.id_token.clone(),
                _expiry_timer: timer,
            },
        );
        info!(reservation_id = request.id, evse_id, connector_id, expiry = %request.expiry,
              "Reservation accepted");
        ReserveNowStatus::Accepted
    }

    pub fn cancel_reservation(&self, reservation_id: i32) -> CancelReservationStatus {
        if self.remove_reservation(reservation_id, true) {
            self.fire_status_update(reservation_id, ReservationUpdateStatus::Removed);
            CancelReservationStatus::Accepted
        } else {
            CancelReservationStatus::Rejected
        }
    }

    /// The reservation consumed by a matching session start, without a
    /// status update on the wire.
    pub fn consume(&self, reservation_id: i32) {
        self.remove_reservation(reservation_id, true);
    }

    /// Reservation id holding a connector, if any.
    pub fn reservation_on_connector(&self, evse_id: i32, connector_id: i32) -> Option<i32> {
        self.active
            .lock()
            .unwrap()
            .iter()
            .find(|(_, r)| r.evse_id == evse_id && r.connector_id == connector_id)
            .map(|(&id, _)| id)
    }

    /// Whether `id_token` may use the connector despite the reservation.
    pub fn token_matches(&self, reservation_id: i32, id_token: &str) -> bool {
        self.active
            .lock()
            .unwrap()
            .get(&reservation_id)
            .map(|r| r.id_token == id_token)
            .unwrap_or(false)
    }

    fn matching_connector(&self, evse_id: i32, connector_type: &Option<String>) -> Option<i32> {
        let connectors = self.connector_types.get(&evse_id)?;
        match connector_type {
            None => connectors.first().map(|(id, _)| *id),
            Some(wanted) => connectors
                .iter()
                .find(|(_, ty)| ty == wanted)
                .map(|(id, _)| *id),
        }
    }

    fn find_any_evse(&self, connector_type: &Option<String>) -> Option<i32> {
        let mut evse_ids: Vec<i32> = self.connector_types.keys().copied().collect();
        evse_ids.sort_unstable();
        evse_ids.into_iter().find(|&evse_id| {
            self.matching_connector(evse_id, connector_type)
                .map(|connector_id| {
                    matches!(
                        self.state.get_connector_effective_status(evse_id, connector_id),
                        Ok(ConnectorStatus::Available)
                    )
                })
                .unwrap_or(false)
        })
    }

    fn arm_expiry_timer(self: &Arc<Self>, reservation_id: i32, expiry: DateTime<Utc>) -> OwnedTimer {
        let this = Arc::downgrade(self);
        OwnedTimer::at(expiry, move || async move {
            if let Some(reservation) = this.upgrade() {
                if reservation.remove_reservation(reservation_id, true) {
                    info!(reservation_id, "Reservation expired");
                    reservation.fire_status_update(reservation_id, ReservationUpdateStatus::Expired);
                }
            }
        })
    }

    /// Remove bookkeeping; optionally clear the connector mark. Returns
    /// whether the reservation existed.
    fn remove_reservation(&self, reservation_id: i32, clear_mark: bool) -> bool {
        let removed = self.active.lock().unwrap().remove(&reservation_id);
        match removed {
            Some(reservation) => {
                if clear_mark {
                    if let Err(e) = self.state.set_connector_reserved(
                        reservation.evse_id,
                        reservation.connector_id,
                        false,
                    ) {
                        warn!(reservation_id, error = %e, "Failed to clear reserved mark");
                    }
                }
                true
            }
            None => false,
        }
    }

    fn fire_status_update(&self, reservation_id: i32, status: ReservationUpdateStatus) {
        let cb = self.status_update.lock().unwrap().clone();
        if let Some(cb) = cb {
            cb(reservation_id, status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database::{init_database, DatabaseConfig, DatabaseHandler};
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    async fn setup() -> (Arc<ComponentStateManager>, Arc<Reservation>) {
        let db = Arc::new(DatabaseHandler::new(
            init_database(&DatabaseConfig::in_memory()).await.unwrap(),
        ));
        let mut structure = BTreeMap::new();
        structure.insert(1, 2);
        let state = ComponentStateManager::new(&structure, db).await.unwrap();

        let mut types = HashMap::new();
        types.insert(1, vec![(1, "cType2".to_string()), (2, "cTesla".to_string())]);
        let reservation = Reservation::new(
            Arc::new(DeviceModel::with_defaults()),
            state.clone(),
            types,
        );
        (state, reservation)
    }

    fn request(id: i32, connector_type: Option<&str>) -> ReservationRequest {
        ReservationRequest {
            id,
            evse_id: Some(1),
            connector_type: connector_type.map(|s| s.to_string()),
            id_token: "TOKEN".into(),
            group_id_token: None,
            expiry: Utc::now() + chrono::Duration::hours(1),
        }
    }

    #[tokio::test]
    async fn accept_marks_connector_reserved() {
        let (state, reservation) = setup().await;
        assert_eq!(
            reservation.reserve_now(request(7, Some("cTesla"))),
            ReserveNowStatus::Accepted
        );
        assert_eq!(
            state.get_connector_effective_status(1, 2).unwrap(),
            ConnectorStatus::Reserved
        );
        assert_eq!(reservation.reservation_on_connector(1, 2), Some(7));
        assert!(reservation.token_matches(7, "TOKEN"));
        assert!(!reservation.token_matches(7, "OTHER"));
    }

    #[tokio::test]
    async fn occupied_connector_rejected_without_touching_mark() {
        let (state, reservation) = setup().await;
        state.set_connector_occupied(1, 2, true).unwrap();
        assert_eq!(
            reservation.reserve_now(request(7, Some("cTesla"))),
            ReserveNowStatus::Occupied
        );
        // the reserved flag was never set
        state.set_connector_occupied(1, 2, false).unwrap();
        assert_eq!(
            state.get_connector_effective_status(1, 2).unwrap(),
            ConnectorStatus::Available
        );
    }

    #[tokio::test]
    async fn unknown_connector_type_rejected() {
        let (_, reservation) = setup().await;
        assert_eq!(
            reservation.reserve_now(request(7, Some("cCHAdeMO"))),
            ReserveNowStatus::Rejected
        );
    }

    #[tokio::test]
    async fn faulted_and_unavailable_reported() {
        let (state, reservation) = setup().await;
        state.set_connector_faulted(1, 1, true).unwrap();
        assert_eq!(
            reservation.reserve_now(request(1, Some("cType2"))),
            ReserveNowStatus::Faulted
        );
        state.set_connector_faulted(1, 1, false).unwrap();
        state.set_connector_unavailable(1, 1, true).unwrap();
        assert_eq!(
            reservation.reserve_now(request(1, Some("cType2"))),
            ReserveNowStatus::Unavailable
        );
    }

    #[tokio::test]
    async fn non_evse_specific_disabled_requires_evse() {
        let (_, reservation) = setup().await;
        let mut req = request(3, None);
        req.evse_id = None;
        assert_eq!(reservation.reserve_now(req), ReserveNowStatus::Rejected);
    }

    #[tokio::test]
    async fn cancel_clears_mark_and_reports_removed() {
        let (state, reservation) = setup().await;
        let updates: Arc<StdMutex<Vec<(i32, ReservationUpdateStatus)>>> =
            Arc::new(StdMutex::new(Vec::new()));
        let u = updates.clone();
        reservation.set_status_update_callback(move |id, status| {
            u.lock().unwrap().push((id, status));
        });

        reservation.reserve_now(request(9, None));
        assert_eq!(
            reservation.cancel_reservation(9),
            CancelReservationStatus::Accepted
        );
        assert_eq!(
            state.get_connector_effective_status(1, 1).unwrap(),
            ConnectorStatus::Available
        );
        assert_eq!(*updates.lock().unwrap(), vec![(9, ReservationUpdateStatus::Removed)]);
        assert_eq!(
            reservation.cancel_reservation(9),
            CancelReservationStatus::Rejected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_clears_mark_and_reports_expired() {
        let (state, reservation) = setup().await;
        let updates: Arc<StdMutex<Vec<(i32, ReservationUpdateStatus)>>> =
            Arc::new(StdMutex::new(Vec::new()));
        let u = updates.clone();
        reservation.set_status_update_callback(move |id, status| {
            u.lock().unwrap().push((id, status));
        });

        let mut req = request(4, None);
        req.expiry = Utc::now() + chrono::Duration::seconds(30);
        assert_eq!(reservation.reserve_now(req), ReserveNowStatus::Accepted);

        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(
            state.get_connector_effective_status(1, 1).unwrap(),
            ConnectorStatus::Available
        );
        assert_eq!(*updates.lock().unwrap(), vec![(4, ReservationUpdateStatus::Expired)]);
    }
}
