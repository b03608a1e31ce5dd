//! Application hooks
//!
//! The embedding application plugs behaviour in through a recognized set of
//! function fields initialized at construction; the core invokes them
//! without knowing their implementation. Every hook is optional: an absent
//! hook means the corresponding CSMS request is answered Rejected (or the
//! event is dropped).

use std::sync::Arc;

use crate::domain::{MeterValue, OperationalStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    Soft,
    Hard,
}

pub type CsAvailabilityHook = Arc<dyn Fn(OperationalStatus) + Send + Sync>;
pub type EvseAvailabilityHook = Arc<dyn Fn(i32, OperationalStatus) + Send + Sync>;
pub type ConnectorAvailabilityHook = Arc<dyn Fn(i32, i32, OperationalStatus) + Send + Sync>;
/// `(evse_id, id_token, remote_start_id)` -> accepted
pub type RemoteStartHook = Arc<dyn Fn(i32, String, Option<i32>) -> bool + Send + Sync>;
/// `(transaction_id)` -> accepted
pub type RemoteStopHook = Arc<dyn Fn(String) -> bool + Send + Sync>;
pub type ResetAllowedHook = Arc<dyn Fn(ResetKind) -> bool + Send + Sync>;
pub type DoResetHook = Arc<dyn Fn(ResetKind) + Send + Sync>;
/// `(evse_id, connector_id)` -> unlocked
pub type UnlockConnectorHook = Arc<dyn Fn(i32, i32) -> bool + Send + Sync>;
/// The composite limit situation of an EVSE changed; the application
/// should re-query the composite schedule and adjust the power path.
pub type ChargingLimitChangedHook = Arc<dyn Fn(i32) + Send + Sync>;
/// `(evse_id, connector_id)` -> current meter sample
pub type SampleMeterHook = Arc<dyn Fn(i32, i32) -> Option<MeterValue> + Send + Sync>;
pub type AllConnectorsUnavailableHook = Arc<dyn Fn() + Send + Sync>;
/// `(location url)` -> download started
pub type UpdateFirmwareHook = Arc<dyn Fn(String) -> bool + Send + Sync>;

#[derive(Default, Clone)]
pub struct StationCallbacks {
    pub cs_effective_availability_changed: Option<CsAvailabilityHook>,
    pub evse_effective_availability_changed: Option<EvseAvailabilityHook>,
    pub connector_effective_availability_changed: Option<ConnectorAvailabilityHook>,
    pub remote_start: Option<RemoteStartHook>,
    pub remote_stop: Option<RemoteStopHook>,
    pub is_reset_allowed: Option<ResetAllowedHook>,
    pub do_reset: Option<DoResetHook>,
    pub unlock_connector: Option<UnlockConnectorHook>,
    pub charging_limit_changed: Option<ChargingLimitChangedHook>,
    pub sample_meter: Option<SampleMeterHook>,
    pub all_connectors_unavailable: Option<AllConnectorsUnavailableHook>,
    pub update_firmware: Option<UpdateFirmwareHook>,
}
