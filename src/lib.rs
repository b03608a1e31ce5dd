//! # ocpp-station
//!
//! Library implementation of the charging-station side of OCPP 1.6 and
//! 2.0.1/2.1: the protocol state machine a Charge Point / Charging Station
//! runs to talk to its CSMS.
//!
//! ## Architecture
//!
//! - **support**: cross-cutting utilities (OCPP-J framing, shutdown, timers)
//! - **domain**: version-agnostic entities and value objects
//! - **device_model**: the typed configuration store, the sole tuning surface
//! - **infrastructure**: persistence (SeaORM/SQLite) and the certificate store
//! - **connectivity**: WebSocket ownership and network-profile failover
//! - **queue**: ordering, durability, retry and correlation of outbound CALLs
//! - **component_state**: Operative/Inoperative triples and status projection
//! - **smart_charging**: profile store and composite-schedule computation
//! - **authorization / reservation / availability / security**: functional blocks
//! - **station**: the `ChargePoint` facade wiring everything together
//!
//! The application embeds [`station::ChargePoint`], plugs its hardware hooks
//! into [`station::StationCallbacks`], and drives sessions through the
//! public API; everything on the wire side is handled here.

pub mod authorization;
pub mod availability;
pub mod component_state;
pub mod connectivity;
pub mod device_model;
pub mod domain;
pub mod infrastructure;
pub mod queue;
pub mod reservation;
pub mod security;
pub mod smart_charging;
pub mod station;
pub mod support;

// Re-export commonly used types at crate root
pub use device_model::DeviceModel;
pub use domain::{
    AuthorizationStatus, ChargingProfile, ChargingRateUnit, CompositeSchedule, ConnectionProfile,
    ConnectorStatus, IdTokenInfo, MeterValue, OcppVersion, OperationalStatus,
    SecurityProfileLevel, StopReason, Transaction,
};
pub use infrastructure::database::{init_database, DatabaseConfig, DatabaseHandler};
pub use station::{ChargePoint, ResetKind, StationCallbacks, StationConfig};
pub use support::{OcppFrame, ShutdownSignal};
