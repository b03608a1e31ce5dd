//! Core business entities and value objects.
//!
//! Everything in this module is version-agnostic: the queue, the scheduler
//! and the state manager operate on these types, and the per-version glue in
//! [`crate::station`] converts them to wire payloads at the boundary.

pub mod authorization;
pub mod error;
pub mod meter;
pub mod network_profile;
pub mod profile;
pub mod status;
pub mod transaction;
pub mod version;

pub use authorization::{AuthorizationStatus, IdTokenInfo};
pub use error::{AppError, DomainError, InfraError};
pub use meter::{MeterValue, Measurand, ReadingContext, SampledValue};
pub use network_profile::{BasicAuthCredentials, ConnectionProfile, SecurityProfileLevel};
pub use profile::{
    ChargingProfile, ChargingProfileKind, ChargingProfilePurpose, ChargingRateUnit,
    ChargingSchedule, ChargingSchedulePeriod, CompositePeriod, CompositeSchedule, LimitAtSoc,
    OperationMode, ProfileSource, RecurrencyKind,
};
pub use status::{ConnectorStatus, FullConnectorStatus, OperationalStatus};
pub use transaction::{StopReason, Transaction};
pub use version::OcppVersion;
