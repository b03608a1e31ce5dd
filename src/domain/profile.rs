//! Charging profile domain model
//!
//! A profile is a time-parameterised limit schedule. Profiles at different
//! stack levels and purposes compose into the composite schedule computed by
//! [`crate::smart_charging`]. Serialized form follows the OCPP field names
//! so schedules can be stored as JSON and converted at the wire boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a profile is for; determines its place in composition priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChargingProfilePurpose {
    ChargePointMaxProfile,
    TxDefaultProfile,
    TxProfile,
    ChargingStationExternalConstraints,
    PriorityCharging,
    LocalGeneration,
}

impl ChargingProfilePurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChargePointMaxProfile => "ChargePointMaxProfile",
            Self::TxDefaultProfile => "TxDefaultProfile",
            Self::TxProfile => "TxProfile",
            Self::ChargingStationExternalConstraints => "ChargingStationExternalConstraints",
            Self::PriorityCharging => "PriorityCharging",
            Self::LocalGeneration => "LocalGeneration",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "ChargePointMaxProfile" | "ChargingStationMaxProfile" => Self::ChargePointMaxProfile,
            "TxDefaultProfile" => Self::TxDefaultProfile,
            "TxProfile" => Self::TxProfile,
            "ChargingStationExternalConstraints" => Self::ChargingStationExternalConstraints,
            "PriorityCharging" => Self::PriorityCharging,
            "LocalGeneration" => Self::LocalGeneration,
            _ => return None,
        })
    }
}

/// How the schedule anchors in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargingProfileKind {
    Absolute,
    Recurring,
    Relative,
    Dynamic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecurrencyKind {
    Daily,
    Weekly,
}

/// Unit the limits of a schedule are expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargingRateUnit {
    A,
    W,
}

impl ChargingRateUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::A => "A",
            Self::W => "W",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "A" => Some(Self::A),
            "W" => Some(Self::W),
            _ => None,
        }
    }
}

/// OCPP 2.1 operation mode of a schedule period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationMode {
    ChargingOnly,
    CentralSetpoint,
    ExternalSetpoint,
    ExternalLimits,
    CentralFrequency,
    LocalFrequency,
    LocalLoadBalancing,
    Idle,
}

/// OCPP 2.1 limit override active below a state-of-charge threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitAtSoc {
    pub soc: i32,
    pub limit: f64,
}

/// One period within a charging schedule. `start_period` is seconds from
/// the schedule start; the period lasts until the next period begins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingSchedulePeriod {
    pub start_period: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_l2: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_l3: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number_phases: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase_to_use: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_mode: Option<OperationMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setpoint: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discharge_limit: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evse_sleep: Option<bool>,
}

impl ChargingSchedulePeriod {
    pub fn new(start_period: i32, limit: f64) -> Self {
        Self {
            start_period,
            limit: Some(limit),
            limit_l2: None,
            limit_l3: None,
            number_phases: None,
            phase_to_use: None,
            operation_mode: None,
            setpoint: None,
            discharge_limit: None,
            evse_sleep: None,
        }
    }
}

/// A limit schedule: ordered periods relative to an anchor instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingSchedule {
    pub charging_rate_unit: ChargingRateUnit,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_schedule: Option<DateTime<Utc>>,
    /// Seconds; open-ended when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_charging_rate: Option<f64>,
    pub charging_schedule_period: Vec<ChargingSchedulePeriod>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_local_time: Option<bool>,
    /// Seconds of randomized start delay (2.1).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub randomized_delay: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_at_soc: Option<LimitAtSoc>,
}

impl ChargingSchedule {
    pub fn new(
        charging_rate_unit: ChargingRateUnit,
        periods: Vec<ChargingSchedulePeriod>,
    ) -> Self {
        Self {
            charging_rate_unit,
            start_schedule: None,
            duration: None,
            min_charging_rate: None,
            charging_schedule_period: periods,
            use_local_time: None,
            randomized_delay: None,
            limit_at_soc: None,
        }
    }
}

/// Where an installed profile came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProfileSource {
    /// Installed through SetChargingProfile.
    Ocpp,
    /// Installed by the local energy-management integration.
    External,
}

impl ProfileSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ocpp => "Ocpp",
            Self::External => "External",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Ocpp" => Some(Self::Ocpp),
            "External" => Some(Self::External),
            _ => None,
        }
    }
}

/// A charging profile as installed on the station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingProfile {
    pub id: i32,
    pub stack_level: i32,
    pub charging_profile_purpose: ChargingProfilePurpose,
    pub charging_profile_kind: ChargingProfileKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recurrency_kind: Option<RecurrencyKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_to: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    pub charging_schedule: ChargingSchedule,
}

/// One period of a computed composite schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositePeriod {
    /// Seconds from the composite schedule start.
    pub start_period: i32,
    pub limit: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number_phases: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase_to_use: Option<i32>,
}

/// The effective limit curve over a queried window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeSchedule {
    pub evse_id: i32,
    /// Seconds covered from `schedule_start`.
    pub duration: i32,
    pub schedule_start: DateTime<Utc>,
    pub charging_rate_unit: ChargingRateUnit,
    pub charging_schedule_period: Vec<CompositePeriod>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_json_uses_ocpp_field_names() {
        let schedule = ChargingSchedule::new(
            ChargingRateUnit::A,
            vec![ChargingSchedulePeriod::new(0, 16.0)],
        );
        let json = serde_json::to_value(&schedule).unwrap();
        assert_eq!(json["chargingRateUnit"], "A");
        assert_eq!(json["chargingSchedulePeriod"][0]["startPeriod"], 0);
        assert_eq!(json["chargingSchedulePeriod"][0]["limit"], 16.0);
        assert!(json.get("startSchedule").is_none());
    }

    #[test]
    fn purpose_string_roundtrip() {
        for p in [
            ChargingProfilePurpose::ChargePointMaxProfile,
            ChargingProfilePurpose::TxDefaultProfile,
            ChargingProfilePurpose::TxProfile,
            ChargingProfilePurpose::ChargingStationExternalConstraints,
            ChargingProfilePurpose::PriorityCharging,
            ChargingProfilePurpose::LocalGeneration,
        ] {
            assert_eq!(ChargingProfilePurpose::parse(p.as_str()), Some(p));
        }
        // 2.x alias for the station-wide cap
        assert_eq!(
            ChargingProfilePurpose::parse("ChargingStationMaxProfile"),
            Some(ChargingProfilePurpose::ChargePointMaxProfile)
        );
    }

    #[test]
    fn profile_json_roundtrip() {
        let profile = ChargingProfile {
            id: 7,
            stack_level: 2,
            charging_profile_purpose: ChargingProfilePurpose::TxProfile,
            charging_profile_kind: ChargingProfileKind::Relative,
            recurrency_kind: None,
            valid_from: None,
            valid_to: None,
            transaction_id: Some("tx-9".into()),
            charging_schedule: ChargingSchedule::new(
                ChargingRateUnit::W,
                vec![
                    ChargingSchedulePeriod::new(0, 11000.0),
                    ChargingSchedulePeriod::new(600, 7400.0),
                ],
            ),
        };
        let json = serde_json::to_string(&profile).unwrap();
        let back: ChargingProfile = serde_json::from_str(&json).unwrap();
        assert_eq!(back, profile);
    }
}
