//! Standardized controller variables read by the core
//!
//! Component and variable names follow the OCPP 2.0.1 appendix; the same
//! names back the 1.6 configuration keys so the queue, scheduler and
//! security blocks stay version-agnostic.

use super::{DeviceModel, Mutability, VariableValue};

/// Address of one variable in the device model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentVariable {
    pub component: &'static str,
    pub variable: &'static str,
}

const fn cv(component: &'static str, variable: &'static str) -> ComponentVariable {
    ComponentVariable { component, variable }
}

// ── OCPPCommCtrlr ──────────────────────────────────────────────

pub const HEARTBEAT_INTERVAL: ComponentVariable = cv("OCPPCommCtrlr", "HeartbeatInterval");
pub const MESSAGE_TIMEOUT: ComponentVariable = cv("OCPPCommCtrlr", "MessageTimeout");
pub const MESSAGE_ATTEMPTS_TRANSACTION: ComponentVariable =
    cv("OCPPCommCtrlr", "MessageAttempts");
pub const MESSAGE_ATTEMPT_INTERVAL_TRANSACTION: ComponentVariable =
    cv("OCPPCommCtrlr", "MessageAttemptInterval");
pub const OFFLINE_THRESHOLD: ComponentVariable = cv("OCPPCommCtrlr", "OfflineThreshold");
pub const RETRY_BACK_OFF_REPEAT_TIMES: ComponentVariable =
    cv("OCPPCommCtrlr", "RetryBackOffRepeatTimes");
pub const RETRY_BACK_OFF_RANDOM_RANGE: ComponentVariable =
    cv("OCPPCommCtrlr", "RetryBackOffRandomRange");
pub const RETRY_BACK_OFF_WAIT_MINIMUM: ComponentVariable =
    cv("OCPPCommCtrlr", "RetryBackOffWaitMinimum");
pub const NETWORK_CONFIGURATION_PRIORITY: ComponentVariable =
    cv("OCPPCommCtrlr", "NetworkConfigurationPriority");
pub const NETWORK_PROFILE_CONNECTION_ATTEMPTS: ComponentVariable =
    cv("OCPPCommCtrlr", "NetworkProfileConnectionAttempts");

// ── SecurityCtrlr ──────────────────────────────────────────────

pub const SECURITY_PROFILE: ComponentVariable = cv("SecurityCtrlr", "SecurityProfile");
pub const CERT_EXPIRY_CHECK_INTERVAL: ComponentVariable =
    cv("SecurityCtrlr", "CertificateExpireCheckIntervalSeconds");
pub const CERT_EXPIRY_NOTIFICATION_DAYS: ComponentVariable =
    cv("SecurityCtrlr", "ExpiryNotificationDays");
pub const CERT_SIGNING_WAIT_MINIMUM: ComponentVariable =
    cv("SecurityCtrlr", "CertSigningWaitMinimum");
pub const OCSP_REQUEST_INTERVAL: ComponentVariable =
    cv("SecurityCtrlr", "OCSPRequestInterval");
pub const ORGANIZATION_NAME: ComponentVariable = cv("SecurityCtrlr", "OrganizationName");

// ── AuthCtrlr / AuthCacheCtrlr / LocalAuthListCtrlr ────────────

pub const LOCAL_PRE_AUTHORIZE: ComponentVariable = cv("AuthCtrlr", "LocalPreAuthorize");
pub const OFFLINE_TX_FOR_UNKNOWN_ID_ENABLED: ComponentVariable =
    cv("AuthCtrlr", "OfflineTxForUnknownIdEnabled");
pub const AUTH_CACHE_ENABLED: ComponentVariable = cv("AuthCacheCtrlr", "Enabled");
pub const AUTH_CACHE_STORAGE: ComponentVariable = cv("AuthCacheCtrlr", "AuthCacheStorage");
pub const LOCAL_AUTH_LIST_ENABLED: ComponentVariable = cv("LocalAuthListCtrlr", "Enabled");

// ── SmartChargingCtrlr ─────────────────────────────────────────

pub const CHARGE_PROFILE_MAX_STACK_LEVEL: ComponentVariable =
    cv("SmartChargingCtrlr", "ProfileStackLevel");
pub const MAX_CHARGING_PROFILES_INSTALLED: ComponentVariable =
    cv("SmartChargingCtrlr", "Entries");
pub const CHARGING_SCHEDULE_RATE_UNIT: ComponentVariable =
    cv("SmartChargingCtrlr", "RateUnit");
pub const SUPPLY_VOLTAGE: ComponentVariable = cv("SmartChargingCtrlr", "SupplyVoltage");
pub const PROFILE_UPDATE_RATE_LIMIT: ComponentVariable =
    cv("SmartChargingCtrlr", "ChargingProfileUpdateRateLimit");
pub const MAX_EXTERNAL_CONSTRAINTS_ID: ComponentVariable =
    cv("SmartChargingCtrlr", "MaxExternalConstraintsId");
pub const DEFAULT_LIMIT_AMPS: ComponentVariable =
    cv("SmartChargingCtrlr", "CompositeScheduleDefaultLimitAmps");
pub const DEFAULT_LIMIT_WATTS: ComponentVariable =
    cv("SmartChargingCtrlr", "CompositeScheduleDefaultLimitWatts");
pub const DEFAULT_NUMBER_PHASES: ComponentVariable =
    cv("SmartChargingCtrlr", "CompositeScheduleDefaultNumberPhases");

// OCPP 2.1 feature gates
pub const SUPPORTS_DYNAMIC_PROFILES: ComponentVariable =
    cv("SmartChargingCtrlr", "SupportsDynamicProfiles");
pub const SUPPORTS_USE_LOCAL_TIME: ComponentVariable =
    cv("SmartChargingCtrlr", "SupportsUseLocalTime");
pub const SUPPORTS_RANDOMIZED_DELAY: ComponentVariable =
    cv("SmartChargingCtrlr", "SupportsRandomizedDelay");
pub const SUPPORTS_LIMIT_AT_SOC: ComponentVariable =
    cv("SmartChargingCtrlr", "SupportsLimitAtSoC");
pub const SUPPORTS_EVSE_SLEEP: ComponentVariable = cv("SmartChargingCtrlr", "SupportsEvseSleep");
pub const SUPPORTS_PRIORITY_CHARGING: ComponentVariable =
    cv("SmartChargingCtrlr", "SupportsPriorityCharging");
pub const SUPPORTS_LOCAL_GENERATION: ComponentVariable =
    cv("SmartChargingCtrlr", "SupportsLocalGeneration");

// ── ReservationCtrlr ───────────────────────────────────────────

pub const RESERVATION_AVAILABLE: ComponentVariable = cv("ReservationCtrlr", "Available");
pub const RESERVATION_ENABLED: ComponentVariable = cv("ReservationCtrlr", "Enabled");
pub const RESERVATION_NON_EVSE_SPECIFIC: ComponentVariable =
    cv("ReservationCtrlr", "NonEvseSpecific");

// ── SampledDataCtrlr / AlignedDataCtrlr ────────────────────────

pub const METER_VALUE_SAMPLE_INTERVAL: ComponentVariable =
    cv("SampledDataCtrlr", "TxUpdatedInterval");
pub const CLOCK_ALIGNED_DATA_INTERVAL: ComponentVariable =
    cv("AlignedDataCtrlr", "Interval");

/// Install every variable above at its default value.
pub fn install_defaults(model: &DeviceModel) {
    use Mutability::{ReadOnly, ReadWrite};
    use VariableValue as V;

    let rw_int = |cvar: &ComponentVariable, v: i64, persistent: bool| {
        model.register(cvar, V::Int(v), ReadWrite, persistent);
    };
    let ro_int = |cvar: &ComponentVariable, v: i64| {
        model.register(cvar, V::Int(v), ReadOnly, false);
    };
    let rw_bool = |cvar: &ComponentVariable, v: bool| {
        model.register(cvar, V::Bool(v), ReadWrite, true);
    };

    rw_int(&HEARTBEAT_INTERVAL, 300, true);
    rw_int(&MESSAGE_TIMEOUT, 30, true);
    rw_int(&MESSAGE_ATTEMPTS_TRANSACTION, 5, true);
    rw_int(&MESSAGE_ATTEMPT_INTERVAL_TRANSACTION, 10, true);
    rw_int(&OFFLINE_THRESHOLD, 300, true);
    rw_int(&RETRY_BACK_OFF_REPEAT_TIMES, 3, true);
    rw_int(&RETRY_BACK_OFF_RANDOM_RANGE, 10, true);
    rw_int(&RETRY_BACK_OFF_WAIT_MINIMUM, 3, true);
    model.register(
        &NETWORK_CONFIGURATION_PRIORITY,
        V::OptionList(vec!["1".to_string()]),
        ReadWrite,
        true,
    );
    rw_int(&NETWORK_PROFILE_CONNECTION_ATTEMPTS, 3, true);

    rw_int(&SECURITY_PROFILE, 1, true);
    rw_int(&CERT_EXPIRY_CHECK_INTERVAL, 12 * 60 * 60, true);
    rw_int(&CERT_EXPIRY_NOTIFICATION_DAYS, 30, true);
    rw_int(&CERT_SIGNING_WAIT_MINIMUM, 30, true);
    rw_int(&OCSP_REQUEST_INTERVAL, 7 * 24 * 60 * 60, true);
    model.register(
        &ORGANIZATION_NAME,
        V::Text("OcppStation".to_string()),
        ReadWrite,
        true,
    );

    rw_bool(&LOCAL_PRE_AUTHORIZE, true);
    rw_bool(&OFFLINE_TX_FOR_UNKNOWN_ID_ENABLED, false);
    rw_bool(&AUTH_CACHE_ENABLED, true);
    ro_int(&AUTH_CACHE_STORAGE, 1024 * 1024);
    rw_bool(&LOCAL_AUTH_LIST_ENABLED, true);

    ro_int(&CHARGE_PROFILE_MAX_STACK_LEVEL, 10);
    ro_int(&MAX_CHARGING_PROFILES_INSTALLED, 500);
    model.register(
        &CHARGING_SCHEDULE_RATE_UNIT,
        V::OptionList(vec!["A".to_string(), "W".to_string()]),
        ReadOnly,
        false,
    );
    model.register(&SUPPLY_VOLTAGE, V::Decimal(230.0), ReadOnly, false);
    rw_int(&PROFILE_UPDATE_RATE_LIMIT, 0, true);
    ro_int(&MAX_EXTERNAL_CONSTRAINTS_ID, 0);
    model.register(&DEFAULT_LIMIT_AMPS, V::Decimal(48.0), ReadOnly, false);
    model.register(&DEFAULT_LIMIT_WATTS, V::Decimal(33120.0), ReadOnly, false);
    ro_int(&DEFAULT_NUMBER_PHASES, 3);

    for gate in [
        &SUPPORTS_DYNAMIC_PROFILES,
        &SUPPORTS_USE_LOCAL_TIME,
        &SUPPORTS_RANDOMIZED_DELAY,
        &SUPPORTS_LIMIT_AT_SOC,
        &SUPPORTS_EVSE_SLEEP,
        &SUPPORTS_PRIORITY_CHARGING,
        &SUPPORTS_LOCAL_GENERATION,
    ] {
        model.register(gate, V::Bool(false), ReadOnly, false);
    }

    model.register(&RESERVATION_AVAILABLE, V::Bool(true), ReadOnly, false);
    rw_bool(&RESERVATION_ENABLED, true);
    rw_bool(&RESERVATION_NON_EVSE_SPECIFIC, false);

    rw_int(&METER_VALUE_SAMPLE_INTERVAL, 60, true);
    rw_int(&CLOCK_ALIGNED_DATA_INTERVAL, 900, true);
}
