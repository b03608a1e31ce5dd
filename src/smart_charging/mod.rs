//! Smart-charging core
//!
//! Stores charging profiles, validates installations, and computes the
//! composite limit schedule for any EVSE and window. Profiles and
//! transactions reference each other by id only; ids resolve at use.
//! Store mutations are serialized; composite queries work on a snapshot.

pub mod composite;
pub mod period;

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::device_model::{variables, DeviceModel};
use crate::domain::{
    ChargingProfile, ChargingProfileKind, ChargingProfilePurpose, ChargingRateUnit,
    CompositeSchedule, ProfileSource,
};
use crate::infrastructure::database::handler::{ProfileFilter, StoredProfile};
use crate::infrastructure::database::DatabaseHandler;
use composite::PurposeSchedules;
use period::{calculate_profile, ScheduleDefaults};

/// Why a SetChargingProfile was rejected; `code` feeds the CALLERROR /
/// status info, `detail` the diagnostic text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileRejection {
    pub code: &'static str,
    pub detail: String,
}

impl ProfileRejection {
    fn new(code: &'static str, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }
}

/// An active charging session, for TxProfile validation and Relative
/// schedule anchoring.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub transaction_id: String,
    pub started_at: DateTime<Utc>,
}

pub struct SmartChargingCore {
    db: Arc<DatabaseHandler>,
    device_model: Arc<DeviceModel>,
    profiles: Mutex<HashMap<i32, StoredProfile>>,
    last_accepted_insert: Mutex<Option<Instant>>,
}

impl SmartChargingCore {
    pub fn new(db: Arc<DatabaseHandler>, device_model: Arc<DeviceModel>) -> Self {
        Self {
            db,
            device_model,
            profiles: Mutex::new(HashMap::new()),
            last_accepted_insert: Mutex::new(None),
        }
    }

    /// Rehydrate the in-memory store from the database on boot.
    pub async fn load_installed_profiles(&self) -> Result<usize, crate::domain::AppError> {
        let stored = self
            .db
            .list_profiles(&ProfileFilter::default())
            .await
            .map_err(crate::domain::InfraError::from)?;
        let count = stored.len();
        let mut profiles = self.profiles.lock().unwrap();
        profiles.clear();
        for entry in stored {
            profiles.insert(entry.profile.id, entry);
        }
        if count > 0 {
            info!(count, "Loaded installed charging profiles");
        }
        Ok(count)
    }

    fn defaults(&self) -> ScheduleDefaults {
        ScheduleDefaults {
            limit_amps: self
                .device_model
                .get_decimal(&variables::DEFAULT_LIMIT_AMPS)
                .unwrap_or(48.0),
            limit_watts: self
                .device_model
                .get_decimal(&variables::DEFAULT_LIMIT_WATTS)
                .unwrap_or(33120.0),
            number_phases: self
                .device_model
                .get_int(&variables::DEFAULT_NUMBER_PHASES)
                .unwrap_or(3) as i32,
            supply_voltage: self
                .device_model
                .get_decimal(&variables::SUPPLY_VOLTAGE)
                .unwrap_or(230.0),
        }
    }

    // ── Installation ───────────────────────────────────────

    /// Validate and install a profile. On acceptance the profile is durable
    /// before this returns; any uniquely-placed older profile with the same
    /// `(evse, stack level, purpose)` combination is replaced.
    pub async fn add_profile(
        &self,
        profile: ChargingProfile,
        evse_id: i32,
        source: ProfileSource,
        active_session: Option<&SessionContext>,
    ) -> Result<(), ProfileRejection> {
        self.validate(&profile, evse_id, source, active_session)?;

        let replaced: Vec<i32> = {
            let profiles = self.profiles.lock().unwrap();
            profiles
                .values()
                .filter(|existing| {
                    existing.profile.id != profile.id
                        && existing.evse_id == evse_id
                        && existing.profile.stack_level == profile.stack_level
                        && existing.profile.charging_profile_purpose
                            == profile.charging_profile_purpose
                        && match profile.charging_profile_purpose {
                            ChargingProfilePurpose::TxProfile => {
                                existing.profile.transaction_id == profile.transaction_id
                            }
                            _ => true,
                        }
                })
                .map(|existing| existing.profile.id)
                .collect()
        };

        for old_id in &replaced {
            let _ = self
                .db
                .delete_profiles(&ProfileFilter {
                    profile_id: Some(*old_id),
                    ..Default::default()
                })
                .await;
        }
        if let Err(e) = self.db.upsert_profile(&profile, evse_id, source).await {
            // storage failure must not partially succeed
            warn!(profile_id = profile.id, error = %e, "Profile persistence failed");
            return Err(ProfileRejection::new(
                "InternalError",
                format!("storage failure: {}", e),
            ));
        }

        {
            let mut profiles = self.profiles.lock().unwrap();
            for old_id in &replaced {
                profiles.remove(old_id);
            }
            profiles.insert(
                profile.id,
                StoredProfile {
                    profile,
                    evse_id,
                    source,
                },
            );
        }
        if source == ProfileSource::Ocpp {
            *self.last_accepted_insert.lock().unwrap() = Some(Instant::now());
        }
        Ok(())
    }

    fn validate(
        &self,
        profile: &ChargingProfile,
        evse_id: i32,
        source: ProfileSource,
        active_session: Option<&SessionContext>,
    ) -> Result<(), ProfileRejection> {
        let model = &self.device_model;

        // external constraints are read-only from the OCPP path
        if profile.charging_profile_purpose
            == ChargingProfilePurpose::ChargingStationExternalConstraints
            && source == ProfileSource::Ocpp
        {
            return Err(ProfileRejection::new(
                "UnsupportedPurpose",
                "ChargingStationExternalConstraints cannot be set via OCPP",
            ));
        }
        if profile.charging_profile_purpose == ChargingProfilePurpose::ChargePointMaxProfile
            && evse_id != 0
        {
            return Err(ProfileRejection::new(
                "InvalidEvse",
                "ChargePointMaxProfile must target EVSE 0",
            ));
        }

        // stack level and store capacity
        let max_stack = model
            .get_int(&variables::CHARGE_PROFILE_MAX_STACK_LEVEL)
            .unwrap_or(10);
        if profile.stack_level < 0 || i64::from(profile.stack_level) > max_stack {
            return Err(ProfileRejection::new(
                "StackLevelOutOfRange",
                format!("stack level {} exceeds maximum {}", profile.stack_level, max_stack),
            ));
        }
        let max_installed = model
            .get_int(&variables::MAX_CHARGING_PROFILES_INSTALLED)
            .unwrap_or(500);
        {
            let profiles = self.profiles.lock().unwrap();
            if !profiles.contains_key(&profile.id) && profiles.len() as i64 >= max_installed {
                return Err(ProfileRejection::new(
                    "TooManyProfiles",
                    format!("{} profiles already installed", profiles.len()),
                ));
            }
        }

        // schedule period invariants
        let periods = &profile.charging_schedule.charging_schedule_period;
        if periods.is_empty() {
            return Err(ProfileRejection::new("InvalidSchedule", "no schedule periods"));
        }
        if periods[0].start_period != 0 {
            return Err(ProfileRejection::new(
                "InvalidSchedule",
                "first period must start at 0",
            ));
        }
        for pair in periods.windows(2) {
            if pair[0].start_period >= pair[1].start_period {
                return Err(ProfileRejection::new(
                    "InvalidSchedule",
                    "periods must be strictly increasing",
                ));
            }
        }

        // per-kind requirements
        match profile.charging_profile_kind {
            ChargingProfileKind::Absolute => {
                if profile.charging_schedule.start_schedule.is_none() {
                    return Err(ProfileRejection::new(
                        "MissingStartSchedule",
                        "Absolute profile requires startSchedule",
                    ));
                }
            }
            ChargingProfileKind::Recurring => {
                if profile.recurrency_kind.is_none()
                    || profile.charging_schedule.start_schedule.is_none()
                {
                    return Err(ProfileRejection::new(
                        "MissingRecurrencyKind",
                        "Recurring profile requires recurrencyKind and startSchedule",
                    ));
                }
            }
            ChargingProfileKind::Relative | ChargingProfileKind::Dynamic => {}
        }

        // TxProfile must reference the live transaction on this EVSE
        if profile.charging_profile_purpose == ChargingProfilePurpose::TxProfile {
            let Some(tx_id) = &profile.transaction_id else {
                return Err(ProfileRejection::new(
                    "TxProfileWithoutTransaction",
                    "TxProfile requires a transactionId",
                ));
            };
            match active_session {
                Some(session) if session.transaction_id == *tx_id => {}
                Some(_) => {
                    return Err(ProfileRejection::new(
                        "TxProfileTransactionMismatch",
                        format!("no transaction {} on EVSE {}", tx_id, evse_id),
                    ));
                }
                None => {
                    return Err(ProfileRejection::new(
                        "TxProfileWithoutTransaction",
                        format!("no active transaction on EVSE {}", evse_id),
                    ));
                }
            }
        }

        // rate unit supported by the station
        let supported_units = model
            .get_option_list(&variables::CHARGING_SCHEDULE_RATE_UNIT)
            .unwrap_or_else(|| vec!["A".to_string(), "W".to_string()]);
        let unit = profile.charging_schedule.charging_rate_unit.as_str();
        if !supported_units.iter().any(|u| u == unit) {
            return Err(ProfileRejection::new(
                "UnsupportedRateUnit",
                format!("unit {} not in {:?}", unit, supported_units),
            ));
        }

        // OCPP 2.1 features are each gated on a device-model variable
        let gate = |cv, feature: &str| -> Result<(), ProfileRejection> {
            if model.get_bool(cv).unwrap_or(false) {
                Ok(())
            } else {
                Err(ProfileRejection::new(
                    "UnsupportedFeature",
                    format!("{} is not supported by this station", feature),
                ))
            }
        };
        if profile.charging_profile_kind == ChargingProfileKind::Dynamic {
            gate(&variables::SUPPORTS_DYNAMIC_PROFILES, "Dynamic profiles")?;
        }
        if profile.charging_schedule.use_local_time.unwrap_or(false) {
            gate(&variables::SUPPORTS_USE_LOCAL_TIME, "useLocalTime")?;
        }
        if profile.charging_schedule.randomized_delay.is_some() {
            gate(&variables::SUPPORTS_RANDOMIZED_DELAY, "randomizedDelay")?;
        }
        if profile.charging_schedule.limit_at_soc.is_some() {
            gate(&variables::SUPPORTS_LIMIT_AT_SOC, "limitAtSoC")?;
        }
        if periods.iter().any(|p| p.evse_sleep.unwrap_or(false)) {
            gate(&variables::SUPPORTS_EVSE_SLEEP, "evseSleep")?;
        }
        if profile.charging_profile_purpose == ChargingProfilePurpose::PriorityCharging {
            gate(&variables::SUPPORTS_PRIORITY_CHARGING, "PriorityCharging")?;
        }
        if profile.charging_profile_purpose == ChargingProfilePurpose::LocalGeneration {
            gate(&variables::SUPPORTS_LOCAL_GENERATION, "LocalGeneration")?;
        }

        if source == ProfileSource::Ocpp {
            // insertion rate limit
            let rate_limit_ms = model
                .get_int(&variables::PROFILE_UPDATE_RATE_LIMIT)
                .unwrap_or(0);
            if rate_limit_ms > 0 {
                let last = *self.last_accepted_insert.lock().unwrap();
                if let Some(last) = last {
                    if last.elapsed().as_millis() < rate_limit_ms as u128 {
                        return Err(ProfileRejection::new(
                            "ChargingProfileRateLimitExceeded",
                            format!("previous accepted insert less than {}ms ago", rate_limit_ms),
                        ));
                    }
                }
            }
            // ids at or below the external-constraints ceiling are reserved
            let max_external = model
                .get_int(&variables::MAX_EXTERNAL_CONSTRAINTS_ID)
                .unwrap_or(0);
            if i64::from(profile.id) <= max_external {
                return Err(ProfileRejection::new(
                    "InvalidProfileId",
                    format!("profile id must be greater than {}", max_external),
                ));
            }
        }

        Ok(())
    }

    // ── Clearing & reporting ───────────────────────────────

    /// Remove matching profiles from the store and the database.
    pub async fn clear_profiles(&self, filter: &ProfileFilter) -> u64 {
        let removed_ids: Vec<i32> = {
            let profiles = self.profiles.lock().unwrap();
            profiles
                .values()
                .filter(|p| Self::matches(p, filter))
                .map(|p| p.profile.id)
                .collect()
        };
        if removed_ids.is_empty() {
            return 0;
        }
        for id in &removed_ids {
            let _ = self
                .db
                .delete_profiles(&ProfileFilter {
                    profile_id: Some(*id),
                    ..Default::default()
                })
                .await;
        }
        let mut profiles = self.profiles.lock().unwrap();
        for id in &removed_ids {
            profiles.remove(id);
        }
        info!(count = removed_ids.len(), "Cleared charging profiles");
        removed_ids.len() as u64
    }

    /// Profiles matching the filter, tagged with source and EVSE.
    pub fn get_reported_profiles(&self, filter: &ProfileFilter) -> Vec<StoredProfile> {
        let profiles = self.profiles.lock().unwrap();
        let mut out: Vec<StoredProfile> = profiles
            .values()
            .filter(|p| Self::matches(p, filter))
            .cloned()
            .collect();
        out.sort_by_key(|p| p.profile.id);
        out
    }

    /// A transaction ended: its TxProfiles are no longer meaningful.
    pub async fn on_transaction_finished(&self, transaction_id: &str) {
        let cleared = self
            .clear_profiles(&ProfileFilter {
                purpose: Some(ChargingProfilePurpose::TxProfile),
                transaction_id: Some(transaction_id.to_string()),
                ..Default::default()
            })
            .await;
        if cleared > 0 {
            info!(transaction_id, cleared, "Removed TxProfiles of finished transaction");
        }
    }

    fn matches(stored: &StoredProfile, filter: &ProfileFilter) -> bool {
        if let Some(id) = filter.profile_id {
            if stored.profile.id != id {
                return false;
            }
        }
        if let Some(evse_id) = filter.evse_id {
            if stored.evse_id != evse_id {
                return false;
            }
        }
        if let Some(purpose) = filter.purpose {
            if stored.profile.charging_profile_purpose != purpose {
                return false;
            }
        }
        if let Some(level) = filter.stack_level {
            if stored.profile.stack_level != level {
                return false;
            }
        }
        if let Some(ref tx) = filter.transaction_id {
            if stored.profile.transaction_id.as_ref() != Some(tx) {
                return false;
            }
        }
        true
    }

    // ── Composite schedule ─────────────────────────────────

    /// Compute the effective limit schedule for `evse_id` over
    /// `[start, end)` in `unit`.
    pub fn get_composite_schedule(
        &self,
        evse_id: i32,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        unit: ChargingRateUnit,
        session: Option<&SessionContext>,
    ) -> CompositeSchedule {
        let defaults = self.defaults();
        let snapshot: Vec<StoredProfile> = {
            let profiles = self.profiles.lock().unwrap();
            profiles.values().cloned().collect()
        };
        let session_start = session.map(|s| s.started_at);

        let mut purposes = PurposeSchedules::default();
        for lane in [
            (
                ChargingProfilePurpose::ChargePointMaxProfile,
                &mut purposes.charge_point_max,
            ),
            (
                ChargingProfilePurpose::ChargingStationExternalConstraints,
                &mut purposes.external_constraints,
            ),
            (
                ChargingProfilePurpose::TxDefaultProfile,
                &mut purposes.tx_default,
            ),
            (ChargingProfilePurpose::TxProfile, &mut purposes.tx),
        ] {
            let (purpose, slot) = lane;
            let mut entries = Vec::new();
            for stored in &snapshot {
                if stored.profile.charging_profile_purpose != purpose {
                    continue;
                }
                // station-wide profiles (EVSE 0) apply everywhere; others
                // only to the queried EVSE
                if stored.evse_id != 0 && stored.evse_id != evse_id {
                    continue;
                }
                if purpose == ChargingProfilePurpose::TxProfile {
                    let matches_session = match (&stored.profile.transaction_id, session) {
                        (Some(tx), Some(s)) => *tx == s.transaction_id,
                        _ => false,
                    };
                    if !matches_session {
                        continue;
                    }
                }
                entries.extend(calculate_profile(
                    start,
                    end,
                    session_start,
                    &stored.profile,
                    &defaults,
                ));
            }
            *slot = composite::resolve_stack_levels(entries, start, end);
        }

        composite::build_composite_schedule(&purposes, evse_id, start, end, unit, &defaults)
    }
}
