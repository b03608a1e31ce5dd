//! Occurrence expansion
//!
//! Expands one charging profile into period entries with absolute start and
//! end instants over a query window. Absolute schedules anchor at their
//! startSchedule, Relative schedules at the session start (or now), and
//! Recurring schedules at every daily/weekly occurrence touching the
//! window. Gaps between occurrences are valid and filled downstream.

use chrono::{DateTime, Duration, DurationRound, Utc};
use tracing::warn;

use crate::domain::{
    ChargingProfile, ChargingProfileKind, ChargingRateUnit, RecurrencyKind,
};

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;
const SECONDS_PER_WEEK: i64 = 7 * SECONDS_PER_DAY;

/// Unit defaults applied when a period carries no explicit limit.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleDefaults {
    pub limit_amps: f64,
    pub limit_watts: f64,
    pub number_phases: i32,
    pub supply_voltage: f64,
}

impl ScheduleDefaults {
    pub fn limit_for(&self, unit: ChargingRateUnit) -> f64 {
        match unit {
            ChargingRateUnit::A => self.limit_amps,
            ChargingRateUnit::W => self.limit_watts,
        }
    }
}

/// One profile period pinned to absolute time.
#[derive(Debug, Clone, PartialEq)]
pub struct PeriodEntry {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Limit in `rate_unit`.
    pub limit: f64,
    pub number_phases: Option<i32>,
    pub phase_to_use: Option<i32>,
    pub stack_level: i32,
    pub rate_unit: ChargingRateUnit,
    pub min_charging_rate: Option<f64>,
}

fn floor_seconds(t: DateTime<Utc>) -> DateTime<Utc> {
    t.duration_trunc(Duration::seconds(1)).unwrap_or(t)
}

/// Start instants of the profile's occurrences within `[now - cycle, end]`.
pub fn calculate_start(
    now: DateTime<Utc>,
    end: DateTime<Utc>,
    session_start: Option<DateTime<Utc>>,
    profile: &ChargingProfile,
) -> Vec<DateTime<Utc>> {
    let schedule = &profile.charging_schedule;
    let fallback = floor_seconds(now);

    match profile.charging_profile_kind {
        ChargingProfileKind::Absolute => {
            let start = schedule
                .start_schedule
                .or(profile.valid_from)
                .unwrap_or(fallback);
            vec![floor_seconds(start)]
        }
        ChargingProfileKind::Relative => {
            vec![floor_seconds(session_start.unwrap_or(now))]
        }
        ChargingProfileKind::Dynamic => vec![fallback],
        ChargingProfileKind::Recurring => {
            let (Some(recurrency), Some(start_schedule)) =
                (profile.recurrency_kind, schedule.start_schedule)
            else {
                warn!(profile_id = profile.id, "Recurring profile without recurrency/startSchedule");
                return Vec::new();
            };
            let cycle = match recurrency {
                RecurrencyKind::Daily => SECONDS_PER_DAY,
                RecurrencyKind::Weekly => SECONDS_PER_WEEK,
            };
            let start_schedule = floor_seconds(start_schedule);
            // the occurrence containing `now` may have started up to one
            // full cycle ago
            let mut behind = (fallback - start_schedule).num_seconds() % cycle;
            if behind < 0 {
                behind += cycle;
            }
            let mut occurrence = fallback - Duration::seconds(behind);
            let end = floor_seconds(end);
            let mut starts = Vec::new();
            while occurrence <= end {
                starts.push(occurrence);
                occurrence += Duration::seconds(cycle);
            }
            starts
        }
    }
}

/// Expand one schedule period of the profile into entries, one per
/// occurrence. A period lasts until the soonest of: the next period, the
/// schedule duration, the next occurrence, and validTo.
pub fn calculate_profile_entry(
    now: DateTime<Utc>,
    end: DateTime<Utc>,
    session_start: Option<DateTime<Utc>>,
    profile: &ChargingProfile,
    period_index: usize,
    defaults: &ScheduleDefaults,
) -> Vec<PeriodEntry> {
    let schedule = &profile.charging_schedule;
    let periods = &schedule.charging_schedule_period;
    let Some(this_period) = periods.get(period_index) else {
        warn!(profile_id = profile.id, period_index, "Period index out of range");
        return Vec::new();
    };

    // invariants re-checked defensively: first period starts at 0 and
    // periods strictly increase
    if period_index == 0 && this_period.start_period != 0 {
        warn!(profile_id = profile.id, "First schedule period does not start at 0");
        return Vec::new();
    }
    if period_index > 0 && periods[period_index - 1].start_period >= this_period.start_period {
        warn!(profile_id = profile.id, period_index, "Schedule periods not strictly increasing");
        return Vec::new();
    }

    let starts = calculate_start(now, end, session_start, profile);
    let now = floor_seconds(now);
    let mut entries = Vec::new();

    for (occurrence_index, occurrence_start) in starts.iter().copied().enumerate() {
        let mut duration = i64::MAX;

        if let Some(next_period) = periods.get(period_index + 1) {
            duration = i64::from(next_period.start_period);
        }
        if let Some(schedule_duration) = schedule.duration {
            duration = duration.min(i64::from(schedule_duration));
        }
        if let Some(next_occurrence) = starts.get(occurrence_index + 1) {
            duration = duration.min((*next_occurrence - occurrence_start).num_seconds());
        }
        if let Some(valid_to) = profile.valid_to {
            duration = duration.min((floor_seconds(valid_to) - occurrence_start).num_seconds());
        }

        let mut entry_start = occurrence_start + Duration::seconds(i64::from(this_period.start_period));
        let entry_end = if duration == i64::MAX {
            // open-ended; the composition loop clips to the query window
            occurrence_start + Duration::days(365 * 100)
        } else {
            occurrence_start + Duration::seconds(duration)
        };

        // clip the start to validFrom; discard when nothing remains
        if let Some(valid_from) = profile.valid_from {
            let valid_from = floor_seconds(valid_from);
            if valid_from > entry_start {
                if valid_from >= entry_end {
                    continue;
                }
                entry_start = valid_from;
            }
        }
        if entry_end <= entry_start || entry_end <= now {
            continue;
        }

        let unit = schedule.charging_rate_unit;
        entries.push(PeriodEntry {
            start: entry_start,
            end: entry_end,
            limit: this_period.limit.unwrap_or_else(|| defaults.limit_for(unit)),
            number_phases: this_period.number_phases,
            phase_to_use: this_period.phase_to_use,
            stack_level: profile.stack_level,
            rate_unit: unit,
            min_charging_rate: schedule.min_charging_rate,
        });
    }
    entries
}

/// All period entries of a profile within the window, sorted by start.
pub fn calculate_profile(
    now: DateTime<Utc>,
    end: DateTime<Utc>,
    session_start: Option<DateTime<Utc>>,
    profile: &ChargingProfile,
    defaults: &ScheduleDefaults,
) -> Vec<PeriodEntry> {
    let mut entries = Vec::new();
    for index in 0..profile.charging_schedule.charging_schedule_period.len() {
        for entry in calculate_profile_entry(now, end, session_start, profile, index, defaults) {
            if entry.start <= end {
                entries.push(entry);
            }
        }
    }
    entries.sort_by_key(|e| e.start);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChargingProfilePurpose, ChargingSchedule, ChargingSchedulePeriod};
    use chrono::TimeZone;

    const DEFAULTS: ScheduleDefaults = ScheduleDefaults {
        limit_amps: 48.0,
        limit_watts: 33120.0,
        number_phases: 3,
        supply_voltage: 230.0,
    };

    fn t(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, h, m, s).unwrap()
    }

    fn absolute_profile(start: DateTime<Utc>, periods: Vec<ChargingSchedulePeriod>) -> ChargingProfile {
        let mut schedule = ChargingSchedule::new(ChargingRateUnit::A, periods);
        schedule.start_schedule = Some(start);
        ChargingProfile {
            id: 1,
            stack_level: 0,
            charging_profile_purpose: ChargingProfilePurpose::TxDefaultProfile,
            charging_profile_kind: ChargingProfileKind::Absolute,
            recurrency_kind: None,
            valid_from: None,
            valid_to: None,
            transaction_id: None,
            charging_schedule: schedule,
        }
    }

    #[test]
    fn absolute_single_occurrence() {
        let profile = absolute_profile(
            t(8, 0, 0),
            vec![
                ChargingSchedulePeriod::new(0, 16.0),
                ChargingSchedulePeriod::new(3600, 32.0),
            ],
        );
        let entries = calculate_profile(t(8, 30, 0), t(12, 0, 0), None, &profile, &DEFAULTS);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].start, t(8, 0, 0));
        assert_eq!(entries[0].end, t(9, 0, 0));
        assert_eq!(entries[0].limit, 16.0);
        assert_eq!(entries[1].start, t(9, 0, 0));
        assert_eq!(entries[1].limit, 32.0);
    }

    #[test]
    fn relative_anchors_at_session_start() {
        let mut profile = absolute_profile(t(0, 0, 0), vec![ChargingSchedulePeriod::new(0, 10.0)]);
        profile.charging_profile_kind = ChargingProfileKind::Relative;
        profile.charging_schedule.start_schedule = None;
        profile.charging_schedule.duration = Some(1800);

        let entries = calculate_profile(
            t(9, 0, 0),
            t(12, 0, 0),
            Some(t(8, 45, 0)),
            &profile,
            &DEFAULTS,
        );
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].start, t(8, 45, 0));
        assert_eq!(entries[0].end, t(9, 15, 0));
    }

    #[test]
    fn recurring_daily_generates_each_day() {
        let mut profile = absolute_profile(
            Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap(),
            vec![ChargingSchedulePeriod::new(0, 20.0)],
        );
        profile.charging_profile_kind = ChargingProfileKind::Recurring;
        profile.recurrency_kind = Some(RecurrencyKind::Daily);
        profile.charging_schedule.duration = Some(3600);

        // window spans two days; the occurrence active "yesterday" ended
        let entries = calculate_profile(
            t(9, 0, 0),
            Utc.with_ymd_and_hms(2025, 3, 11, 12, 0, 0).unwrap(),
            None,
            &profile,
            &DEFAULTS,
        );
        // 2025-03-10 08:00 occurrence already over by 09:00 (duration 1h)
        // => only 2025-03-11 08:00 remains
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].start,
            Utc.with_ymd_and_hms(2025, 3, 11, 8, 0, 0).unwrap()
        );
        assert_eq!(
            entries[0].end,
            Utc.with_ymd_and_hms(2025, 3, 11, 9, 0, 0).unwrap()
        );
    }

    #[test]
    fn recurring_occurrence_covering_now_is_kept() {
        let mut profile = absolute_profile(
            Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap(),
            vec![ChargingSchedulePeriod::new(0, 20.0)],
        );
        profile.charging_profile_kind = ChargingProfileKind::Recurring;
        profile.recurrency_kind = Some(RecurrencyKind::Daily);
        profile.charging_schedule.duration = Some(7200);

        let entries = calculate_profile(t(9, 0, 0), t(10, 0, 0), None, &profile, &DEFAULTS);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].start, t(8, 0, 0));
        assert_eq!(entries[0].end, t(10, 0, 0));
    }

    #[test]
    fn valid_from_clips_and_discards() {
        let mut profile = absolute_profile(
            t(8, 0, 0),
            vec![
                ChargingSchedulePeriod::new(0, 16.0),
                ChargingSchedulePeriod::new(600, 24.0),
            ],
        );
        profile.valid_from = Some(t(8, 10, 0));

        let entries = calculate_profile(t(8, 0, 0), t(12, 0, 0), None, &profile, &DEFAULTS);
        // first period [08:00, 08:10) is entirely before validFrom
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].start, t(8, 10, 0));
        assert_eq!(entries[0].limit, 24.0);
    }

    #[test]
    fn expired_entries_discarded() {
        let profile = absolute_profile(
            t(6, 0, 0),
            vec![ChargingSchedulePeriod::new(0, 16.0)],
        );
        let mut profile = profile;
        profile.valid_to = Some(t(7, 0, 0));
        let entries = calculate_profile(t(8, 0, 0), t(12, 0, 0), None, &profile, &DEFAULTS);
        assert!(entries.is_empty());
    }

    #[test]
    fn default_limit_applied_when_period_has_none() {
        let mut period = ChargingSchedulePeriod::new(0, 0.0);
        period.limit = None;
        let profile = absolute_profile(t(8, 0, 0), vec![period]);
        let entries = calculate_profile(t(8, 0, 0), t(9, 0, 0), None, &profile, &DEFAULTS);
        assert_eq!(entries[0].limit, DEFAULTS.limit_amps);
    }
}
