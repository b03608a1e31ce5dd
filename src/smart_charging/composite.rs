//! Composite schedule computation
//!
//! Two stages. Within one purpose class, overlapping period entries resolve
//! by highest stack level; uncovered stretches become explicit gaps. Across
//! purpose classes, the effective limit at each instant is the minimum of
//! the contributing limits expressed in the query's rate unit, with
//! TxProfile overriding TxDefaultProfile and the station-wide caps applied
//! on top. Unit conversion between A and W uses the supply voltage times
//! the number of phases in effect at that instant.

use chrono::{DateTime, Utc};

use crate::domain::{ChargingRateUnit, CompositePeriod, CompositeSchedule};

use super::period::{PeriodEntry, ScheduleDefaults};

/// One resolved stretch of a single purpose class. `limit` is `None` in
/// gaps where no entry of the class covers the instant.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct IntermediatePeriod {
    pub start_offset: i64,
    pub limit: Option<f64>,
    pub unit: ChargingRateUnit,
    pub number_phases: Option<i32>,
    pub phase_to_use: Option<i32>,
}

/// Stack-resolved profiles per purpose class, input to [`combine`].
#[derive(Debug, Default)]
pub(crate) struct PurposeSchedules {
    pub charge_point_max: Vec<IntermediatePeriod>,
    pub external_constraints: Vec<IntermediatePeriod>,
    pub tx_default: Vec<IntermediatePeriod>,
    pub tx: Vec<IntermediatePeriod>,
}

/// Resolve overlapping entries of one purpose class into a gap-aware
/// piecewise schedule over `[now, end)`. The entry with the highest stack
/// level covering an instant wins.
pub(crate) fn resolve_stack_levels(
    mut entries: Vec<PeriodEntry>,
    now: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<IntermediatePeriod> {
    let mut resolved = Vec::new();
    if entries.is_empty() {
        return resolved;
    }
    // highest stack level first; the scan below then prefers it naturally
    entries.sort_by(|a, b| b.stack_level.cmp(&a.stack_level));

    let mut current = now;
    while current < end {
        let mut earliest = end;
        let mut next_earliest = end;
        let mut chosen: Option<&PeriodEntry> = None;

        for entry in &entries {
            if entry.start <= earliest && entry.end > current {
                next_earliest = earliest;
                earliest = entry.start;
                chosen = Some(entry);
                if earliest <= current {
                    break;
                }
            }
        }

        match chosen {
            Some(entry) if earliest <= current => {
                resolved.push(IntermediatePeriod {
                    start_offset: (current - now).num_seconds(),
                    limit: Some(entry.limit),
                    unit: entry.rate_unit,
                    number_phases: entry.number_phases,
                    phase_to_use: entry.phase_to_use,
                });
                current = entry.end.min(next_earliest);
            }
            _ => {
                // gap until the next entry begins (or the window ends)
                resolved.push(IntermediatePeriod {
                    start_offset: (current - now).num_seconds(),
                    limit: None,
                    unit: ChargingRateUnit::A,
                    number_phases: None,
                    phase_to_use: None,
                });
                current = earliest;
            }
        }
    }
    resolved
}

fn convert_limit(
    limit: f64,
    from: ChargingRateUnit,
    to: ChargingRateUnit,
    phases: i32,
    supply_voltage: f64,
) -> f64 {
    match (from, to) {
        (ChargingRateUnit::A, ChargingRateUnit::W) => limit * supply_voltage * f64::from(phases),
        (ChargingRateUnit::W, ChargingRateUnit::A) => limit / (supply_voltage * f64::from(phases)),
        _ => limit,
    }
}

/// Value of a piecewise schedule at `offset`: the last period starting at
/// or before it.
fn at_offset(profile: &[IntermediatePeriod], offset: i64) -> Option<&IntermediatePeriod> {
    profile
        .iter()
        .take_while(|p| p.start_offset <= offset)
        .last()
}

struct Contribution {
    limit: f64,
    phases: i32,
    phase_to_use: Option<i32>,
}

fn contribution(
    profile: &[IntermediatePeriod],
    offset: i64,
    unit: ChargingRateUnit,
    defaults: &ScheduleDefaults,
) -> Option<Contribution> {
    let period = at_offset(profile, offset)?;
    let limit = period.limit?;
    let phases = period.number_phases.unwrap_or(defaults.number_phases);
    Some(Contribution {
        limit: convert_limit(limit, period.unit, unit, phases, defaults.supply_voltage),
        phases,
        phase_to_use: period.phase_to_use,
    })
}

/// Combine the purpose classes over `[0, duration_s)` into the final
/// composite schedule periods.
pub(crate) fn combine(
    purposes: &PurposeSchedules,
    duration_s: i64,
    unit: ChargingRateUnit,
    defaults: &ScheduleDefaults,
) -> Vec<CompositePeriod> {
    let mut breakpoints: Vec<i64> = vec![0];
    for profile in [
        &purposes.charge_point_max,
        &purposes.external_constraints,
        &purposes.tx_default,
        &purposes.tx,
    ] {
        breakpoints.extend(
            profile
                .iter()
                .map(|p| p.start_offset)
                .filter(|&o| o > 0 && o < duration_s),
        );
    }
    breakpoints.sort_unstable();
    breakpoints.dedup();

    let mut out: Vec<CompositePeriod> = Vec::new();
    for offset in breakpoints {
        // TxProfile overrides TxDefaultProfile at the same instant
        let base = contribution(&purposes.tx, offset, unit, defaults)
            .or_else(|| contribution(&purposes.tx_default, offset, unit, defaults));

        let mut effective = base;
        for cap_profile in [&purposes.charge_point_max, &purposes.external_constraints] {
            let Some(cap) = contribution(cap_profile, offset, unit, defaults) else {
                continue;
            };
            effective = Some(match effective {
                None => cap,
                Some(current) => {
                    let phases = current.phases.min(cap.phases);
                    let limit = match unit {
                        // per-phase limit: plain minimum
                        ChargingRateUnit::A => current.limit.min(cap.limit),
                        // total power: compare per phase, then re-total on
                        // the merged phase count
                        ChargingRateUnit::W => {
                            let current_per_phase = current.limit / f64::from(current.phases);
                            let cap_per_phase = cap.limit / f64::from(cap.phases);
                            (current_per_phase.min(cap_per_phase) * f64::from(phases)).floor()
                        }
                    };
                    Contribution {
                        limit,
                        phases,
                        phase_to_use: current.phase_to_use,
                    }
                }
            });
        }

        let (limit, phases, phase_to_use) = match effective {
            Some(c) => (c.limit, c.phases, c.phase_to_use),
            // no purpose class constrains this instant: station default
            None => (defaults.limit_for(unit), defaults.number_phases, None),
        };

        let period = CompositePeriod {
            start_period: offset as i32,
            limit,
            number_phases: Some(phases),
            phase_to_use,
        };
        let duplicate = out
            .last()
            .map(|last| last.limit == period.limit && last.number_phases == period.number_phases)
            .unwrap_or(false);
        if !duplicate {
            out.push(period);
        }
    }
    out
}

/// Assemble the full result for a query window.
pub(crate) fn build_composite_schedule(
    purposes: &PurposeSchedules,
    evse_id: i32,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    unit: ChargingRateUnit,
    defaults: &ScheduleDefaults,
) -> CompositeSchedule {
    let duration = (end - start).num_seconds().max(0);
    CompositeSchedule {
        evse_id,
        duration: duration as i32,
        schedule_start: start,
        charging_rate_unit: unit,
        charging_schedule_period: combine(purposes, duration, unit, defaults),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const DEFAULTS: ScheduleDefaults = ScheduleDefaults {
        limit_amps: 48.0,
        limit_watts: 33120.0,
        number_phases: 3,
        supply_voltage: 230.0,
    };

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 8, 0, 0).unwrap()
    }

    fn entry(start_s: i64, end_s: i64, limit: f64, stack: i32) -> PeriodEntry {
        PeriodEntry {
            start: t0() + chrono::Duration::seconds(start_s),
            end: t0() + chrono::Duration::seconds(end_s),
            limit,
            number_phases: None,
            phase_to_use: None,
            stack_level: stack,
            rate_unit: ChargingRateUnit::A,
            min_charging_rate: None,
        }
    }

    #[test]
    fn higher_stack_level_wins_while_active() {
        let resolved = resolve_stack_levels(
            vec![entry(0, 3600, 32.0, 1), entry(600, 1200, 16.0, 2)],
            t0(),
            t0() + chrono::Duration::seconds(1800),
        );
        let limits: Vec<(i64, Option<f64>)> =
            resolved.iter().map(|p| (p.start_offset, p.limit)).collect();
        assert_eq!(
            limits,
            vec![(0, Some(32.0)), (600, Some(16.0)), (1200, Some(32.0))]
        );
    }

    #[test]
    fn uncovered_stretch_becomes_gap() {
        let resolved = resolve_stack_levels(
            vec![entry(600, 1200, 16.0, 0)],
            t0(),
            t0() + chrono::Duration::seconds(1800),
        );
        assert_eq!(resolved.len(), 3);
        assert_eq!(resolved[0].limit, None);
        assert_eq!(resolved[1].limit, Some(16.0));
        assert_eq!(resolved[2].limit, None);
        assert_eq!(resolved[2].start_offset, 1200);
    }

    #[test]
    fn tx_overrides_tx_default_and_cap_applies() {
        let purposes = PurposeSchedules {
            charge_point_max: vec![IntermediatePeriod {
                start_offset: 0,
                limit: Some(20.0),
                unit: ChargingRateUnit::A,
                number_phases: None,
                phase_to_use: None,
            }],
            external_constraints: Vec::new(),
            tx_default: vec![IntermediatePeriod {
                start_offset: 0,
                limit: Some(32.0),
                unit: ChargingRateUnit::A,
                number_phases: None,
                phase_to_use: None,
            }],
            tx: vec![
                IntermediatePeriod {
                    start_offset: 0,
                    limit: None,
                    unit: ChargingRateUnit::A,
                    number_phases: None,
                    phase_to_use: None,
                },
                IntermediatePeriod {
                    start_offset: 600,
                    limit: Some(16.0),
                    unit: ChargingRateUnit::A,
                    number_phases: None,
                    phase_to_use: None,
                },
            ],
        };
        let periods = combine(&purposes, 1200, ChargingRateUnit::A, &DEFAULTS);
        // [0,600): default 32 capped to 20; [600,1200): tx 16
        assert_eq!(periods.len(), 2);
        assert_eq!(periods[0].start_period, 0);
        assert_eq!(periods[0].limit, 20.0);
        assert_eq!(periods[1].start_period, 600);
        assert_eq!(periods[1].limit, 16.0);
    }

    #[test]
    fn unit_conversion_between_amps_and_watts() {
        let purposes = PurposeSchedules {
            tx_default: vec![IntermediatePeriod {
                start_offset: 0,
                limit: Some(16.0),
                unit: ChargingRateUnit::A,
                number_phases: Some(3),
                phase_to_use: None,
            }],
            ..Default::default()
        };
        let periods = combine(&purposes, 600, ChargingRateUnit::W, &DEFAULTS);
        assert_eq!(periods.len(), 1);
        assert_eq!(periods[0].limit, 16.0 * 230.0 * 3.0);
    }

    #[test]
    fn phase_count_minimum_across_sources() {
        let purposes = PurposeSchedules {
            charge_point_max: vec![IntermediatePeriod {
                start_offset: 0,
                limit: Some(100.0),
                unit: ChargingRateUnit::A,
                number_phases: Some(1),
                phase_to_use: None,
            }],
            tx_default: vec![IntermediatePeriod {
                start_offset: 0,
                limit: Some(16.0),
                unit: ChargingRateUnit::A,
                number_phases: Some(3),
                phase_to_use: None,
            }],
            ..Default::default()
        };
        let periods = combine(&purposes, 600, ChargingRateUnit::A, &DEFAULTS);
        assert_eq!(periods[0].number_phases, Some(1));
        assert_eq!(periods[0].limit, 16.0);
    }

    #[test]
    fn no_constraint_resolves_to_station_default() {
        let purposes = PurposeSchedules::default();
        let periods = combine(&purposes, 600, ChargingRateUnit::A, &DEFAULTS);
        assert_eq!(periods.len(), 1);
        assert_eq!(periods[0].limit, DEFAULTS.limit_amps);
        assert_eq!(periods[0].number_phases, Some(3));
    }

    #[test]
    fn consecutive_identical_periods_merge() {
        let purposes = PurposeSchedules {
            tx_default: vec![
                IntermediatePeriod {
                    start_offset: 0,
                    limit: Some(16.0),
                    unit: ChargingRateUnit::A,
                    number_phases: None,
                    phase_to_use: None,
                },
                IntermediatePeriod {
                    start_offset: 300,
                    limit: Some(16.0),
                    unit: ChargingRateUnit::A,
                    number_phases: None,
                    phase_to_use: None,
                },
            ],
            ..Default::default()
        };
        let periods = combine(&purposes, 600, ChargingRateUnit::A, &DEFAULTS);
        assert_eq!(periods.len(), 1);
    }
}
