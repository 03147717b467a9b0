//! Hysteresis state machines for alarm status and fan speed requests.
//!
//! Both ladders are ordered lists of guarded rules. Every rule is checked
//! against the state left behind by the rule before it, so one reading can
//! walk several levels in a single call (e.g. `normal` straight up to
//! `emergency`). The functions here are pure: no I/O, no logging.

use serde::{Deserialize, Serialize};

use crate::{
    catalog::{AlarmThresholds, FanThresholds, SensorDescriptor},
    model::{FanSpeed, MILLI_DEGREES, SensorStatus, ThermalState},
};

/// Comparison a rule applies between the reading and its threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    /// reading <= threshold
    AtMost,
    /// reading > threshold
    Above,
    /// reading >= threshold
    AtLeast,
}

impl Guard {
    fn holds(self, reading: f64, threshold: f64) -> bool {
        match self {
            Guard::AtMost => reading <= threshold,
            Guard::Above => reading > threshold,
            Guard::AtLeast => reading >= threshold,
        }
    }
}

/// Alarm threshold a rule compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmBound {
    EmergencyOn,
    EmergencyOff,
    CriticalOn,
    CriticalOff,
    MaxOn,
    MaxOff,
    Min,
    LowCrit,
}

impl AlarmThresholds {
    pub fn bound(&self, bound: AlarmBound) -> f64 {
        match bound {
            AlarmBound::EmergencyOn => self.emergency_on,
            AlarmBound::EmergencyOff => self.emergency_off,
            AlarmBound::CriticalOn => self.critical_on,
            AlarmBound::CriticalOff => self.critical_off,
            AlarmBound::MaxOn => self.max_on,
            AlarmBound::MaxOff => self.max_off,
            AlarmBound::Min => self.min,
            AlarmBound::LowCrit => self.low_crit,
        }
    }
}

/// Fan threshold a rule compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanBound {
    MaxOn,
    MaxOff,
    FastOn,
    FastOff,
    MediumOn,
    MediumOff,
}

impl FanThresholds {
    pub fn bound(&self, bound: FanBound) -> f64 {
        match bound {
            FanBound::MaxOn => self.max_on,
            FanBound::MaxOff => self.max_off,
            FanBound::FastOn => self.fast_on,
            FanBound::FastOff => self.fast_off,
            FanBound::MediumOn => self.medium_on,
            FanBound::MediumOff => self.medium_off,
        }
    }
}

/// `from --[reading guard bound]--> to`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rule<S, B> {
    pub from: S,
    pub guard: Guard,
    pub bound: B,
    pub to: S,
}

const fn rule<S, B>(from: S, guard: Guard, bound: B, to: S) -> Rule<S, B> {
    Rule {
        from,
        guard,
        bound,
        to,
    }
}

pub type AlarmRule = Rule<SensorStatus, AlarmBound>;
pub type FanRule = Rule<FanSpeed, FanBound>;

use AlarmBound as A;
use SensorStatus as S;

/// Alarm ladder exactly as deployed. Rule 4 (`normal` above `low_crit`
/// moves to `min`) fires on a rising reading and has no way out of
/// `low_critical`; kept as is until the intended rule is confirmed.
pub const LITERAL_ALARM_RULES: [AlarmRule; 10] = [
    rule(S::Emergency, Guard::AtMost, A::EmergencyOff, S::Critical),
    rule(S::Critical, Guard::AtMost, A::CriticalOff, S::Max),
    rule(S::Max, Guard::AtMost, A::MaxOff, S::Normal),
    rule(S::Normal, Guard::Above, A::LowCrit, S::Min),
    rule(S::Min, Guard::Above, A::Min, S::Normal),
    rule(S::Normal, Guard::AtLeast, A::MaxOn, S::Max),
    rule(S::Max, Guard::AtLeast, A::CriticalOn, S::Critical),
    rule(S::Critical, Guard::AtLeast, A::EmergencyOn, S::Emergency),
    rule(S::Normal, Guard::AtMost, A::Min, S::Min),
    rule(S::Min, Guard::AtMost, A::LowCrit, S::LowCrit),
];

/// Alarm ladder with rule 4 read as `low_critical` recovering to `min`,
/// mirroring the emergency/critical/max recovery rules.
pub const LOW_CRIT_RECOVERY_ALARM_RULES: [AlarmRule; 10] = [
    rule(S::Emergency, Guard::AtMost, A::EmergencyOff, S::Critical),
    rule(S::Critical, Guard::AtMost, A::CriticalOff, S::Max),
    rule(S::Max, Guard::AtMost, A::MaxOff, S::Normal),
    rule(S::LowCrit, Guard::Above, A::LowCrit, S::Min),
    rule(S::Min, Guard::Above, A::Min, S::Normal),
    rule(S::Normal, Guard::AtLeast, A::MaxOn, S::Max),
    rule(S::Max, Guard::AtLeast, A::CriticalOn, S::Critical),
    rule(S::Critical, Guard::AtLeast, A::EmergencyOn, S::Emergency),
    rule(S::Normal, Guard::AtMost, A::Min, S::Min),
    rule(S::Min, Guard::AtMost, A::LowCrit, S::LowCrit),
];

pub const FAN_RULES: [FanRule; 6] = [
    rule(FanSpeed::Normal, Guard::AtLeast, FanBound::MediumOn, FanSpeed::Medium),
    rule(FanSpeed::Medium, Guard::AtLeast, FanBound::FastOn, FanSpeed::Fast),
    rule(FanSpeed::Fast, Guard::AtLeast, FanBound::MaxOn, FanSpeed::Max),
    rule(FanSpeed::Max, Guard::AtMost, FanBound::MaxOff, FanSpeed::Fast),
    rule(FanSpeed::Fast, Guard::AtMost, FanBound::FastOff, FanSpeed::Medium),
    rule(FanSpeed::Medium, Guard::AtMost, FanBound::MediumOff, FanSpeed::Normal),
];

/// Which alarm ladder to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlarmRuleSet {
    #[default]
    Literal,
    LowCritRecovery,
}

impl AlarmRuleSet {
    pub fn rules(self) -> &'static [AlarmRule] {
        match self {
            AlarmRuleSet::Literal => &LITERAL_ALARM_RULES,
            AlarmRuleSet::LowCritRecovery => &LOW_CRIT_RECOVERY_ALARM_RULES,
        }
    }
}

fn cascade<S, B>(mut state: S, rules: &[Rule<S, B>], reading: f64, value: impl Fn(B) -> f64) -> S
where
    S: Copy + PartialEq,
    B: Copy,
{
    for rule in rules {
        if state == rule.from && rule.guard.holds(reading, value(rule.bound)) {
            state = rule.to;
        }
    }
    state
}

/// Converts milli-degrees to the float degrees thresholds are written in.
pub fn to_celsius(temp: i32) -> f64 {
    f64::from(temp) / f64::from(MILLI_DEGREES)
}

pub fn next_status(
    status: SensorStatus,
    temp: i32,
    thresholds: &AlarmThresholds,
    rules: AlarmRuleSet,
) -> SensorStatus {
    cascade(status, rules.rules(), to_celsius(temp), |b| {
        thresholds.bound(b)
    })
}

pub fn next_fan_speed(speed: FanSpeed, temp: i32, thresholds: &FanThresholds) -> FanSpeed {
    cascade(speed, &FAN_RULES, to_celsius(temp), |b| thresholds.bound(b))
}

/// Advances a sensor's thermal state by one reading.
///
/// A `fault` sensor is left untouched. An uninitialized sensor enters the
/// ladder at `normal`. The min/max watermarks widen before any rule runs.
pub fn advance(
    state: ThermalState,
    temp: i32,
    descriptor: &SensorDescriptor,
    rules: AlarmRuleSet,
) -> ThermalState {
    if state.status == SensorStatus::Failed {
        return state;
    }

    let status = match state.status {
        SensorStatus::Uninitialized => SensorStatus::Normal,
        other => other,
    };

    ThermalState {
        status: next_status(status, temp, &descriptor.alarm_thresholds, rules),
        fan_speed: next_fan_speed(state.fan_speed, temp, &descriptor.fan_thresholds),
        min: state.min.min(temp),
        max: state.max.max(temp),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    pub(crate) fn alarm_thresholds() -> AlarmThresholds {
        AlarmThresholds {
            emergency_on: 90.0,
            emergency_off: 85.0,
            critical_on: 75.0,
            critical_off: 70.0,
            max_on: 60.0,
            max_off: 55.0,
            min: 10.0,
            low_crit: 0.0,
        }
    }

    pub(crate) fn fan_thresholds() -> FanThresholds {
        FanThresholds {
            max_on: 70.0,
            max_off: 65.0,
            fast_on: 55.0,
            fast_off: 50.0,
            medium_on: 40.0,
            medium_off: 35.0,
        }
    }

    pub(crate) fn descriptor(number: u32, kind: &str) -> SensorDescriptor {
        SensorDescriptor {
            number,
            location: format!("Board_U{number}"),
            device: format!("Temp{number}"),
            kind: kind.to_string(),
            alarm_thresholds: alarm_thresholds(),
            fan_thresholds: fan_thresholds(),
        }
    }

    fn status_at(from: SensorStatus, celsius: i32) -> SensorStatus {
        next_status(
            from,
            celsius * MILLI_DEGREES,
            &alarm_thresholds(),
            AlarmRuleSet::Literal,
        )
    }

    fn fan_at(from: FanSpeed, celsius: i32) -> FanSpeed {
        next_fan_speed(from, celsius * MILLI_DEGREES, &fan_thresholds())
    }

    #[test]
    fn large_rise_cascades_to_emergency_in_one_reading() {
        assert_eq!(status_at(S::Normal, 95), S::Emergency);
    }

    #[test]
    fn rise_stops_at_each_on_threshold() {
        assert_eq!(status_at(S::Normal, 60), S::Max);
        assert_eq!(status_at(S::Normal, 75), S::Critical);
        assert_eq!(status_at(S::Normal, 89), S::Critical);
        assert_eq!(status_at(S::Normal, 90), S::Emergency);
    }

    #[test]
    fn critical_holds_inside_hysteresis_gap() {
        assert_eq!(status_at(S::Critical, 72), S::Critical);
        assert_eq!(status_at(S::Critical, 70), S::Max);
        assert_eq!(status_at(S::Critical, 69), S::Max);
    }

    #[test]
    fn large_fall_cascades_down_to_normal() {
        assert_eq!(status_at(S::Emergency, 30), S::Normal);
        assert_eq!(status_at(S::Emergency, 86), S::Emergency);
        assert_eq!(status_at(S::Emergency, 85), S::Critical);
    }

    #[test]
    fn cold_reading_walks_down_to_low_critical() {
        assert_eq!(status_at(S::Normal, 10), S::Min);
        assert_eq!(status_at(S::Normal, -5), S::LowCrit);
    }

    #[test]
    fn literal_rule_four_parks_normal_in_min_between_low_crit_and_min() {
        // normal -> min by rule 4, then rule 5 does not fire (5 <= 10)
        assert_eq!(status_at(S::Normal, 5), S::Min);
        // above min, rule 5 undoes rule 4 in the same pass
        assert_eq!(status_at(S::Normal, 30), S::Normal);
    }

    #[test]
    fn literal_ladder_never_leaves_low_critical() {
        assert_eq!(status_at(S::LowCrit, 50), S::LowCrit);
    }

    #[test]
    fn low_crit_recovery_ladder_climbs_out_of_low_critical() {
        let thresholds = alarm_thresholds();
        let recover = |from, celsius: i32| {
            next_status(
                from,
                celsius * MILLI_DEGREES,
                &thresholds,
                AlarmRuleSet::LowCritRecovery,
            )
        };

        assert_eq!(recover(S::LowCrit, 5), S::Min);
        assert_eq!(recover(S::LowCrit, 50), S::Normal);
        assert_eq!(recover(S::LowCrit, 0), S::LowCrit);
        // without literal rule 4, normal does not dip into min above min
        assert_eq!(recover(S::Normal, 30), S::Normal);
        assert_eq!(recover(S::Normal, 5), S::Min);
        assert_eq!(recover(S::Normal, 95), S::Emergency);
    }

    #[test]
    fn thresholds_compare_in_fractional_degrees() {
        let thresholds = alarm_thresholds();
        assert_eq!(
            next_status(S::Normal, 59_500, &thresholds, AlarmRuleSet::Literal),
            S::Normal
        );
        assert_eq!(
            next_status(S::Normal, 60_000, &thresholds, AlarmRuleSet::Literal),
            S::Max
        );
    }

    #[test]
    fn fan_ladder_cascades_and_holds() {
        assert_eq!(fan_at(FanSpeed::Normal, 72), FanSpeed::Max);
        assert_eq!(fan_at(FanSpeed::Max, 68), FanSpeed::Max);
        assert_eq!(fan_at(FanSpeed::Max, 64), FanSpeed::Fast);
        assert_eq!(fan_at(FanSpeed::Max, 20), FanSpeed::Normal);
        assert_eq!(fan_at(FanSpeed::Normal, 39), FanSpeed::Normal);
        assert_eq!(fan_at(FanSpeed::Medium, 36), FanSpeed::Medium);
    }

    #[test]
    fn advance_leaves_failed_sensor_alone() {
        let state = ThermalState {
            status: S::Failed,
            fan_speed: FanSpeed::Fast,
            min: 20_000,
            max: 30_000,
        };

        let next = advance(state, 99_000, &descriptor(1, "lm75"), AlarmRuleSet::Literal);
        assert_eq!(next, state);
    }

    #[test]
    fn advance_enters_ladder_from_uninitialized_and_tracks_extremes() {
        let state = ThermalState {
            status: S::Uninitialized,
            fan_speed: FanSpeed::Normal,
            min: 1_000_000,
            max: -1_000_000,
        };

        let next = advance(state, 45_500, &descriptor(1, "lm75"), AlarmRuleSet::Literal);
        assert_eq!(
            next,
            ThermalState {
                status: S::Normal,
                fan_speed: FanSpeed::Medium,
                min: 45_500,
                max: 45_500,
            }
        );

        let next = advance(next, 41_000, &descriptor(1, "lm75"), AlarmRuleSet::Literal);
        assert_eq!(next.min, 41_000);
        assert_eq!(next.max, 45_500);
    }

    proptest! {
        #[test]
        fn normal_band_is_stable(milli in 10_001i32..60_000i32) {
            let thresholds = alarm_thresholds();
            for rules in [AlarmRuleSet::Literal, AlarmRuleSet::LowCritRecovery] {
                prop_assert_eq!(next_status(S::Normal, milli, &thresholds, rules), S::Normal);
            }
        }

        #[test]
        fn status_is_idempotent_for_a_steady_reading(milli in -20_000i32..120_000i32) {
            let thresholds = alarm_thresholds();
            for from in [S::Normal, S::Min, S::Max, S::Critical, S::Emergency] {
                let once = next_status(from, milli, &thresholds, AlarmRuleSet::Literal);
                let twice = next_status(once, milli, &thresholds, AlarmRuleSet::Literal);
                prop_assert_eq!(once, twice);
            }
        }

        #[test]
        fn fan_speed_never_drops_on_rising_reading(milli in 0i32..100_000i32, step in 0i32..20_000i32) {
            let low = fan_at_milli(FanSpeed::Normal, milli);
            let high = fan_at_milli(low, milli + step);
            prop_assert!(high >= low);
        }

        #[test]
        fn extremes_always_bracket_reading(readings in prop::collection::vec(-40_000i32..130_000i32, 1..20)) {
            let desc = descriptor(1, "lm75");
            let mut state = ThermalState {
                status: S::Uninitialized,
                fan_speed: FanSpeed::Normal,
                min: 1_000_000,
                max: -1_000_000,
            };
            for temp in readings {
                state = advance(state, temp, &desc, AlarmRuleSet::Literal);
                prop_assert!(state.min <= temp && temp <= state.max);
            }
        }
    }

    fn fan_at_milli(from: FanSpeed, milli: i32) -> FanSpeed {
        next_fan_speed(from, milli, &fan_thresholds())
    }
}
