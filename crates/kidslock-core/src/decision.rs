//! Pure decision rules for one device
//!
//! Everything here is a function of a device snapshot and a wall-clock
//! reading. No I/O, no clocks read.

use chrono::{DateTime, Datelike, Local, NaiveDate, NaiveTime, Weekday};
use kidslock_api::{DecisionReason, DeviceDefinition, Remaining, BEDTIME_WINDOW_END};
use kidslock_store::DeviceCounters;
use kidslock_util::WallClock;
use std::time::Duration;

/// Outcome of evaluating one device at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub desired_locked: bool,
    pub reason: DecisionReason,
    pub time_up: bool,
    pub is_bedtime: bool,
}

/// Zero the counters when the calendar day has changed.
///
/// Returns true if a reset happened.
pub fn apply_daily_reset(counters: &mut DeviceCounters, today: NaiveDate) -> bool {
    if counters.last_reset_date == today {
        return false;
    }
    counters.elapsed_minutes = 0.0;
    counters.manual_override = None;
    counters.last_reset_date = today;
    true
}

/// Whether `time` falls in the bedtime window starting at `bedtime`.
///
/// Anything after the bedtime or before 04:00 counts, whatever the bedtime.
pub fn is_bedtime(bedtime: WallClock, time: NaiveTime) -> bool {
    time > bedtime.to_naive_time() || time < BEDTIME_WINDOW_END.to_naive_time()
}

/// Minutes to accrue for a gap between ticks, clamped to `[0, 2 × nominal]`
pub fn clamp_delta_minutes(since_last: Duration, nominal: Duration) -> f64 {
    since_last.min(nominal * 2).as_secs_f64() / 60.0
}

/// Add usage if the device is online, unlocked and limited.
///
/// Returns the minutes actually added.
pub fn accrue(
    counters: &mut DeviceCounters,
    online: bool,
    no_limit_mode: bool,
    delta_minutes: f64,
) -> f64 {
    if !online || counters.locked || no_limit_mode || delta_minutes <= 0.0 {
        return 0.0;
    }
    counters.elapsed_minutes += delta_minutes;
    delta_minutes
}

/// Decide the lock state a device should be in at `now`
pub fn evaluate(
    definition: &DeviceDefinition,
    counters: &DeviceCounters,
    now: DateTime<Local>,
) -> Decision {
    if definition.no_limit_mode {
        return match counters.manual_override {
            Some(o) => Decision {
                desired_locked: o.locked(),
                reason: DecisionReason::Manual,
                time_up: false,
                is_bedtime: false,
            },
            None => Decision {
                desired_locked: false,
                reason: DecisionReason::NoLimit,
                time_up: false,
                is_bedtime: false,
            },
        };
    }

    let day = definition.schedule.for_weekday(now.weekday());
    let time_up = counters.elapsed_minutes >= day.limit_minutes as f64;
    let bedtime = is_bedtime(day.bedtime, now.time());

    let (desired_locked, reason) = match counters.manual_override {
        Some(o) => (o.locked(), DecisionReason::Manual),
        None if bedtime => (true, DecisionReason::Bedtime),
        None if time_up => (true, DecisionReason::TimeLimitReached),
        None => (false, DecisionReason::WithinBudget),
    };

    Decision {
        desired_locked,
        reason,
        time_up,
        is_bedtime: bedtime,
    }
}

/// Whether a command must be sent.
///
/// Always when the desired state differs from the believed one; otherwise
/// only to re-assert a lock on an online device.
pub fn should_dispatch(desired_locked: bool, locked: bool, online: bool, reassert_lock: bool) -> bool {
    desired_locked != locked || (desired_locked && online && reassert_lock)
}

/// Budget left on `weekday`
pub fn remaining(definition: &DeviceDefinition, counters: &DeviceCounters, weekday: Weekday) -> Remaining {
    if definition.no_limit_mode {
        return Remaining::Unlimited;
    }
    let day = definition.schedule.for_weekday(weekday);
    Remaining::from_budget(day.limit_minutes, counters.elapsed_minutes)
}
