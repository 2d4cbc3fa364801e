//! Shared types for the kidslockd API

use chrono::{DateTime, Local, NaiveDate, Weekday};
use kidslock_util::{DeviceId, WallClock};
use serde::de::{self, Unexpected};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

/// Daily budget used when neither the device nor the service configures one
pub const DEFAULT_DAILY_LIMIT_MINUTES: u32 = 120;

/// Bedtime used when neither the device nor the service configures one
pub const DEFAULT_BEDTIME: WallClock = WallClock { hour: 20, minute: 0 };

/// End of the bedtime window on the following morning
pub const BEDTIME_WINDOW_END: WallClock = WallClock { hour: 4, minute: 0 };

/// Weekdays in schedule order
pub const WEEKDAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

/// Budget and bedtime for one day of the week
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaySchedule {
    pub limit_minutes: u32,
    pub bedtime: WallClock,
}

impl DaySchedule {
    pub fn new(limit_minutes: u32, bedtime: WallClock) -> Self {
        Self {
            limit_minutes,
            bedtime,
        }
    }
}

impl Default for DaySchedule {
    fn default() -> Self {
        Self::new(DEFAULT_DAILY_LIMIT_MINUTES, DEFAULT_BEDTIME)
    }
}

/// Schedule validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("daily limit for {0} must be greater than zero")]
    ZeroLimit(Weekday),
}

/// Seven-entry schedule indexed Monday..Sunday
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklySchedule([DaySchedule; 7]);

impl WeeklySchedule {
    /// Same budget and bedtime every day
    pub fn uniform(day: DaySchedule) -> Self {
        Self([day; 7])
    }

    pub fn with_day(mut self, weekday: Weekday, day: DaySchedule) -> Self {
        self.set(weekday, day);
        self
    }

    pub fn set(&mut self, weekday: Weekday, day: DaySchedule) {
        self.0[weekday.num_days_from_monday() as usize] = day;
    }

    pub fn for_weekday(&self, weekday: Weekday) -> DaySchedule {
        self.0[weekday.num_days_from_monday() as usize]
    }

    pub fn days(&self) -> impl Iterator<Item = (Weekday, DaySchedule)> + '_ {
        WEEKDAYS.iter().copied().zip(self.0.iter().copied())
    }

    pub fn validate(&self) -> Result<(), ScheduleError> {
        for (weekday, day) in self.days() {
            if day.limit_minutes == 0 {
                return Err(ScheduleError::ZeroLimit(weekday));
            }
        }
        Ok(())
    }
}

impl Default for WeeklySchedule {
    fn default() -> Self {
        Self::uniform(DaySchedule::default())
    }
}

/// Device definition validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error("device id must not be empty")]
    EmptyId,

    #[error("device '{0}' has an empty address")]
    EmptyAddress(DeviceId),

    #[error("device '{device}': {source}")]
    Schedule {
        device: DeviceId,
        #[source]
        source: ScheduleError,
    },
}

/// The user-editable part of a device record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDefinition {
    pub id: DeviceId,
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub schedule: WeeklySchedule,
    #[serde(default)]
    pub no_limit_mode: bool,
}

impl DeviceDefinition {
    /// New definition with the id derived from `name` and the default schedule
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: DeviceId::from_name(&name),
            name,
            address: address.into(),
            schedule: WeeklySchedule::default(),
            no_limit_mode: false,
        }
    }

    pub fn with_schedule(mut self, schedule: WeeklySchedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn with_no_limit(mut self, no_limit_mode: bool) -> Self {
        self.no_limit_mode = no_limit_mode;
        self
    }

    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.id.is_empty() {
            return Err(DefinitionError::EmptyId);
        }
        if self.address.trim().is_empty() {
            return Err(DefinitionError::EmptyAddress(self.id.clone()));
        }
        self.schedule
            .validate()
            .map_err(|source| DefinitionError::Schedule {
                device: self.id.clone(),
                source,
            })
    }
}

/// Explicit lock state requested by a person, authoritative until cleared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualOverride {
    Lock,
    Unlock,
}

impl ManualOverride {
    pub fn from_locked(locked: bool) -> Self {
        if locked {
            ManualOverride::Lock
        } else {
            ManualOverride::Unlock
        }
    }

    pub fn locked(self) -> bool {
        matches!(self, ManualOverride::Lock)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ManualOverride::Lock => "lock",
            ManualOverride::Unlock => "unlock",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "lock" => Some(ManualOverride::Lock),
            "unlock" => Some(ManualOverride::Unlock),
            _ => None,
        }
    }
}

/// Why the engine wants a device locked or unlocked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    /// A manual override is in effect
    Manual,
    /// Inside the bedtime window
    Bedtime,
    /// Daily budget used up
    TimeLimitReached,
    /// Budget left and outside bedtime
    WithinBudget,
    /// Enforcement suspended for this device
    NoLimit,
}

impl DecisionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionReason::Manual => "manual",
            DecisionReason::Bedtime => "bedtime",
            DecisionReason::TimeLimitReached => "time_limit_reached",
            DecisionReason::WithinBudget => "within_budget",
            DecisionReason::NoLimit => "no_limit",
        }
    }
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remaining budget: whole minutes, or unlimited
///
/// Serialized as a bare number or the string `"unlimited"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Remaining {
    Minutes(u64),
    Unlimited,
}

impl Remaining {
    /// `max(0, limit - elapsed)`, truncated to whole minutes
    pub fn from_budget(limit_minutes: u32, elapsed_minutes: f64) -> Self {
        let left = (limit_minutes as f64 - elapsed_minutes).max(0.0);
        Remaining::Minutes(left.trunc() as u64)
    }
}

impl fmt::Display for Remaining {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Remaining::Minutes(m) => f.write_str(&kidslock_util::format_minutes(*m)),
            Remaining::Unlimited => f.write_str("unlimited"),
        }
    }
}

impl Serialize for Remaining {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Remaining::Minutes(m) => serializer.serialize_u64(*m),
            Remaining::Unlimited => serializer.serialize_str("unlimited"),
        }
    }
}

impl<'de> Deserialize<'de> for Remaining {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Minutes(u64),
            Marker(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Minutes(m) => Ok(Remaining::Minutes(m)),
            Raw::Marker(s) if s == "unlimited" => Ok(Remaining::Unlimited),
            Raw::Marker(other) => Err(de::Error::invalid_value(
                Unexpected::Str(&other),
                &"a minute count or \"unlimited\"",
            )),
        }
    }
}

/// Retained per-device state published to observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub locked: bool,
    pub remaining: Remaining,
    pub online: bool,
}

/// Latest published status of one device, as replayed to new subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetainedState {
    pub device_id: DeviceId,
    pub status: DeviceStatus,
}

/// Full view of a device for UI display
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceView {
    pub device_id: DeviceId,
    pub name: String,
    pub address: String,
    pub no_limit_mode: bool,
    pub schedule: WeeklySchedule,
    /// Schedule entry for the current weekday
    pub today: DaySchedule,
    pub elapsed_minutes: f64,
    pub last_reset_date: NaiveDate,
    pub manual_override: Option<ManualOverride>,
    pub online: bool,
    pub locked: bool,
    pub remaining: Remaining,
    /// Reason behind the most recent decision, if a tick has run
    pub reason: Option<DecisionReason>,
}

impl DeviceView {
    pub fn status(&self) -> DeviceStatus {
        DeviceStatus {
            locked: self.locked,
            remaining: self.remaining,
            online: self.online,
        }
    }
}

/// Full service state snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStateSnapshot {
    pub api_version: u32,
    pub tick_interval_secs: u64,
    pub device_count: usize,
    pub last_tick: Option<DateTime<Local>>,
    #[serde(default)]
    pub devices: Vec<DeviceView>,
}

/// Role for authorization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientRole {
    /// Local admin - can change devices and lock state
    Admin,
    /// Read-only observer - can query and subscribe
    Observer,
}

impl ClientRole {
    pub fn can_mutate(&self) -> bool {
        matches!(self, ClientRole::Admin)
    }
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub live: bool,
    pub ready: bool,
    pub store_ok: bool,
    pub device_count: usize,
    pub last_tick: Option<DateTime<Local>>,
}
