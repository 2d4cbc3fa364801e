//! Raw configuration schema (as parsed from TOML)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Raw configuration as parsed from TOML
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawConfig {
    /// Config schema version
    pub config_version: u32,

    /// Global service settings
    #[serde(default)]
    pub service: RawServiceConfig,

    /// Devices seeded into the registry at startup
    #[serde(default)]
    pub devices: Vec<RawDevice>,
}

/// Service-level settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawServiceConfig {
    /// IPC socket path
    pub socket_path: Option<PathBuf>,

    /// Data directory for the registry database
    pub data_dir: Option<PathBuf>,

    /// Seconds between reconciliation ticks
    pub tick_interval_seconds: Option<u64>,

    /// Port of the device control endpoint
    pub control_port: Option<u16>,

    /// Timeout for lock/unlock/status calls, in milliseconds
    pub command_timeout_ms: Option<u64>,

    /// Timeout for a reachability probe, in milliseconds
    pub probe_timeout_ms: Option<u64>,

    /// Reachability probe: "tcp" or "icmp"
    pub probe: Option<RawProbeKind>,

    /// Re-send lock to online devices that should already be locked
    pub reassert_lock: Option<bool>,

    /// Read `/status` from online devices to correct drift
    pub poll_status: Option<bool>,

    /// Fallback daily budget for devices that do not set one
    pub default_daily_limit_minutes: Option<u32>,

    /// Fallback bedtime (HH:MM) for devices that do not set one
    pub default_bedtime: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RawProbeKind {
    Tcp,
    Icmp,
}

/// Raw device definition
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawDevice {
    /// Stable slug; derived from `name` when absent
    pub id: Option<String>,

    /// Display name
    pub name: String,

    /// Host name or IP address of the device
    pub address: String,

    /// Daily budget used on days without a schedule entry
    pub daily_limit_minutes: Option<u32>,

    /// Bedtime (HH:MM) used on days without a schedule entry
    pub bedtime: Option<String>,

    /// Suspend budget and bedtime enforcement
    #[serde(default)]
    pub no_limit: bool,

    /// Per-weekday overrides
    #[serde(default)]
    pub schedule: RawSchedule,
}

impl RawDevice {
    /// Slug this device will be registered under
    pub fn effective_id(&self) -> String {
        match &self.id {
            Some(id) => id.clone(),
            None => kidslock_util::DeviceId::from_name(&self.name).as_str().to_string(),
        }
    }
}

/// Per-weekday schedule table
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawSchedule {
    #[serde(alias = "monday")]
    pub mon: Option<RawDaySchedule>,
    #[serde(alias = "tuesday")]
    pub tue: Option<RawDaySchedule>,
    #[serde(alias = "wednesday")]
    pub wed: Option<RawDaySchedule>,
    #[serde(alias = "thursday")]
    pub thu: Option<RawDaySchedule>,
    #[serde(alias = "friday")]
    pub fri: Option<RawDaySchedule>,
    #[serde(alias = "saturday")]
    pub sat: Option<RawDaySchedule>,
    #[serde(alias = "sunday")]
    pub sun: Option<RawDaySchedule>,
}

impl RawSchedule {
    /// Entries in Monday..Sunday order
    pub fn entries(&self) -> [(chrono::Weekday, Option<&RawDaySchedule>); 7] {
        use chrono::Weekday::*;
        [
            (Mon, self.mon.as_ref()),
            (Tue, self.tue.as_ref()),
            (Wed, self.wed.as_ref()),
            (Thu, self.thu.as_ref()),
            (Fri, self.fri.as_ref()),
            (Sat, self.sat.as_ref()),
            (Sun, self.sun.as_ref()),
        ]
    }
}

/// One weekday's budget and bedtime; missing fields fall back to the device
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawDaySchedule {
    pub limit_minutes: Option<u32>,
    pub bedtime: Option<String>,
}
