//! Validated policy structures

use crate::schema::{RawConfig, RawDevice, RawProbeKind, RawServiceConfig};
use crate::validation::parse_time;
use kidslock_api::{
    DaySchedule, DeviceDefinition, WeeklySchedule, DEFAULT_BEDTIME, DEFAULT_DAILY_LIMIT_MINUTES,
};
use kidslock_util::{default_data_dir, default_socket_path, DeviceId, WallClock};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_CONTROL_PORT: u16 = 8080;
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Validated policy ready for use by the service
#[derive(Debug, Clone, Default)]
pub struct Policy {
    /// Service configuration
    pub service: ServiceConfig,

    /// Devices to seed into the registry
    pub devices: Vec<DeviceDefinition>,
}

impl Policy {
    /// Convert from raw config (after validation)
    pub fn from_raw(raw: RawConfig) -> Self {
        let service = ServiceConfig::from_raw(raw.service);
        let devices = raw
            .devices
            .into_iter()
            .map(|d| convert_device(d, service.default_day))
            .collect();

        Self { service, devices }
    }

    /// Get device by ID
    pub fn get_device(&self, id: &DeviceId) -> Option<&DeviceDefinition> {
        self.devices.iter().find(|d| &d.id == id)
    }
}

/// How device reachability is checked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    /// TCP connect to the control port
    Tcp,
    /// ICMP echo request
    Icmp,
}

/// Service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub socket_path: PathBuf,
    pub data_dir: PathBuf,
    pub tick_interval: Duration,
    pub control_port: u16,
    pub command_timeout: Duration,
    pub probe_timeout: Duration,
    pub probe: ProbeKind,
    pub reassert_lock: bool,
    pub poll_status: bool,
    /// Budget and bedtime for days nothing else configures
    pub default_day: DaySchedule,
}

impl ServiceConfig {
    fn from_raw(raw: RawServiceConfig) -> Self {
        let defaults = Self::default();
        let default_bedtime = raw
            .default_bedtime
            .as_deref()
            .and_then(|s| parse_time(s).ok())
            .unwrap_or(DEFAULT_BEDTIME);

        Self {
            socket_path: raw.socket_path.unwrap_or(defaults.socket_path),
            data_dir: raw.data_dir.unwrap_or(defaults.data_dir),
            tick_interval: raw
                .tick_interval_seconds
                .map(Duration::from_secs)
                .unwrap_or(defaults.tick_interval),
            control_port: raw.control_port.unwrap_or(defaults.control_port),
            command_timeout: raw
                .command_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.command_timeout),
            probe_timeout: raw
                .probe_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.probe_timeout),
            probe: match raw.probe {
                Some(RawProbeKind::Icmp) => ProbeKind::Icmp,
                Some(RawProbeKind::Tcp) | None => ProbeKind::Tcp,
            },
            reassert_lock: raw.reassert_lock.unwrap_or(defaults.reassert_lock),
            poll_status: raw.poll_status.unwrap_or(defaults.poll_status),
            default_day: DaySchedule::new(
                raw.default_daily_limit_minutes
                    .unwrap_or(DEFAULT_DAILY_LIMIT_MINUTES),
                default_bedtime,
            ),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            data_dir: default_data_dir(),
            tick_interval: DEFAULT_TICK_INTERVAL,
            control_port: DEFAULT_CONTROL_PORT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            probe: ProbeKind::Tcp,
            reassert_lock: true,
            poll_status: false,
            default_day: DaySchedule::default(),
        }
    }
}

// Conversion helpers

fn parse_time_or(value: Option<&str>, fallback: WallClock) -> WallClock {
    value.and_then(|s| parse_time(s).ok()).unwrap_or(fallback)
}

/// Resolve the weekday table: day entry, then device pair, then service pair
fn convert_device(raw: RawDevice, service_day: DaySchedule) -> DeviceDefinition {
    let device_day = DaySchedule::new(
        raw.daily_limit_minutes.unwrap_or(service_day.limit_minutes),
        parse_time_or(raw.bedtime.as_deref(), service_day.bedtime),
    );

    let mut schedule = WeeklySchedule::uniform(device_day);
    for (weekday, day) in raw.schedule.entries() {
        if let Some(day) = day {
            schedule.set(
                weekday,
                DaySchedule::new(
                    day.limit_minutes.unwrap_or(device_day.limit_minutes),
                    parse_time_or(day.bedtime.as_deref(), device_day.bedtime),
                ),
            );
        }
    }

    DeviceDefinition {
        id: DeviceId::new(raw.effective_id()),
        name: raw.name,
        address: raw.address.trim().to_string(),
        schedule,
        no_limit_mode: raw.no_limit,
    }
}
