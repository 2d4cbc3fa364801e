//! In-memory device registry owned by the engine

use chrono::{DateTime, Datelike, Local, Weekday};
use kidslock_api::{DecisionReason, DeviceDefinition, DeviceStatus, DeviceView};
use kidslock_store::{DeviceCounters, DeviceRecord};
use kidslock_util::DeviceId;
use std::collections::BTreeMap;

use crate::decision;

/// A tracked device: its definition, persisted counters and transient state
#[derive(Debug, Clone)]
pub struct Device {
    pub definition: DeviceDefinition,
    pub counters: DeviceCounters,
    /// Last reachability result; not persisted
    pub online: bool,
    /// Reason behind the latest decision
    pub last_reason: Option<DecisionReason>,
}

impl Device {
    pub fn from_record(record: DeviceRecord) -> Self {
        Self {
            definition: record.definition,
            counters: record.counters,
            online: false,
            last_reason: None,
        }
    }

    pub fn id(&self) -> &DeviceId {
        &self.definition.id
    }

    pub fn record(&self) -> DeviceRecord {
        DeviceRecord {
            definition: self.definition.clone(),
            counters: self.counters.clone(),
        }
    }

    pub fn status(&self, weekday: Weekday) -> DeviceStatus {
        DeviceStatus {
            locked: self.counters.locked,
            remaining: decision::remaining(&self.definition, &self.counters, weekday),
            online: self.online,
        }
    }

    pub fn view(&self, now: DateTime<Local>) -> DeviceView {
        let weekday = now.weekday();
        DeviceView {
            device_id: self.definition.id.clone(),
            name: self.definition.name.clone(),
            address: self.definition.address.clone(),
            no_limit_mode: self.definition.no_limit_mode,
            schedule: self.definition.schedule,
            today: self.definition.schedule.for_weekday(weekday),
            elapsed_minutes: self.counters.elapsed_minutes,
            last_reset_date: self.counters.last_reset_date,
            manual_override: self.counters.manual_override,
            online: self.online,
            locked: self.counters.locked,
            remaining: decision::remaining(&self.definition, &self.counters, weekday),
            reason: self.last_reason,
        }
    }
}

/// All devices, keyed by slug
#[derive(Debug, Default)]
pub struct Registry {
    devices: BTreeMap<DeviceId, Device>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace; returns the previous entry
    pub fn insert(&mut self, device: Device) -> Option<Device> {
        self.devices.insert(device.id().clone(), device)
    }

    pub fn get(&self, id: &DeviceId) -> Option<&Device> {
        self.devices.get(id)
    }

    pub fn get_mut(&mut self, id: &DeviceId) -> Option<&mut Device> {
        self.devices.get_mut(id)
    }

    pub fn remove(&mut self, id: &DeviceId) -> Option<Device> {
        self.devices.remove(id)
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.devices.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Device> {
        self.devices.values_mut()
    }
}
