//! Store trait definitions

use chrono::NaiveDate;
use kidslock_api::{DeviceDefinition, ManualOverride};
use kidslock_util::DeviceId;

use crate::{AuditEvent, StoreResult};

/// Main store trait
pub trait Store: Send + Sync {
    // Audit log

    /// Append an audit event
    fn append_audit(&self, event: AuditEvent) -> StoreResult<()>;

    /// Get recent audit events, newest first
    fn get_recent_audits(&self, limit: usize) -> StoreResult<Vec<AuditEvent>>;

    // Device registry

    /// Load every device; rows that fail to decode are skipped
    fn load_devices(&self) -> StoreResult<Vec<DeviceRecord>>;

    /// Load one device
    fn get_device(&self, id: &DeviceId) -> StoreResult<Option<DeviceRecord>>;

    /// Insert or replace a device, its schedule and its counters
    fn upsert_device(&self, record: &DeviceRecord) -> StoreResult<()>;

    /// Write only the daily counters of an existing device
    fn save_counters(&self, id: &DeviceId, counters: &DeviceCounters) -> StoreResult<()>;

    /// Remove a device with its schedule and counters. Returns whether it existed.
    fn delete_device(&self, id: &DeviceId) -> StoreResult<bool>;

    // Health

    /// Check if store is healthy
    fn is_healthy(&self) -> bool;
}

/// Persisted per-day bookkeeping of a device
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DeviceCounters {
    /// Usage accumulated on `last_reset_date`
    pub elapsed_minutes: f64,

    /// Day the counter was last zeroed
    pub last_reset_date: NaiveDate,

    pub manual_override: Option<ManualOverride>,

    /// Last lock state commanded (or read back from the device)
    pub locked: bool,
}

impl DeviceCounters {
    /// Fresh counters for a device first seen on `today`
    pub fn fresh(today: NaiveDate) -> Self {
        Self {
            elapsed_minutes: 0.0,
            last_reset_date: today,
            manual_override: None,
            locked: false,
        }
    }
}

/// A device as stored in the registry
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DeviceRecord {
    pub definition: DeviceDefinition,
    pub counters: DeviceCounters,
}
