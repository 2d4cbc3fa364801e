//! Audit event types

use chrono::{DateTime, Local};
use kidslock_api::DecisionReason;
use kidslock_util::DeviceId;
use serde::{Deserialize, Serialize};

/// Types of audit events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEventType {
    ServiceStarted,

    ServiceStopped,

    /// Configuration loaded and devices seeded
    ConfigLoaded { device_count: usize },

    DeviceLocked {
        device_id: DeviceId,
        reason: DecisionReason,
    },

    DeviceUnlocked {
        device_id: DeviceId,
        reason: DecisionReason,
    },

    /// Minutes handed back to a device's budget
    TimeAdded {
        device_id: DeviceId,
        minutes: u32,
        elapsed_minutes: f64,
    },

    /// Usage zeroed, either by the calendar or on request
    DayReset { device_id: DeviceId, manual: bool },

    OverrideSet { device_id: DeviceId, locked: bool },

    OverrideCleared { device_id: DeviceId },

    DeviceCreated { device_id: DeviceId },

    DeviceUpdated { device_id: DeviceId },

    DeviceDeleted { device_id: DeviceId },

    /// Lock or unlock command failed; retried next tick
    CommandFailed {
        device_id: DeviceId,
        locked: bool,
        error: String,
    },

    ClientConnected {
        client_id: String,
        role: String,
        uid: Option<u32>,
    },

    ClientDisconnected { client_id: String },
}

/// Full audit event with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event ID
    pub id: i64,

    /// Event timestamp
    pub timestamp: DateTime<Local>,

    /// Event type and details
    pub event: AuditEventType,
}

impl AuditEvent {
    pub fn new(event: AuditEventType) -> Self {
        Self {
            id: 0, // assigned by the store
            timestamp: kidslock_util::now(),
            event,
        }
    }
}
