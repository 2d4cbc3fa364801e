//! Event types for kidslockd -> client streaming

use chrono::{DateTime, Local};
use kidslock_util::DeviceId;
use serde::{Deserialize, Serialize};

use crate::{DecisionReason, DeviceStatus, API_VERSION};

/// Event envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub api_version: u32,
    pub timestamp: DateTime<Local>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            api_version: API_VERSION,
            timestamp: kidslock_util::now(),
            payload,
        }
    }
}

/// All possible events from the service to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// Latest status of a device; the newest one per device is retained
    DeviceState {
        device_id: DeviceId,
        status: DeviceStatus,
    },

    /// Device was deleted; its retained status is cleared
    DeviceRemoved { device_id: DeviceId },

    /// A lock or unlock command succeeded
    LockChanged {
        device_id: DeviceId,
        locked: bool,
        reason: DecisionReason,
    },

    /// A lock or unlock command failed and will be retried
    CommandFailed {
        device_id: DeviceId,
        locked: bool,
        error: String,
    },

    /// Service is shutting down
    Shutdown,
}
