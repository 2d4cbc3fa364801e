//! Core events emitted by the reconciler

use kidslock_api::DecisionReason;
use kidslock_util::DeviceId;

/// Events emitted when a command completes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreEvent {
    /// A device's lock state changed
    LockChanged {
        device_id: DeviceId,
        locked: bool,
        reason: DecisionReason,
    },

    /// A lock or unlock command failed; it is retried on the next tick
    CommandFailed {
        device_id: DeviceId,
        locked: bool,
        error: String,
    },
}
