//! Command types for the kidslockd protocol

use chrono::{DateTime, Local};
use kidslock_util::{ClientId, DeviceId};
use serde::{Deserialize, Serialize};

use crate::{
    ClientRole, DeviceDefinition, DeviceView, HealthStatus, RetainedState, ServiceStateSnapshot,
    API_VERSION,
};

/// Request wrapper with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Request ID for correlation
    pub request_id: u64,
    /// API version
    pub api_version: u32,
    /// The command
    pub command: Command,
}

impl Request {
    pub fn new(request_id: u64, command: Command) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            command,
        }
    }
}

/// Response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Corresponding request ID
    pub request_id: u64,
    /// API version
    pub api_version: u32,
    /// Response payload or error
    pub result: ResponseResult,
}

impl Response {
    pub fn success(request_id: u64, payload: ResponsePayload) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            result: ResponseResult::Ok(payload),
        }
    }

    pub fn error(request_id: u64, error: ErrorInfo) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            result: ResponseResult::Err(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseResult {
    Ok(ResponsePayload),
    Err(ErrorInfo),
}

/// Error information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Error codes for the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    DeviceNotFound,
    DeviceExists,
    ValidationFailed,
    PermissionDenied,
    RateLimited,
    StoreError,
    DeviceError,
    InternalError,
}

/// All possible commands from clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Get current service state
    GetState,

    /// List all devices
    ListDevices,

    /// Get one device
    GetDevice { device_id: DeviceId },

    // Device definitions (admin only)

    CreateDevice { device: DeviceDefinition },

    /// Replace name, address, schedule and no-limit flag; counters are kept
    UpdateDevice { device: DeviceDefinition },

    DeleteDevice { device_id: DeviceId },

    // Lock control (admin only)

    /// Override to the opposite of the current lock state
    ToggleLock { device_id: DeviceId },

    /// Override to an explicit lock state
    SetLock { device_id: DeviceId, locked: bool },

    /// Give back minutes of budget and clear any override
    AddTime { device_id: DeviceId, minutes: u32 },

    /// Zero today's usage and clear any override
    ResetDay { device_id: DeviceId },

    /// Clear the override and return to automatic control
    ResumeAutomatic { device_id: DeviceId },

    /// Most recent audit log entries, newest first
    GetRecentEvents { limit: usize },

    /// Subscribe to events (returns immediately, events stream separately)
    SubscribeEvents,

    /// Unsubscribe from events
    UnsubscribeEvents,

    /// Get health status
    GetHealth,

    /// Ping for keepalive
    Ping,
}

impl Command {
    /// Whether this command changes devices or their lock state
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Command::CreateDevice { .. }
                | Command::UpdateDevice { .. }
                | Command::DeleteDevice { .. }
                | Command::ToggleLock { .. }
                | Command::SetLock { .. }
                | Command::AddTime { .. }
                | Command::ResetDay { .. }
                | Command::ResumeAutomatic { .. }
        )
    }
}

/// One audit log entry as returned to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntryView {
    pub id: i64,
    pub timestamp: DateTime<Local>,
    pub event: serde_json::Value,
}

/// Response payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponsePayload {
    State(ServiceStateSnapshot),
    Devices { devices: Vec<DeviceView> },
    Device { device: DeviceView },
    DeviceDeleted { device_id: DeviceId },
    RecentEvents { events: Vec<AuditEntryView> },
    Subscribed {
        client_id: ClientId,
        /// Latest status of every device, replayed for retained semantics
        retained: Vec<RetainedState>,
    },
    Unsubscribed,
    Health(HealthStatus),
    Pong,
}

/// Client connection info (set by IPC layer)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: ClientId,
    pub role: ClientRole,
    /// Unix UID if available
    pub uid: Option<u32>,
}

impl ClientInfo {
    pub fn new(role: ClientRole) -> Self {
        Self {
            client_id: ClientId::new(),
            role,
            uid: None,
        }
    }

    pub fn with_uid(mut self, uid: u32) -> Self {
        self.uid = Some(uid);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serialization() {
        let req = Request::new(
            1,
            Command::AddTime {
                device_id: DeviceId::new("tv"),
                minutes: 30,
            },
        );
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"type\":\"add_time\""));

        let parsed: Request = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.request_id, 1);
        assert!(matches!(
            parsed.command,
            Command::AddTime { minutes: 30, .. }
        ));
    }

    #[test]
    fn command_from_hand_written_json() {
        let json = r#"{"request_id":7,"api_version":1,"command":{"type":"set_lock","device_id":"tablet","locked":true}}"#;
        let parsed: Request = serde_json::from_str(json).unwrap();
        match parsed.command {
            Command::SetLock { device_id, locked } => {
                assert_eq!(device_id.as_str(), "tablet");
                assert!(locked);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn mutating_commands() {
        let id = DeviceId::new("tv");
        assert!(Command::ToggleLock { device_id: id.clone() }.is_mutating());
        assert!(Command::ResumeAutomatic { device_id: id.clone() }.is_mutating());
        assert!(!Command::GetDevice { device_id: id }.is_mutating());
        assert!(!Command::SubscribeEvents.is_mutating());
    }

    #[test]
    fn response_serialization() {
        let resp = Response::error(3, ErrorInfo::new(ErrorCode::DeviceNotFound, "no such device"));
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("device_not_found"));

        let parsed: Response = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.request_id, 3);
        assert!(matches!(parsed.result, ResponseResult::Err(ref e) if e.code == ErrorCode::DeviceNotFound));
    }
}
