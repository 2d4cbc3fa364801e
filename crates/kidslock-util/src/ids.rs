//! Strongly-typed identifiers for kidslock

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable slug identifying a controlled device
///
/// Slugs are derived from display names the same way the state bus topics
/// are: lower-cased, with spaces replaced by underscores.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive a slug from a human-readable device name
    pub fn from_name(name: &str) -> Self {
        Self(name.trim().to_lowercase().replace(' ', "_"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique identifier for a connected IPC client
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_equality() {
        let id1 = DeviceId::new("tv-1");
        let id2 = DeviceId::new("tv-1");
        let id3 = DeviceId::new("tv-2");

        assert_eq!(id1, id2);
        assert_ne!(id1, id3);
    }

    #[test]
    fn device_id_from_name() {
        assert_eq!(DeviceId::from_name("Living Room TV").as_str(), "living_room_tv");
        assert_eq!(DeviceId::from_name("  Kids Tablet ").as_str(), "kids_tablet");
        assert!(DeviceId::from_name("   ").is_empty());
    }

    #[test]
    fn client_id_uniqueness() {
        assert_ne!(ClientId::new(), ClientId::new());
    }

    #[test]
    fn ids_serialize_deserialize() {
        let device_id = DeviceId::new("bedroom_tv");
        let json = serde_json::to_string(&device_id).unwrap();
        assert_eq!(json, "\"bedroom_tv\"");
        let parsed: DeviceId = serde_json::from_str(&json).unwrap();
        assert_eq!(device_id, parsed);

        let client_id = ClientId::new();
        let json = serde_json::to_string(&client_id).unwrap();
        let parsed: ClientId = serde_json::from_str(&json).unwrap();
        assert_eq!(client_id, parsed);
    }
}
