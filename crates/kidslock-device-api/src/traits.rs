//! Device boundary traits

use async_trait::async_trait;
use kidslock_api::DeviceStatus;
use kidslock_util::DeviceId;
use std::time::Duration;
use thiserror::Error;

/// Errors from talking to a device or publishing its state
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Device unreachable: {0}")]
    Unreachable(String),

    #[error("Device returned HTTP {0}")]
    HttpStatus(u16),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type DeviceResult<T> = Result<T, DeviceError>;

/// Answers whether a device can be reached right now
#[async_trait]
pub trait ReachabilityProber: Send + Sync {
    /// Probe `address`; errors and timeouts count as unreachable
    async fn is_reachable(&self, address: &str) -> bool;
}

/// Sends lock state commands to a device's control endpoint
#[async_trait]
pub trait RemoteControl: Send + Sync {
    async fn lock(&self, address: &str) -> DeviceResult<()>;

    async fn unlock(&self, address: &str) -> DeviceResult<()>;

    /// Ask the device whether it is currently locked
    async fn status(&self, address: &str) -> DeviceResult<bool>;

    async fn set_locked(&self, address: &str, locked: bool) -> DeviceResult<()> {
        if locked {
            self.lock(address).await
        } else {
            self.unlock(address).await
        }
    }
}

/// Pushes device state to observers with latest-value semantics
#[async_trait]
pub trait StatePublisher: Send + Sync {
    async fn publish(&self, device_id: &DeviceId, status: DeviceStatus) -> DeviceResult<()>;

    /// Forget the retained state of a deleted device
    async fn remove(&self, device_id: &DeviceId) -> DeviceResult<()>;
}
