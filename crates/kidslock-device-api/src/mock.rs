//! Mock device collaborators for testing

use async_trait::async_trait;
use kidslock_api::DeviceStatus;
use kidslock_util::DeviceId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::{DeviceError, DeviceResult, ReachabilityProber, RemoteControl, StatePublisher};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mock prober with per-address answers
#[derive(Clone)]
pub struct MockProber {
    /// Answer for addresses not listed in `reachable`
    pub default_reachable: Arc<Mutex<bool>>,
    pub reachable: Arc<Mutex<HashMap<String, bool>>>,
    probes: Arc<Mutex<Vec<String>>>,
}

impl MockProber {
    pub fn new(default_reachable: bool) -> Self {
        Self {
            default_reachable: Arc::new(Mutex::new(default_reachable)),
            reachable: Arc::new(Mutex::new(HashMap::new())),
            probes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn set_reachable(&self, address: &str, reachable: bool) {
        lock(&self.reachable).insert(address.to_string(), reachable);
    }

    /// Addresses probed so far, in order
    pub fn probes(&self) -> Vec<String> {
        lock(&self.probes).clone()
    }
}

impl Default for MockProber {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait]
impl ReachabilityProber for MockProber {
    async fn is_reachable(&self, address: &str) -> bool {
        lock(&self.probes).push(address.to_string());
        let listed = lock(&self.reachable).get(address).copied();
        listed.unwrap_or_else(|| *lock(&self.default_reachable))
    }
}

/// A command observed by [`MockRemote`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentCommand {
    pub address: String,
    pub locked: bool,
}

/// Mock remote control that records commands and tracks device state
#[derive(Clone)]
pub struct MockRemote {
    sent: Arc<Mutex<Vec<SentCommand>>>,
    /// Lock state as the devices themselves see it
    pub device_locked: Arc<Mutex<HashMap<String, bool>>>,

    /// Configure lock/unlock to fail
    pub fail_commands: Arc<Mutex<bool>>,

    /// Configure status reads to fail
    pub fail_status: Arc<Mutex<bool>>,

    /// Delay every command (to exercise timeouts)
    pub command_delay: Arc<Mutex<Option<Duration>>>,
}

impl MockRemote {
    pub fn new() -> Self {
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            device_locked: Arc::new(Mutex::new(HashMap::new())),
            fail_commands: Arc::new(Mutex::new(false)),
            fail_status: Arc::new(Mutex::new(false)),
            command_delay: Arc::new(Mutex::new(None)),
        }
    }

    /// Every command sent so far, in order
    pub fn sent(&self) -> Vec<SentCommand> {
        lock(&self.sent).clone()
    }

    pub fn clear_sent(&self) {
        lock(&self.sent).clear();
    }

    pub fn set_fail_commands(&self, fail: bool) {
        *lock(&self.fail_commands) = fail;
    }

    pub fn set_command_delay(&self, delay: Option<Duration>) {
        *lock(&self.command_delay) = delay;
    }

    /// Change the device-side state without a command, simulating drift
    pub fn set_device_locked(&self, address: &str, locked: bool) {
        lock(&self.device_locked).insert(address.to_string(), locked);
    }

    async fn command(&self, address: &str, locked: bool) -> DeviceResult<()> {
        let delay = *lock(&self.command_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        lock(&self.sent).push(SentCommand {
            address: address.to_string(),
            locked,
        });

        if *lock(&self.fail_commands) {
            return Err(DeviceError::Unreachable(format!("mock failure for {}", address)));
        }

        lock(&self.device_locked).insert(address.to_string(), locked);
        Ok(())
    }
}

impl Default for MockRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteControl for MockRemote {
    async fn lock(&self, address: &str) -> DeviceResult<()> {
        self.command(address, true).await
    }

    async fn unlock(&self, address: &str) -> DeviceResult<()> {
        self.command(address, false).await
    }

    async fn status(&self, address: &str) -> DeviceResult<bool> {
        if *lock(&self.fail_status) {
            return Err(DeviceError::InvalidResponse("mock status failure".into()));
        }
        Ok(lock(&self.device_locked).get(address).copied().unwrap_or(false))
    }
}

/// Mock publisher that keeps a history and the retained value per device
#[derive(Clone, Default)]
pub struct MockPublisher {
    history: Arc<Mutex<Vec<(DeviceId, DeviceStatus)>>>,
    retained: Arc<Mutex<HashMap<DeviceId, DeviceStatus>>>,

    /// Configure publish to fail
    pub fail_publish: Arc<Mutex<bool>>,
}

impl MockPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self) -> Vec<(DeviceId, DeviceStatus)> {
        lock(&self.history).clone()
    }

    pub fn retained(&self, device_id: &DeviceId) -> Option<DeviceStatus> {
        lock(&self.retained).get(device_id).copied()
    }
}

#[async_trait]
impl StatePublisher for MockPublisher {
    async fn publish(&self, device_id: &DeviceId, status: DeviceStatus) -> DeviceResult<()> {
        if *lock(&self.fail_publish) {
            return Err(DeviceError::Publish("mock publish failure".into()));
        }
        lock(&self.history).push((device_id.clone(), status));
        lock(&self.retained).insert(device_id.clone(), status);
        Ok(())
    }

    async fn remove(&self, device_id: &DeviceId) -> DeviceResult<()> {
        lock(&self.retained).remove(device_id);
        Ok(())
    }
}
