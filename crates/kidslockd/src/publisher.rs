//! Device state bus over the IPC event stream

use async_trait::async_trait;
use kidslock_api::{DeviceStatus, Event, EventPayload, RetainedState};
use kidslock_device_api::{DeviceResult, StatePublisher};
use kidslock_ipc::IpcServer;
use kidslock_util::DeviceId;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Broadcasts device state to subscribers and keeps the latest value per
/// device, which new subscribers receive on subscribing
pub struct IpcPublisher {
    ipc: Arc<IpcServer>,
    retained: RwLock<BTreeMap<DeviceId, DeviceStatus>>,
}

impl IpcPublisher {
    pub fn new(ipc: Arc<IpcServer>) -> Self {
        Self {
            ipc,
            retained: RwLock::new(BTreeMap::new()),
        }
    }

    pub async fn retained(&self) -> Vec<RetainedState> {
        self.retained
            .read()
            .await
            .iter()
            .map(|(device_id, status)| RetainedState {
                device_id: device_id.clone(),
                status: *status,
            })
            .collect()
    }
}

#[async_trait]
impl StatePublisher for IpcPublisher {
    async fn publish(&self, device_id: &DeviceId, status: DeviceStatus) -> DeviceResult<()> {
        self.retained.write().await.insert(device_id.clone(), status);
        self.ipc.broadcast_event(Event::new(EventPayload::DeviceState {
            device_id: device_id.clone(),
            status,
        }));
        Ok(())
    }

    async fn remove(&self, device_id: &DeviceId) -> DeviceResult<()> {
        self.retained.write().await.remove(device_id);
        self.ipc.broadcast_event(Event::new(EventPayload::DeviceRemoved {
            device_id: device_id.clone(),
        }));
        Ok(())
    }
}
