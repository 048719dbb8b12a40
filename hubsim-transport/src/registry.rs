use async_trait::async_trait;

use hubsim_util::types::DeviceId;

use crate::error::TransportError;
use crate::model::{DeviceRecord, TwinPatch, TwinSnapshot};

/// Identity registry and twin management operations
#[async_trait]
pub trait RegistryTransport: Send + Sync {
    async fn add_device(&self, device_id: &DeviceId) -> Result<DeviceRecord, TransportError>;

    async fn get_device(&self, device_id: &DeviceId) -> Result<DeviceRecord, TransportError>;

    async fn list_devices(&self, max: usize) -> Result<Vec<DeviceRecord>, TransportError>;

    /// Replace the registry entry, ignoring any concurrent changes
    async fn update_device(&self, device: &DeviceRecord) -> Result<DeviceRecord, TransportError>;

    async fn remove_device(&self, device_id: &DeviceId) -> Result<(), TransportError>;

    async fn get_twin(&self, device_id: &DeviceId) -> Result<TwinSnapshot, TransportError>;

    async fn update_twin(
        &self,
        device_id: &DeviceId,
        patch: TwinPatch,
    ) -> Result<TwinSnapshot, TransportError>;
}
