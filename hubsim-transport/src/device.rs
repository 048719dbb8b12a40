use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::model::{InboundMessage, MethodCall, PropertyBag, PropertyMap, TwinSnapshot};

/// Stream of desired property deltas pushed by the hub
pub type DesiredUpdates = mpsc::UnboundedReceiver<PropertyBag>;

/// Hub operations available with device credentials
///
/// Implementations must be usable concurrently from several tasks. The
/// connection must be opened before any other operation is used.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    async fn open(&self) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;

    /// Send a device-to-cloud event. The event type is attached as an
    /// application property.
    async fn send_event(&self, body: Vec<u8>, event_type: &str) -> Result<(), TransportError>;

    /// Wait for the next cloud-to-device message.
    ///
    /// Returns `None` if nothing arrived during the transport poll window.
    async fn receive(&self) -> Result<Option<InboundMessage>, TransportError>;

    /// Remove a received message from the device queue
    async fn complete(&self, message: &InboundMessage) -> Result<(), TransportError>;

    /// Return a received message to the device queue for redelivery
    async fn abandon(&self, message: &InboundMessage) -> Result<(), TransportError>;

    async fn upload_blob(&self, name: &str, data: Vec<u8>) -> Result<(), TransportError>;

    async fn get_twin(&self) -> Result<TwinSnapshot, TransportError>;

    /// Patch the reported properties and return the new reported version.
    ///
    /// When `if_version` is given the update only succeeds if it matches the
    /// current reported version.
    async fn update_reported_properties(
        &self,
        patch: PropertyMap,
        if_version: Option<u64>,
    ) -> Result<u64, TransportError>;

    async fn subscribe_desired_properties(&self) -> Result<DesiredUpdates, TransportError>;

    /// Route invocations of the named method into the given channel
    async fn register_method_handler(
        &self,
        name: &str,
        calls: mpsc::Sender<MethodCall>,
    ) -> Result<(), TransportError>;
}
