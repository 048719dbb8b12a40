use std::time::Duration;

use async_trait::async_trait;

use hubsim_util::types::DeviceId;

use crate::error::TransportError;
use crate::model::{
    FeedbackBatch, FileNotification, MethodRequest, MethodResponse, OutboundMessage,
};

/// Hub messaging operations available with a service policy
#[async_trait]
pub trait ServiceTransport: Send + Sync {
    async fn open(&self) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;

    async fn send(&self, device_id: &DeviceId, message: OutboundMessage)
    -> Result<(), TransportError>;

    /// Wait for the next batch of delivery feedback, returns `None` on an
    /// idle poll
    async fn receive_feedback(&self) -> Result<Option<FeedbackBatch>, TransportError>;

    async fn complete_feedback(&self, batch: &FeedbackBatch) -> Result<(), TransportError>;

    async fn abandon_feedback(&self, batch: &FeedbackBatch) -> Result<(), TransportError>;

    async fn invoke_method(
        &self,
        device_id: &DeviceId,
        request: MethodRequest,
        timeout: Duration,
    ) -> Result<MethodResponse, TransportError>;

    async fn receive_file_notification(&self)
    -> Result<Option<FileNotification>, TransportError>;

    async fn complete_file_notification(
        &self,
        notification: &FileNotification,
    ) -> Result<(), TransportError>;

    /// Drop every pending cloud-to-device message for the device, returning
    /// how many were removed
    async fn purge_message_queue(&self, device_id: &DeviceId) -> Result<u64, TransportError>;
}
