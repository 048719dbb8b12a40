//! Loopback connections with injected failures and delays

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use hubsim_transport::loopback::{LoopbackDevice, LoopbackHub, LoopbackService};
use hubsim_transport::{
    DesiredUpdates, DeviceTransport, FeedbackBatch, FileNotification, InboundMessage, MethodCall,
    MethodRequest, MethodResponse, OutboundMessage, PropertyMap, RegistryTransport,
    ServiceTransport, TransportError, TwinPatch, TwinSnapshot,
};
use hubsim_util::types::DeviceId;

/// Fails the calls of one operation while failures remain
#[derive(Debug, Default)]
pub(crate) struct Faults {
    remaining: AtomicU32,
    fatal: bool,
    calls: AtomicU32,
}

impl Faults {
    /// Fail the first `times` calls with a server error
    pub fn transient(times: u32) -> Self {
        Self {
            remaining: AtomicU32::new(times),
            ..Self::default()
        }
    }

    /// Fail every call with a server error
    pub fn unavailable() -> Self {
        Self::transient(u32::MAX)
    }

    /// Fail every call with an error that retrying cannot fix
    pub fn fatal() -> Self {
        Self {
            fatal: true,
            ..Self::unavailable()
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                0 => None,
                u32::MAX => Some(u32::MAX),
                n => Some(n - 1),
            })
            .is_ok();
        match (failing, self.fatal) {
            (false, _) => Ok(()),
            (true, false) => Err(TransportError::Status(503, "busy".into())),
            (true, true) => Err(TransportError::Unauthorized),
        }
    }
}

/// Device connection to a loopback hub
pub(crate) struct FlakyDevice {
    pub device: LoopbackDevice,
    pub hub: LoopbackHub,
    pub receive: Faults,
    pub reported: Faults,
    /// Desired change made by the service right after the next twin read
    pub desired_after_read: Mutex<Option<TwinPatch>>,
    pub open_delay: Duration,
    pub send_delay: Duration,
}

impl FlakyDevice {
    pub fn new(hub: &LoopbackHub, device_id: DeviceId) -> Self {
        Self {
            device: hub.device(device_id),
            hub: hub.clone(),
            receive: Faults::default(),
            reported: Faults::default(),
            desired_after_read: Mutex::new(None),
            open_delay: Duration::ZERO,
            send_delay: Duration::ZERO,
        }
    }
}

#[async_trait]
impl DeviceTransport for FlakyDevice {
    async fn open(&self) -> Result<(), TransportError> {
        tokio::time::sleep(self.open_delay).await;
        self.device.open().await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.device.close().await
    }

    async fn send_event(&self, body: Vec<u8>, event_type: &str) -> Result<(), TransportError> {
        tokio::time::sleep(self.send_delay).await;
        self.device.send_event(body, event_type).await
    }

    async fn receive(&self) -> Result<Option<InboundMessage>, TransportError> {
        self.receive.check()?;
        self.device.receive().await
    }

    async fn complete(&self, message: &InboundMessage) -> Result<(), TransportError> {
        self.device.complete(message).await
    }

    async fn abandon(&self, message: &InboundMessage) -> Result<(), TransportError> {
        self.device.abandon(message).await
    }

    async fn upload_blob(&self, name: &str, data: Vec<u8>) -> Result<(), TransportError> {
        self.device.upload_blob(name, data).await
    }

    async fn get_twin(&self) -> Result<TwinSnapshot, TransportError> {
        let twin = self.device.get_twin().await?;
        let patch = self.desired_after_read.lock().unwrap().take();
        if let Some(patch) = patch {
            self.hub
                .service()
                .update_twin(self.device.device_id(), patch)
                .await?;
        }
        Ok(twin)
    }

    async fn update_reported_properties(
        &self,
        patch: PropertyMap,
        if_version: Option<u64>,
    ) -> Result<u64, TransportError> {
        self.reported.check()?;
        self.device.update_reported_properties(patch, if_version).await
    }

    async fn subscribe_desired_properties(&self) -> Result<DesiredUpdates, TransportError> {
        self.device.subscribe_desired_properties().await
    }

    async fn register_method_handler(
        &self,
        name: &str,
        calls: mpsc::Sender<MethodCall>,
    ) -> Result<(), TransportError> {
        self.device.register_method_handler(name, calls).await
    }
}

/// Service connection to a loopback hub
pub(crate) struct FlakyService {
    pub service: LoopbackService,
    pub feedback: Faults,
}

impl FlakyService {
    pub fn new(hub: &LoopbackHub) -> Self {
        Self {
            service: hub.service(),
            feedback: Faults::default(),
        }
    }
}

#[async_trait]
impl ServiceTransport for FlakyService {
    async fn open(&self) -> Result<(), TransportError> {
        self.service.open().await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.service.close().await
    }

    async fn send(
        &self,
        device_id: &DeviceId,
        message: OutboundMessage,
    ) -> Result<(), TransportError> {
        self.service.send(device_id, message).await
    }

    async fn receive_feedback(&self) -> Result<Option<FeedbackBatch>, TransportError> {
        self.feedback.check()?;
        self.service.receive_feedback().await
    }

    async fn complete_feedback(&self, batch: &FeedbackBatch) -> Result<(), TransportError> {
        self.service.complete_feedback(batch).await
    }

    async fn abandon_feedback(&self, batch: &FeedbackBatch) -> Result<(), TransportError> {
        self.service.abandon_feedback(batch).await
    }

    async fn invoke_method(
        &self,
        device_id: &DeviceId,
        request: MethodRequest,
        timeout: Duration,
    ) -> Result<MethodResponse, TransportError> {
        self.service.invoke_method(device_id, request, timeout).await
    }

    async fn receive_file_notification(
        &self,
    ) -> Result<Option<FileNotification>, TransportError> {
        self.service.receive_file_notification().await
    }

    async fn complete_file_notification(
        &self,
        notification: &FileNotification,
    ) -> Result<(), TransportError> {
        self.service.complete_file_notification(notification).await
    }

    async fn purge_message_queue(&self, device_id: &DeviceId) -> Result<u64, TransportError> {
        self.service.purge_message_queue(device_id).await
    }
}
