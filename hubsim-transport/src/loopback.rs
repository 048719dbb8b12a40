//! In-process hub used for offline simulation and tests
//!
//! The hub keeps every registered device, its twin and its message queue in
//! memory. Device handles and the service handle share the same state, so a
//! message sent through [`LoopbackService`] can be received by the matching
//! [`LoopbackDevice`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, trace, warn};

use hubsim_util::crypto::random_key;
use hubsim_util::types::{DeviceId, SharedAccessKey};

use crate::device::{DesiredUpdates, DeviceTransport};
use crate::error::TransportError;
use crate::model::{
    AckMode, DeviceRecord, DeviceStatus, FeedbackBatch, FeedbackRecord, FeedbackStatus,
    FileNotification, InboundMessage, MethodCall, MethodRequest, MethodResponse, OutboundMessage,
    PropertyBag, PropertyMap, TwinPatch, TwinSnapshot,
};
use crate::registry::RegistryTransport;
use crate::service::ServiceTransport;

/// Messages delivered more times than this are dead-lettered
const MAX_DELIVERY_COUNT: u32 = 10;

const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

/// Received messages go back to the queue if not settled within this time
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// An event sent by a device
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub event_type: String,
    pub body: Vec<u8>,
}

impl RecordedEvent {
    pub fn json(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

struct QueuedMessage {
    message: OutboundMessage,
    delivery_count: u32,
}

struct LockedMessage {
    queued: QueuedMessage,
    expires_at: Instant,
}

struct DeviceEntry {
    record: DeviceRecord,
    connected: bool,
    queue: VecDeque<QueuedMessage>,
    locked: HashMap<String, LockedMessage>,
    events: Vec<RecordedEvent>,
    blobs: HashMap<String, Vec<u8>>,
    tags: PropertyBag,
    desired: PropertyBag,
    reported: PropertyBag,
    subscribers: Vec<mpsc::UnboundedSender<PropertyBag>>,
    methods: HashMap<String, mpsc::Sender<MethodCall>>,
    inbox: Arc<Notify>,
}

impl DeviceEntry {
    fn new(record: DeviceRecord) -> Self {
        Self {
            record,
            connected: false,
            queue: VecDeque::new(),
            locked: HashMap::new(),
            events: Vec::new(),
            blobs: HashMap::new(),
            tags: PropertyBag::default(),
            desired: PropertyBag::default(),
            reported: PropertyBag::default(),
            subscribers: Vec::new(),
            methods: HashMap::new(),
            inbox: Arc::new(Notify::new()),
        }
    }

    fn twin(&self) -> TwinSnapshot {
        TwinSnapshot {
            device_id: self.record.device_id.clone(),
            tags: self.tags.clone(),
            desired: self.desired.clone(),
            reported: self.reported.clone(),
        }
    }

    // Requeue received messages whose lock expired, oldest delivery first
    fn release_expired_locks(&mut self, now: Instant) {
        let mut expired: Vec<_> = self
            .locked
            .iter()
            .filter(|(_, locked)| locked.expires_at <= now)
            .map(|(token, locked)| (locked.expires_at, token.clone()))
            .collect();
        if expired.is_empty() {
            return;
        }
        expired.sort();
        for (_, token) in expired.into_iter().rev() {
            if let Some(locked) = self.locked.remove(&token) {
                trace!(message_id = %locked.queued.message.message_id, "lock expired");
                self.queue.push_front(locked.queued);
            }
        }
    }

    fn disconnect(&mut self) {
        self.connected = false;
        self.subscribers.clear();
        self.methods.clear();
    }
}

#[derive(Default)]
struct HubState {
    devices: BTreeMap<DeviceId, DeviceEntry>,
    feedback: VecDeque<FeedbackRecord>,
    feedback_locked: HashMap<String, Vec<FeedbackRecord>>,
    notifications: VecDeque<FileNotification>,
    notifications_locked: HashMap<String, FileNotification>,
}

impl HubState {
    fn device_mut(&mut self, device_id: &DeviceId) -> Result<&mut DeviceEntry, TransportError> {
        self.devices
            .get_mut(device_id)
            .ok_or_else(|| TransportError::NotFound(format!("device {device_id}")))
    }

    fn connected_device(&mut self, device_id: &DeviceId) -> Result<&mut DeviceEntry, TransportError> {
        let device = self.device_mut(device_id)?;
        if !device.connected {
            return Err(TransportError::Closed);
        }
        Ok(device)
    }

    fn register(&mut self, device_id: &DeviceId) -> &mut DeviceEntry {
        self.devices.entry(device_id.clone()).or_insert_with(|| {
            debug!(device_id = %device_id, "registering device");
            let mut record = DeviceRecord::new(device_id.clone());
            record.generation_id = uuid::Uuid::new_v4().simple().to_string();
            record.etag = uuid::Uuid::new_v4().simple().to_string();
            record.primary_key = Some(SharedAccessKey::from(random_key()));
            record.secondary_key = Some(SharedAccessKey::from(random_key()));
            DeviceEntry::new(record)
        })
    }
}

struct Inner {
    host_name: String,
    receive_timeout: Duration,
    state: Mutex<HubState>,
    feedback_ready: Notify,
    notification_ready: Notify,
}

/// An in-memory hub implementing the device, service and registry
/// capabilities
#[derive(Clone)]
pub struct LoopbackHub {
    inner: Arc<Inner>,
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new("loopback")
    }
}

impl LoopbackHub {
    pub fn new(host_name: impl Into<String>) -> Self {
        Self::with_receive_timeout(host_name, DEFAULT_RECEIVE_TIMEOUT)
    }

    /// Create a hub where blocking receives give up after `receive_timeout`
    pub fn with_receive_timeout(host_name: impl Into<String>, receive_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                host_name: host_name.into(),
                receive_timeout,
                state: Mutex::new(HubState::default()),
                feedback_ready: Notify::new(),
                notification_ready: Notify::new(),
            }),
        }
    }

    pub fn host_name(&self) -> &str {
        &self.inner.host_name
    }

    /// Get a device side handle. The device is registered on first open if
    /// it does not exist yet.
    pub fn device(&self, device_id: DeviceId) -> LoopbackDevice {
        LoopbackDevice {
            hub: self.clone(),
            device_id,
        }
    }

    /// Get a handle with service credentials
    pub fn service(&self) -> LoopbackService {
        LoopbackService { hub: self.clone() }
    }

    /// Events sent by the device so far
    pub fn events(&self, device_id: &DeviceId) -> Vec<RecordedEvent> {
        self.state()
            .devices
            .get(device_id)
            .map(|d| d.events.clone())
            .unwrap_or_default()
    }

    /// Contents of a blob uploaded by the device
    pub fn blob(&self, device_id: &DeviceId, name: &str) -> Option<Vec<u8>> {
        self.state()
            .devices
            .get(device_id)
            .and_then(|d| d.blobs.get(name).cloned())
    }

    pub fn twin(&self, device_id: &DeviceId) -> Option<TwinSnapshot> {
        self.state().devices.get(device_id).map(DeviceEntry::twin)
    }

    /// Number of messages waiting in the device queue, excluding locked ones
    pub fn queued_messages(&self, device_id: &DeviceId) -> usize {
        self.state()
            .devices
            .get_mut(device_id)
            .map(|d| {
                d.release_expired_locks(Instant::now());
                d.queue.len()
            })
            .unwrap_or_default()
    }

    fn state(&self) -> MutexGuard<'_, HubState> {
        // the state is never left half-updated so a poisoned lock is still usable
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push_feedback(&self, state: &mut HubState, record: FeedbackRecord) {
        trace!(message_id = %record.original_message_id, status = %record.status_code, "queueing feedback");
        state.feedback.push_back(record);
        self.inner.feedback_ready.notify_one();
    }
}

/// Device side handle of a [`LoopbackHub`]
#[derive(Clone)]
pub struct LoopbackDevice {
    hub: LoopbackHub,
    device_id: DeviceId,
}

impl LoopbackDevice {
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    // Take the next deliverable message, dead-lettering any that were
    // delivered too many times.
    fn try_take(&self) -> Result<Option<InboundMessage>, TransportError> {
        let mut state = self.hub.state();
        let mut dead = Vec::new();
        let taken = {
            let device = state.connected_device(&self.device_id)?;
            device.release_expired_locks(Instant::now());
            loop {
                let Some(mut queued) = device.queue.pop_front() else {
                    break None;
                };
                queued.delivery_count += 1;
                if queued.delivery_count > MAX_DELIVERY_COUNT {
                    warn!(message_id = %queued.message.message_id, "delivery count exceeded");
                    dead.push(queued.message);
                    continue;
                }

                let lock_token = uuid::Uuid::new_v4().to_string();
                let message = InboundMessage {
                    message_id: queued.message.message_id.clone(),
                    lock_token: lock_token.clone(),
                    correlation_id: queued.message.correlation_id.clone(),
                    body: queued.message.body.clone(),
                };
                let locked = LockedMessage {
                    queued,
                    expires_at: Instant::now() + LOCK_TIMEOUT,
                };
                device.locked.insert(lock_token, locked);
                break Some(message);
            }
        };

        for message in dead {
            if message.ack == AckMode::Full {
                let record = FeedbackRecord::new(
                    self.device_id.clone(),
                    message.message_id,
                    FeedbackStatus::DeliveryCountExceeded,
                );
                self.hub.push_feedback(&mut state, record);
            }
        }
        Ok(taken)
    }

    fn take_locked(&self, message: &InboundMessage) -> Result<QueuedMessage, TransportError> {
        let mut state = self.hub.state();
        let device = state.connected_device(&self.device_id)?;
        device.release_expired_locks(Instant::now());
        device
            .locked
            .remove(&message.lock_token)
            .map(|locked| locked.queued)
            .ok_or_else(|| TransportError::NotFound(format!("lock token {}", message.lock_token)))
    }
}

#[async_trait]
impl DeviceTransport for LoopbackDevice {
    async fn open(&self) -> Result<(), TransportError> {
        let mut state = self.hub.state();
        let device = state.register(&self.device_id);
        if device.record.status == DeviceStatus::Disabled {
            return Err(TransportError::Unauthorized);
        }
        device.connected = true;
        debug!(device_id = %self.device_id, "device connected");
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.hub.state();
        if let Some(device) = state.devices.get_mut(&self.device_id) {
            device.disconnect();
            device.inbox.notify_waiters();
        }
        debug!(device_id = %self.device_id, "device disconnected");
        Ok(())
    }

    async fn send_event(&self, body: Vec<u8>, event_type: &str) -> Result<(), TransportError> {
        let mut state = self.hub.state();
        let device = state.connected_device(&self.device_id)?;
        device.events.push(RecordedEvent {
            event_type: event_type.to_owned(),
            body,
        });
        Ok(())
    }

    async fn receive(&self) -> Result<Option<InboundMessage>, TransportError> {
        let deadline = Instant::now() + self.hub.inner.receive_timeout;
        let inbox = {
            let mut state = self.hub.state();
            state.connected_device(&self.device_id)?.inbox.clone()
        };

        loop {
            if let Some(message) = self.try_take()? {
                return Ok(Some(message));
            }
            if timeout_at(deadline, inbox.notified()).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn complete(&self, message: &InboundMessage) -> Result<(), TransportError> {
        let queued = self.take_locked(message)?;
        if queued.message.ack == AckMode::Full {
            let mut state = self.hub.state();
            let record = FeedbackRecord::new(
                self.device_id.clone(),
                queued.message.message_id,
                FeedbackStatus::Success,
            );
            self.hub.push_feedback(&mut state, record);
        }
        Ok(())
    }

    async fn abandon(&self, message: &InboundMessage) -> Result<(), TransportError> {
        let queued = self.take_locked(message)?;
        let mut state = self.hub.state();
        let device = state.connected_device(&self.device_id)?;
        device.queue.push_front(queued);
        device.inbox.notify_one();
        Ok(())
    }

    async fn upload_blob(&self, name: &str, data: Vec<u8>) -> Result<(), TransportError> {
        let mut state = self.hub.state();
        let host = self.hub.host_name().to_owned();
        let device = state.connected_device(&self.device_id)?;
        let blob_name = format!("{}/{}", self.device_id, name);
        let notification = FileNotification {
            device_id: self.device_id.clone(),
            blob_uri: format!("https://{host}/uploads/{blob_name}"),
            blob_name,
            blob_size_in_bytes: data.len() as u64,
            enqueued_time_utc: Utc::now(),
            lock_token: String::new(),
        };
        device.blobs.insert(name.to_owned(), data);
        state.notifications.push_back(notification);
        self.hub.inner.notification_ready.notify_one();
        Ok(())
    }

    async fn get_twin(&self) -> Result<TwinSnapshot, TransportError> {
        let mut state = self.hub.state();
        Ok(state.connected_device(&self.device_id)?.twin())
    }

    async fn update_reported_properties(
        &self,
        patch: PropertyMap,
        if_version: Option<u64>,
    ) -> Result<u64, TransportError> {
        let mut state = self.hub.state();
        let device = state.connected_device(&self.device_id)?;
        if let Some(version) = if_version
            && version != device.reported.version
        {
            return Err(TransportError::PreconditionFailed);
        }
        device.reported.merge(&patch);
        device.reported.version += 1;
        Ok(device.reported.version)
    }

    async fn subscribe_desired_properties(&self) -> Result<DesiredUpdates, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.hub.state();
        state.connected_device(&self.device_id)?.subscribers.push(tx);
        Ok(rx)
    }

    async fn register_method_handler(
        &self,
        name: &str,
        calls: mpsc::Sender<MethodCall>,
    ) -> Result<(), TransportError> {
        let mut state = self.hub.state();
        let device = state.connected_device(&self.device_id)?;
        device.methods.insert(name.to_lowercase(), calls);
        Ok(())
    }
}

/// Service side handle of a [`LoopbackHub`]
#[derive(Clone)]
pub struct LoopbackService {
    hub: LoopbackHub,
}

#[async_trait]
impl ServiceTransport for LoopbackService {
    async fn open(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn send(
        &self,
        device_id: &DeviceId,
        message: OutboundMessage,
    ) -> Result<(), TransportError> {
        let mut state = self.hub.state();
        let device = state.device_mut(device_id)?;
        device.queue.push_back(QueuedMessage {
            message,
            delivery_count: 0,
        });
        device.inbox.notify_one();
        Ok(())
    }

    async fn receive_feedback(&self) -> Result<Option<FeedbackBatch>, TransportError> {
        let deadline = Instant::now() + self.hub.inner.receive_timeout;
        loop {
            {
                let mut state = self.hub.state();
                if !state.feedback.is_empty() {
                    let records: Vec<_> = state.feedback.drain(..).collect();
                    let lock_token = uuid::Uuid::new_v4().to_string();
                    state
                        .feedback_locked
                        .insert(lock_token.clone(), records.clone());
                    return Ok(Some(FeedbackBatch {
                        lock_token,
                        records,
                    }));
                }
            }
            if timeout_at(deadline, self.hub.inner.feedback_ready.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }

    async fn complete_feedback(&self, batch: &FeedbackBatch) -> Result<(), TransportError> {
        let mut state = self.hub.state();
        state
            .feedback_locked
            .remove(&batch.lock_token)
            .map(|_| ())
            .ok_or_else(|| TransportError::NotFound(format!("lock token {}", batch.lock_token)))
    }

    async fn abandon_feedback(&self, batch: &FeedbackBatch) -> Result<(), TransportError> {
        let mut state = self.hub.state();
        let records = state
            .feedback_locked
            .remove(&batch.lock_token)
            .ok_or_else(|| TransportError::NotFound(format!("lock token {}", batch.lock_token)))?;
        for record in records.into_iter().rev() {
            state.feedback.push_front(record);
        }
        self.hub.inner.feedback_ready.notify_one();
        Ok(())
    }

    async fn invoke_method(
        &self,
        device_id: &DeviceId,
        request: MethodRequest,
        wait: Duration,
    ) -> Result<MethodResponse, TransportError> {
        let handler = {
            let mut state = self.hub.state();
            let device = state.device_mut(device_id)?;
            device.methods.get(&request.name.to_lowercase()).cloned()
        };
        let Some(handler) = handler else {
            return Err(TransportError::Status(
                404,
                format!("method '{}' is not registered", request.name),
            ));
        };

        let (responder, response) = oneshot::channel();
        handler
            .send(MethodCall { request, responder })
            .await
            .map_err(|_| TransportError::MethodFailed("method handler is gone".into()))?;

        match timeout(wait, response).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(TransportError::MethodFailed(
                "method handler dropped the invocation".into(),
            )),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn receive_file_notification(
        &self,
    ) -> Result<Option<FileNotification>, TransportError> {
        let deadline = Instant::now() + self.hub.inner.receive_timeout;
        loop {
            {
                let mut state = self.hub.state();
                if let Some(mut notification) = state.notifications.pop_front() {
                    notification.lock_token = uuid::Uuid::new_v4().to_string();
                    state
                        .notifications_locked
                        .insert(notification.lock_token.clone(), notification.clone());
                    return Ok(Some(notification));
                }
            }
            if timeout_at(deadline, self.hub.inner.notification_ready.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }

    async fn complete_file_notification(
        &self,
        notification: &FileNotification,
    ) -> Result<(), TransportError> {
        let mut state = self.hub.state();
        state
            .notifications_locked
            .remove(&notification.lock_token)
            .map(|_| ())
            .ok_or_else(|| {
                TransportError::NotFound(format!("lock token {}", notification.lock_token))
            })
    }

    async fn purge_message_queue(&self, device_id: &DeviceId) -> Result<u64, TransportError> {
        let mut state = self.hub.state();
        let device = state.device_mut(device_id)?;
        let purged: Vec<_> = device.queue.drain(..).map(|q| q.message).collect();
        let count = purged.len() as u64;
        for message in purged {
            if message.ack == AckMode::Full {
                let record =
                    FeedbackRecord::new(device_id.clone(), message.message_id, FeedbackStatus::Purged);
                self.hub.push_feedback(&mut state, record);
            }
        }
        Ok(count)
    }
}

#[async_trait]
impl RegistryTransport for LoopbackService {
    async fn add_device(&self, device_id: &DeviceId) -> Result<DeviceRecord, TransportError> {
        let mut state = self.hub.state();
        if state.devices.contains_key(device_id) {
            return Err(TransportError::Status(
                409,
                format!("device {device_id} already exists"),
            ));
        }
        Ok(state.register(device_id).record.clone())
    }

    async fn get_device(&self, device_id: &DeviceId) -> Result<DeviceRecord, TransportError> {
        let mut state = self.hub.state();
        Ok(state.device_mut(device_id)?.record.clone())
    }

    async fn list_devices(&self, max: usize) -> Result<Vec<DeviceRecord>, TransportError> {
        let state = self.hub.state();
        Ok(state
            .devices
            .values()
            .take(max)
            .map(|d| d.record.clone())
            .collect())
    }

    async fn update_device(&self, device: &DeviceRecord) -> Result<DeviceRecord, TransportError> {
        let mut state = self.hub.state();
        let entry = state.device_mut(&device.device_id)?;
        entry.record.status = device.status;
        entry.record.status_reason = device.status_reason.clone();
        if device.primary_key.is_some() {
            entry.record.primary_key = device.primary_key.clone();
        }
        if device.secondary_key.is_some() {
            entry.record.secondary_key = device.secondary_key.clone();
        }
        entry.record.etag = uuid::Uuid::new_v4().simple().to_string();
        if entry.record.status == DeviceStatus::Disabled {
            entry.disconnect();
        }
        Ok(entry.record.clone())
    }

    async fn remove_device(&self, device_id: &DeviceId) -> Result<(), TransportError> {
        let mut state = self.hub.state();
        let mut device = state
            .devices
            .remove(device_id)
            .ok_or_else(|| TransportError::NotFound(format!("device {device_id}")))?;
        device.disconnect();
        device.inbox.notify_waiters();
        Ok(())
    }

    async fn get_twin(&self, device_id: &DeviceId) -> Result<TwinSnapshot, TransportError> {
        let mut state = self.hub.state();
        Ok(state.device_mut(device_id)?.twin())
    }

    async fn update_twin(
        &self,
        device_id: &DeviceId,
        patch: TwinPatch,
    ) -> Result<TwinSnapshot, TransportError> {
        let mut state = self.hub.state();
        let device = state.device_mut(device_id)?;
        if let Some(tags) = &patch.tags {
            device.tags.merge(tags);
            device.tags.version += 1;
        }
        if let Some(desired) = patch.desired {
            device.desired.merge(&desired);
            device.desired.version += 1;
            let delta = PropertyBag::new(desired, device.desired.version);
            device
                .subscribers
                .retain(|subscriber| subscriber.send(delta.clone()).is_ok());
        }
        Ok(device.twin())
    }
}
