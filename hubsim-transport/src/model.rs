use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::oneshot;

use hubsim_util::types::{DeviceId, SharedAccessKey};

/// An untyped property collection as stored by the hub
pub type PropertyMap = Map<String, Value>;

/// A versioned section of a device twin
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertyBag {
    pub properties: PropertyMap,
    pub version: u64,
}

impl PropertyBag {
    pub fn new(properties: PropertyMap, version: u64) -> Self {
        Self {
            properties,
            version,
        }
    }

    /// Read a property bag in the hub wire format.
    ///
    /// Keys starting with `$` are hub metadata and are dropped, except for
    /// `$version` which becomes the bag version.
    pub fn from_wire(value: Value) -> Self {
        let Value::Object(map) = value else {
            return Self::default();
        };

        let mut bag = Self::default();
        for (key, value) in map {
            if key == "$version" {
                bag.version = value.as_u64().unwrap_or_default();
            } else if !key.starts_with('$') {
                bag.properties.insert(key, value);
            }
        }
        bag
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// Apply a patch using merge semantics, where a `null` value removes the
    /// property
    pub fn merge(&mut self, patch: &PropertyMap) {
        for (key, value) in patch {
            if value.is_null() {
                self.properties.remove(key);
            } else {
                self.properties.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Point in time read of a device twin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwinSnapshot {
    pub device_id: DeviceId,
    pub tags: PropertyBag,
    pub desired: PropertyBag,
    pub reported: PropertyBag,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTwin {
    device_id: DeviceId,
    #[serde(default)]
    version: u64,
    #[serde(default)]
    tags: Value,
    #[serde(default)]
    properties: WireTwinProperties,
}

#[derive(Deserialize, Default)]
struct WireTwinProperties {
    #[serde(default)]
    desired: Value,
    #[serde(default)]
    reported: Value,
}

impl TwinSnapshot {
    /// Decode a twin document as returned by the hub REST API
    pub fn from_wire(value: Value) -> Result<Self, serde_json::Error> {
        let wire: WireTwin = serde_json::from_value(value)?;
        let mut tags = PropertyBag::from_wire(wire.tags);
        tags.version = wire.version;
        Ok(Self {
            device_id: wire.device_id,
            tags,
            desired: PropertyBag::from_wire(wire.properties.desired),
            reported: PropertyBag::from_wire(wire.properties.reported),
        })
    }
}

/// A partial twin update issued with service credentials
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TwinPatch {
    pub tags: Option<PropertyMap>,
    pub desired: Option<PropertyMap>,
}

impl TwinPatch {
    pub fn tag(name: impl Into<String>, value: Value) -> Self {
        let mut tags = PropertyMap::new();
        tags.insert(name.into(), value);
        Self {
            tags: Some(tags),
            desired: None,
        }
    }

    pub fn desired(name: impl Into<String>, value: Value) -> Self {
        let mut desired = PropertyMap::new();
        desired.insert(name.into(), value);
        Self {
            tags: None,
            desired: Some(desired),
        }
    }

    /// Encode the patch in the hub wire format
    pub fn to_wire(&self) -> Value {
        let mut doc = Map::new();
        if let Some(tags) = &self.tags {
            doc.insert("tags".into(), Value::Object(tags.clone()));
        }
        if let Some(desired) = &self.desired {
            let mut properties = Map::new();
            properties.insert("desired".into(), Value::Object(desired.clone()));
            doc.insert("properties".into(), Value::Object(properties));
        }
        Value::Object(doc)
    }
}

/// A cloud-to-device message as received by the device
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub message_id: String,
    /// Opaque token identifying this delivery, used to settle the message
    pub lock_token: String,
    pub correlation_id: Option<String>,
    pub body: Vec<u8>,
}

/// Delivery acknowledgement requested for an outbound message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AckMode {
    #[default]
    None,
    Full,
}

/// A cloud-to-device message as sent by the service
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub message_id: String,
    pub correlation_id: Option<String>,
    pub body: Vec<u8>,
    pub ack: AckMode,
}

impl OutboundMessage {
    /// Create a message with a freshly generated message id
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            correlation_id: None,
            body: body.into(),
            ack: AckMode::None,
        }
    }

    pub fn with_ack(mut self, ack: AckMode) -> Self {
        self.ack = ack;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedbackStatus {
    Success,
    Expired,
    DeliveryCountExceeded,
    Rejected,
    Purged,
}

impl Display for FeedbackStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Success => "Success",
            Self::Expired => "Expired",
            Self::DeliveryCountExceeded => "DeliveryCountExceeded",
            Self::Rejected => "Rejected",
            Self::Purged => "Purged",
        };
        f.write_str(s)
    }
}

/// Delivery outcome of a message sent with [`AckMode::Full`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackRecord {
    pub device_id: DeviceId,
    pub original_message_id: String,
    pub status_code: FeedbackStatus,
    #[serde(default)]
    pub description: String,
    pub enqueued_time_utc: DateTime<Utc>,
}

impl FeedbackRecord {
    pub fn new(device_id: DeviceId, original_message_id: String, status: FeedbackStatus) -> Self {
        Self {
            device_id,
            original_message_id,
            status_code: status,
            description: status.to_string(),
            enqueued_time_utc: Utc::now(),
        }
    }
}

/// A set of feedback records settled together
#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackBatch {
    pub lock_token: String,
    pub records: Vec<FeedbackRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodRequest {
    pub name: String,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodResponse {
    pub status: i32,
    pub payload: Value,
}

/// A pending direct method invocation routed to a device handler
#[derive(Debug)]
pub struct MethodCall {
    pub request: MethodRequest,
    pub responder: oneshot::Sender<MethodResponse>,
}

impl MethodCall {
    /// Answer the invocation. Returns false if the caller is no longer
    /// waiting for the response.
    pub fn respond(self, response: MethodResponse) -> bool {
        self.responder.send(response).is_ok()
    }
}

/// Notification that a device finished uploading a blob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileNotification {
    pub device_id: DeviceId,
    pub blob_name: String,
    pub blob_uri: String,
    #[serde(default)]
    pub blob_size_in_bytes: u64,
    pub enqueued_time_utc: DateTime<Utc>,
    #[serde(skip)]
    pub lock_token: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    #[default]
    Enabled,
    Disabled,
}

impl Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Enabled => f.write_str("enabled"),
            Self::Disabled => f.write_str("disabled"),
        }
    }
}

/// A device identity in the hub registry
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    pub device_id: DeviceId,
    pub generation_id: String,
    pub etag: String,
    pub status: DeviceStatus,
    pub status_reason: Option<String>,
    pub primary_key: Option<SharedAccessKey>,
    pub secondary_key: Option<SharedAccessKey>,
}

impl DeviceRecord {
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            generation_id: String::new(),
            etag: String::new(),
            status: DeviceStatus::Enabled,
            status_reason: None,
            primary_key: None,
            secondary_key: None,
        }
    }
}
