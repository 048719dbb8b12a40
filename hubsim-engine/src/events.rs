//! JSON payloads produced by the simulator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use hubsim_util::types::DeviceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Telemetry,
    Alert,
    FileUpload,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Telemetry => "telemetry",
            Self::Alert => "alert",
            Self::FileUpload => "fileupload",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TelemetryEvent {
    pub device_id: DeviceId,
    #[serde(rename = "Type")]
    pub event_type: EventType,
    pub telemetry_type: String,
    pub tags: Vec<String>,
    pub current: f64,
}

impl TelemetryEvent {
    pub fn new(device_id: DeviceId, telemetry_type: String, tags: Vec<String>, current: f64) -> Self {
        Self {
            device_id,
            event_type: EventType::Telemetry,
            telemetry_type,
            tags,
            current,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AlertEvent {
    pub device_id: DeviceId,
    #[serde(rename = "Type")]
    pub event_type: EventType,
    pub alert_type: String,
    pub tags: Vec<String>,
    pub severity: i64,
}

impl AlertEvent {
    pub fn new(device_id: DeviceId, alert_type: String, tags: Vec<String>, severity: i64) -> Self {
        Self {
            device_id,
            event_type: EventType::Alert,
            alert_type,
            tags,
            severity,
        }
    }
}

/// File upload notification forwarded to an HTTP callback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FileUploadEvent {
    #[serde(rename = "Type")]
    pub event_type: EventType,
    pub blob_name: String,
    pub blob_uri: String,
    pub device_id: DeviceId,
    pub enqueued_time_utc: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn it_serializes_telemetry_events() {
        let event = TelemetryEvent::new(
            DeviceId::from("dev1"),
            "temperature".into(),
            vec!["temperature".into()],
            25.5,
        );
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "DeviceId": "dev1",
                "Type": "telemetry",
                "TelemetryType": "temperature",
                "Tags": ["temperature"],
                "Current": 25.5
            })
        );
    }

    #[test]
    fn it_serializes_alert_events() {
        let event = AlertEvent::new(DeviceId::from("dev1"), "overheat".into(), vec![], 80);
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "DeviceId": "dev1",
                "Type": "alert",
                "AlertType": "overheat",
                "Tags": [],
                "Severity": 80
            })
        );
    }

    #[test]
    fn it_serializes_file_upload_events() {
        let event = FileUploadEvent {
            event_type: EventType::FileUpload,
            blob_name: "dev1/report.txt".into(),
            blob_uri: "https://hub/uploads/dev1/report.txt".into(),
            device_id: DeviceId::from("dev1"),
            enqueued_time_utc: "2024-05-01T10:00:00Z".parse().unwrap(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["Type"], "fileupload");
        assert_eq!(value["BlobName"], "dev1/report.txt");
        assert_eq!(value["EnqueuedTimeUtc"], "2024-05-01T10:00:00Z");
    }
}
