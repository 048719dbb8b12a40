use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{instrument, trace};
use url::Url;

use hubsim_util::types::{DeviceId, SharedAccessKey};

use super::{
    DEFAULT_POLL_INTERVAL, Endpoint, check_status, client, default_base_url, expiry_from_now,
    generate_sas_token, lock_token,
};
use crate::error::TransportError;
use crate::model::{
    DeviceRecord, DeviceStatus, FeedbackBatch, FeedbackRecord, FileNotification, MethodRequest,
    MethodResponse, OutboundMessage, TwinPatch, TwinSnapshot,
};
use crate::registry::RegistryTransport;
use crate::service::ServiceTransport;

const API_VERSION: &str = "2021-04-12";

/// Service client over the hub HTTPS API, authenticated with a shared
/// access policy
#[derive(Clone)]
pub struct HttpServiceClient {
    client: Client,
    endpoint: Endpoint,
    policy_name: String,
    key: SharedAccessKey,
    poll_interval: Duration,
}

#[derive(Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct WireSymmetricKey {
    primary_key: Option<SharedAccessKey>,
    secondary_key: Option<SharedAccessKey>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireAuthentication {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    symmetric_key: WireSymmetricKey,
}

impl Default for WireAuthentication {
    fn default() -> Self {
        Self {
            kind: "sas".into(),
            symmetric_key: WireSymmetricKey::default(),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireDevice {
    device_id: DeviceId,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    generation_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    etag: String,
    #[serde(default)]
    status: DeviceStatus,
    #[serde(default)]
    status_reason: Option<String>,
    #[serde(default)]
    authentication: WireAuthentication,
}

impl From<WireDevice> for DeviceRecord {
    fn from(wire: WireDevice) -> Self {
        Self {
            device_id: wire.device_id,
            generation_id: wire.generation_id,
            etag: wire.etag,
            status: wire.status,
            status_reason: wire.status_reason,
            primary_key: wire.authentication.symmetric_key.primary_key,
            secondary_key: wire.authentication.symmetric_key.secondary_key,
        }
    }
}

impl From<&DeviceRecord> for WireDevice {
    fn from(record: &DeviceRecord) -> Self {
        Self {
            device_id: record.device_id.clone(),
            generation_id: record.generation_id.clone(),
            etag: record.etag.clone(),
            status: record.status,
            status_reason: record.status_reason.clone(),
            authentication: WireAuthentication {
                kind: "sas".into(),
                symmetric_key: WireSymmetricKey {
                    primary_key: record.primary_key.clone(),
                    secondary_key: record.secondary_key.clone(),
                },
            },
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PurgeResponse {
    total_messages_purged: u64,
}

impl HttpServiceClient {
    pub fn new(
        host_name: &str,
        policy_name: &str,
        key: SharedAccessKey,
    ) -> Result<Self, TransportError> {
        Self::with_base_url(default_base_url(host_name)?, host_name, policy_name, key)
    }

    pub fn with_base_url(
        base: Url,
        host_name: &str,
        policy_name: &str,
        key: SharedAccessKey,
    ) -> Result<Self, TransportError> {
        Ok(Self {
            client: client()?,
            endpoint: Endpoint::new(base, host_name, API_VERSION),
            policy_name: policy_name.to_owned(),
            key,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn token(&self) -> Result<String, TransportError> {
        Ok(generate_sas_token(
            &self.endpoint.host_name,
            &self.key,
            Some(&self.policy_name),
            expiry_from_now(),
        )?)
    }

    // Build an authenticated request for the given path
    fn request(
        &self,
        method: reqwest::Method,
        path: &str,
    ) -> Result<RequestBuilder, TransportError> {
        Ok(self
            .client
            .request(method, self.endpoint.url(path)?)
            .header(reqwest::header::AUTHORIZATION, self.token()?))
    }

    async fn idle(&self) {
        trace!("nothing received, waiting {:?}", self.poll_interval);
        tokio::time::sleep(self.poll_interval).await;
    }
}

#[async_trait]
impl ServiceTransport for HttpServiceClient {
    async fn open(&self) -> Result<(), TransportError> {
        self.token()?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn send(
        &self,
        _device_id: &DeviceId,
        _message: OutboundMessage,
    ) -> Result<(), TransportError> {
        Err(TransportError::Unsupported {
            operation: "send",
            transport: "http",
        })
    }

    async fn receive_feedback(&self) -> Result<Option<FeedbackBatch>, TransportError> {
        let response = self
            .request(reqwest::Method::GET, "/messages/serviceBound/feedback")?
            .send()
            .await?;
        let response = check_status(response).await?;
        if response.status() == StatusCode::NO_CONTENT {
            self.idle().await;
            return Ok(None);
        }

        let lock_token = lock_token(&response).unwrap_or_default();
        let records: Vec<FeedbackRecord> = response.json().await?;
        Ok(Some(FeedbackBatch {
            lock_token,
            records,
        }))
    }

    async fn complete_feedback(&self, batch: &FeedbackBatch) -> Result<(), TransportError> {
        let path = format!("/messages/serviceBound/feedback/{}", batch.lock_token);
        let response = self.request(reqwest::Method::DELETE, &path)?.send().await?;
        check_status(response).await?;
        Ok(())
    }

    async fn abandon_feedback(&self, batch: &FeedbackBatch) -> Result<(), TransportError> {
        let path = format!(
            "/messages/serviceBound/feedback/{}/abandon",
            batch.lock_token
        );
        let response = self
            .request(reqwest::Method::POST, &path)?
            .header(reqwest::header::CONTENT_LENGTH, 0)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    #[instrument(skip_all, fields(device_id = %device_id, method = %request.name))]
    async fn invoke_method(
        &self,
        device_id: &DeviceId,
        request: MethodRequest,
        timeout: Duration,
    ) -> Result<MethodResponse, TransportError> {
        let path = format!("/twins/{device_id}/methods");
        let response = self
            .request(reqwest::Method::POST, &path)?
            // give the hub some slack to report its own timeout
            .timeout(timeout + Duration::from_secs(5))
            .json(&json!({
                "methodName": request.name,
                "payload": request.payload,
                "responseTimeoutInSeconds": timeout.as_secs().max(5),
            }))
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    TransportError::Timeout
                } else {
                    err.into()
                }
            })?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    async fn receive_file_notification(
        &self,
    ) -> Result<Option<FileNotification>, TransportError> {
        let response = self
            .request(
                reqwest::Method::GET,
                "/messages/serviceBound/filenotifications",
            )?
            .send()
            .await?;
        let response = check_status(response).await?;
        if response.status() == StatusCode::NO_CONTENT {
            self.idle().await;
            return Ok(None);
        }

        let lock_token = lock_token(&response).unwrap_or_default();
        let mut notification: FileNotification = response.json().await?;
        notification.lock_token = lock_token;
        Ok(Some(notification))
    }

    async fn complete_file_notification(
        &self,
        notification: &FileNotification,
    ) -> Result<(), TransportError> {
        let path = format!(
            "/messages/serviceBound/filenotifications/{}",
            notification.lock_token
        );
        let response = self.request(reqwest::Method::DELETE, &path)?.send().await?;
        check_status(response).await?;
        Ok(())
    }

    async fn purge_message_queue(&self, device_id: &DeviceId) -> Result<u64, TransportError> {
        let path = format!("/devices/{device_id}/commands");
        let response = self.request(reqwest::Method::DELETE, &path)?.send().await?;
        let purged: PurgeResponse = check_status(response).await?.json().await?;
        Ok(purged.total_messages_purged)
    }
}

#[async_trait]
impl RegistryTransport for HttpServiceClient {
    async fn add_device(&self, device_id: &DeviceId) -> Result<DeviceRecord, TransportError> {
        let path = format!("/devices/{device_id}");
        let body = WireDevice::from(&DeviceRecord::new(device_id.clone()));
        let response = self
            .request(reqwest::Method::PUT, &path)?
            .json(&body)
            .send()
            .await?;
        let device: WireDevice = check_status(response).await?.json().await?;
        Ok(device.into())
    }

    async fn get_device(&self, device_id: &DeviceId) -> Result<DeviceRecord, TransportError> {
        let path = format!("/devices/{device_id}");
        let response = self.request(reqwest::Method::GET, &path)?.send().await?;
        let device: WireDevice = check_status(response).await?.json().await?;
        Ok(device.into())
    }

    async fn list_devices(&self, max: usize) -> Result<Vec<DeviceRecord>, TransportError> {
        let response = self
            .request(reqwest::Method::GET, "/devices")?
            .query(&[("top", max)])
            .send()
            .await?;
        let devices: Vec<WireDevice> = check_status(response).await?.json().await?;
        Ok(devices.into_iter().map(DeviceRecord::from).collect())
    }

    async fn update_device(&self, device: &DeviceRecord) -> Result<DeviceRecord, TransportError> {
        let path = format!("/devices/{}", device.device_id);
        let response = self
            .request(reqwest::Method::PUT, &path)?
            .header(reqwest::header::IF_MATCH, "*")
            .json(&WireDevice::from(device))
            .send()
            .await?;
        let device: WireDevice = check_status(response).await?.json().await?;
        Ok(device.into())
    }

    async fn remove_device(&self, device_id: &DeviceId) -> Result<(), TransportError> {
        let path = format!("/devices/{device_id}");
        let response = self
            .request(reqwest::Method::DELETE, &path)?
            .header(reqwest::header::IF_MATCH, "*")
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn get_twin(&self, device_id: &DeviceId) -> Result<TwinSnapshot, TransportError> {
        let path = format!("/twins/{device_id}");
        let response = self.request(reqwest::Method::GET, &path)?.send().await?;
        let twin: Value = check_status(response).await?.json().await?;
        Ok(TwinSnapshot::from_wire(twin)?)
    }

    async fn update_twin(
        &self,
        device_id: &DeviceId,
        patch: TwinPatch,
    ) -> Result<TwinSnapshot, TransportError> {
        let path = format!("/twins/{device_id}");
        let response = self
            .request(reqwest::Method::PATCH, &path)?
            .header(reqwest::header::IF_MATCH, "*")
            .json(&patch.to_wire())
            .send()
            .await?;
        let twin: Value = check_status(response).await?.json().await?;
        Ok(TwinSnapshot::from_wire(twin)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FeedbackStatus;
    use mockito::Matcher;
    use pretty_assertions::assert_eq;

    fn client(server: &mockito::Server) -> HttpServiceClient {
        HttpServiceClient::with_base_url(
            Url::parse(&server.url()).unwrap(),
            "hub.example.net",
            "iothubowner",
            SharedAccessKey::from("SmVmZQ=="),
        )
        .unwrap()
        .with_poll_interval(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn it_invokes_direct_methods() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/twins/dev1/methods")
            .match_query(Matcher::UrlEncoded(
                "api-version".into(),
                API_VERSION.into(),
            ))
            .match_header(
                "authorization",
                Matcher::Regex("&skn=iothubowner$".into()),
            )
            .match_body(Matcher::PartialJson(
                json!({"methodName": "uptime", "payload": {}}),
            ))
            .with_status(200)
            .with_body(r#"{"status":0,"payload":{"Uptime":5}}"#)
            .create_async()
            .await;

        let response = client(&server)
            .invoke_method(
                &DeviceId::from("dev1"),
                MethodRequest {
                    name: "uptime".into(),
                    payload: json!({}),
                },
                Duration::from_secs(30),
            )
            .await
            .unwrap();
        assert_eq!(response.status, 0);
        assert_eq!(response.payload, json!({"Uptime": 5}));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn it_reads_feedback_batches() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/messages/serviceBound/feedback")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("etag", "\"fb-lock\"")
            .with_body(
                json!([{
                    "originalMessageId": "m1",
                    "deviceId": "dev1",
                    "statusCode": "Success",
                    "description": "Success",
                    "enqueuedTimeUtc": "2024-05-01T10:00:00Z"
                }])
                .to_string(),
            )
            .create_async()
            .await;
        let complete = server
            .mock("DELETE", "/messages/serviceBound/feedback/fb-lock")
            .match_query(Matcher::Any)
            .with_status(204)
            .create_async()
            .await;

        let client = client(&server);
        let batch = client.receive_feedback().await.unwrap().unwrap();
        assert_eq!(batch.lock_token, "fb-lock");
        assert_eq!(batch.records[0].status_code, FeedbackStatus::Success);
        client.complete_feedback(&batch).await.unwrap();
        complete.assert_async().await;
    }

    #[tokio::test]
    async fn it_manages_registry_entries() {
        let mut server = mockito::Server::new_async().await;
        let device = json!({
            "deviceId": "dev1",
            "generationId": "g1",
            "etag": "e1",
            "status": "enabled",
            "authentication": {
                "type": "sas",
                "symmetricKey": {"primaryKey": "cHJpbWFyeQ==", "secondaryKey": "c2Vjb25kYXJ5"}
            }
        });
        let add = server
            .mock("PUT", "/devices/dev1")
            .match_query(Matcher::Any)
            .match_body(Matcher::PartialJson(
                json!({"deviceId": "dev1", "status": "enabled"}),
            ))
            .with_status(200)
            .with_body(device.to_string())
            .create_async()
            .await;
        let remove = server
            .mock("DELETE", "/devices/dev1")
            .match_query(Matcher::Any)
            .match_header("if-match", "*")
            .with_status(204)
            .create_async()
            .await;

        let client = client(&server);
        let record = client.add_device(&DeviceId::from("dev1")).await.unwrap();
        assert_eq!(record.status, DeviceStatus::Enabled);
        assert_eq!(
            record.primary_key,
            Some(SharedAccessKey::from("cHJpbWFyeQ=="))
        );
        client.remove_device(&DeviceId::from("dev1")).await.unwrap();
        add.assert_async().await;
        remove.assert_async().await;
    }

    #[tokio::test]
    async fn it_maps_missing_devices_to_not_found() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/devices/ghost")
            .match_query(Matcher::Any)
            .with_status(404)
            .with_body("DeviceNotFound")
            .create_async()
            .await;

        let res = client(&server).get_device(&DeviceId::from("ghost")).await;
        assert!(matches!(res, Err(TransportError::NotFound(_))));
    }

    #[tokio::test]
    async fn it_patches_desired_properties() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PATCH", "/twins/dev1")
            .match_query(Matcher::Any)
            .match_header("if-match", "*")
            .match_body(Matcher::Json(
                json!({"properties": {"desired": {"sleepmin": "500"}}}),
            ))
            .with_status(200)
            .with_body(
                json!({
                    "deviceId": "dev1",
                    "properties": {
                        "desired": {"sleepmin": "500", "$version": 3},
                        "reported": {"$version": 1}
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let twin = client(&server)
            .update_twin(
                &DeviceId::from("dev1"),
                TwinPatch::desired("sleepmin", json!("500")),
            )
            .await
            .unwrap();
        assert_eq!(twin.desired.version, 3);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn it_purges_device_queues() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/devices/dev1/commands")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"deviceId":"dev1","totalMessagesPurged":4}"#)
            .create_async()
            .await;

        let purged = client(&server)
            .purge_message_queue(&DeviceId::from("dev1"))
            .await
            .unwrap();
        assert_eq!(purged, 4);
    }
}
