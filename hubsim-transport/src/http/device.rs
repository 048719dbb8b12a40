use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, instrument, trace, warn};
use url::Url;

use hubsim_util::types::{DeviceId, SharedAccessKey};

use super::{
    DEFAULT_POLL_INTERVAL, Endpoint, check_status, client, default_base_url, expiry_from_now,
    generate_sas_token, lock_token,
};
use crate::device::{DesiredUpdates, DeviceTransport};
use crate::error::TransportError;
use crate::model::{InboundMessage, MethodCall, PropertyMap, TwinSnapshot};

const API_VERSION: &str = "2020-03-13";

/// Device transport over the hub HTTPS API
///
/// Cloud-to-device messages are polled. Twin and direct method operations
/// are not available.
#[derive(Clone)]
pub struct HttpDeviceTransport {
    client: Client,
    endpoint: Endpoint,
    device_id: DeviceId,
    key: SharedAccessKey,
    poll_interval: Duration,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FileUploadRequest<'a> {
    blob_name: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileUploadResponse {
    correlation_id: String,
    host_name: String,
    container_name: String,
    blob_name: String,
    sas_token: String,
}

impl HttpDeviceTransport {
    pub fn new(
        host_name: &str,
        device_id: DeviceId,
        key: SharedAccessKey,
    ) -> Result<Self, TransportError> {
        Self::with_base_url(default_base_url(host_name)?, host_name, device_id, key)
    }

    /// Create a transport sending requests to `base` while signing tokens
    /// for `host_name`
    pub fn with_base_url(
        base: Url,
        host_name: &str,
        device_id: DeviceId,
        key: SharedAccessKey,
    ) -> Result<Self, TransportError> {
        Ok(Self {
            client: client()?,
            endpoint: Endpoint::new(base, host_name, API_VERSION),
            device_id,
            key,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn token(&self) -> Result<String, TransportError> {
        let resource = format!("{}/devices/{}", self.endpoint.host_name, self.device_id);
        Ok(generate_sas_token(
            &resource,
            &self.key,
            None,
            expiry_from_now(),
        )?)
    }

    fn url(&self, path: &str) -> Result<Url, TransportError> {
        self.endpoint
            .url(&format!("/devices/{}{path}", self.device_id))
    }

    fn unsupported(operation: &'static str) -> TransportError {
        TransportError::Unsupported {
            operation,
            transport: "http",
        }
    }

    async fn notify_upload(
        &self,
        correlation_id: &str,
        status: StatusCode,
    ) -> Result<(), TransportError> {
        let response = self
            .client
            .post(self.url("/files/notifications")?)
            .header(reqwest::header::AUTHORIZATION, self.token()?)
            .json(&json!({
                "correlationId": correlation_id,
                "isSuccess": status.is_success(),
                "statusCode": status.as_u16(),
                "statusDescription": status.canonical_reason().unwrap_or_default(),
            }))
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}

#[async_trait]
impl DeviceTransport for HttpDeviceTransport {
    async fn open(&self) -> Result<(), TransportError> {
        // nothing to connect, but fail early if the key cannot sign
        self.token()?;
        debug!(device_id = %self.device_id, host = %self.endpoint.host_name, "using https transport");
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn send_event(&self, body: Vec<u8>, event_type: &str) -> Result<(), TransportError> {
        let response = self
            .client
            .post(self.url("/messages/events")?)
            .header(reqwest::header::AUTHORIZATION, self.token()?)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header("iothub-app-Type", event_type)
            .body(body)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    #[instrument(level = "trace", skip_all)]
    async fn receive(&self) -> Result<Option<InboundMessage>, TransportError> {
        let response = self
            .client
            .get(self.url("/messages/deviceBound")?)
            .header(reqwest::header::AUTHORIZATION, self.token()?)
            .send()
            .await?;
        let response = check_status(response).await?;

        if response.status() == StatusCode::NO_CONTENT {
            trace!("no messages, waiting {:?}", self.poll_interval);
            tokio::time::sleep(self.poll_interval).await;
            return Ok(None);
        }

        let Some(lock_token) = lock_token(&response) else {
            return Err(TransportError::Status(
                response.status().as_u16(),
                "message received without a lock token".into(),
            ));
        };
        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        };
        let message_id = header("iothub-messageid").unwrap_or_default();
        let correlation_id = header("iothub-correlationid");
        let body = response.bytes().await?.to_vec();

        Ok(Some(InboundMessage {
            message_id,
            lock_token,
            correlation_id,
            body,
        }))
    }

    async fn complete(&self, message: &InboundMessage) -> Result<(), TransportError> {
        let path = format!("/messages/deviceBound/{}", message.lock_token);
        let response = self
            .client
            .delete(self.url(&path)?)
            .header(reqwest::header::AUTHORIZATION, self.token()?)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn abandon(&self, message: &InboundMessage) -> Result<(), TransportError> {
        let path = format!("/messages/deviceBound/{}/abandon", message.lock_token);
        let response = self
            .client
            .post(self.url(&path)?)
            .header(reqwest::header::AUTHORIZATION, self.token()?)
            .header(reqwest::header::CONTENT_LENGTH, 0)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    #[instrument(skip_all, fields(blob = name))]
    async fn upload_blob(&self, name: &str, data: Vec<u8>) -> Result<(), TransportError> {
        let response = self
            .client
            .post(self.url("/files")?)
            .header(reqwest::header::AUTHORIZATION, self.token()?)
            .json(&FileUploadRequest { blob_name: name })
            .send()
            .await?;
        let upload: FileUploadResponse = check_status(response).await?.json().await?;

        // the storage account uses the same scheme as the hub
        let blob_url = format!(
            "{}://{}/{}/{}{}",
            self.endpoint.base.scheme(),
            upload.host_name,
            upload.container_name,
            upload.blob_name,
            upload.sas_token
        );
        debug!("uploading {} bytes", data.len());
        let put = self
            .client
            .put(blob_url)
            .header("x-ms-blob-type", "BlockBlob")
            .body(data)
            .send()
            .await;

        // the hub must be told about failed uploads as well
        let status = match &put {
            Ok(response) => response.status(),
            Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if let Err(err) = self.notify_upload(&upload.correlation_id, status).await {
            warn!("failed to notify upload result: {err}");
        }
        check_status(put?).await?;
        Ok(())
    }

    async fn get_twin(&self) -> Result<TwinSnapshot, TransportError> {
        Err(Self::unsupported("get_twin"))
    }

    async fn update_reported_properties(
        &self,
        _patch: PropertyMap,
        _if_version: Option<u64>,
    ) -> Result<u64, TransportError> {
        Err(Self::unsupported("update_reported_properties"))
    }

    async fn subscribe_desired_properties(&self) -> Result<DesiredUpdates, TransportError> {
        Err(Self::unsupported("subscribe_desired_properties"))
    }

    async fn register_method_handler(
        &self,
        _name: &str,
        _calls: mpsc::Sender<MethodCall>,
    ) -> Result<(), TransportError> {
        Err(Self::unsupported("register_method_handler"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use pretty_assertions::assert_eq;

    fn transport(server: &mockito::Server) -> HttpDeviceTransport {
        let base = Url::parse(&server.url()).unwrap();
        HttpDeviceTransport::with_base_url(
            base,
            "hub.example.net",
            DeviceId::from("dev1"),
            SharedAccessKey::from("SmVmZQ=="),
        )
        .unwrap()
        .with_poll_interval(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn it_sends_events_with_a_type_property() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/devices/dev1/messages/events")
            .match_query(Matcher::UrlEncoded(
                "api-version".into(),
                API_VERSION.into(),
            ))
            .match_header(
                "authorization",
                Matcher::Regex("^SharedAccessSignature sr=hub.example.net%2Fdevices%2Fdev1&".into()),
            )
            .match_header("iothub-app-type", "telemetry")
            .match_body(r#"{"Current":25.0}"#)
            .with_status(204)
            .create_async()
            .await;

        transport(&server)
            .send_event(br#"{"Current":25.0}"#.to_vec(), "telemetry")
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn it_receives_and_settles_messages() {
        let mut server = mockito::Server::new_async().await;
        let receive = server
            .mock("GET", "/devices/dev1/messages/deviceBound")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("etag", "\"lock-1\"")
            .with_header("iothub-messageid", "msg-1")
            .with_body("hello")
            .create_async()
            .await;
        let complete = server
            .mock("DELETE", "/devices/dev1/messages/deviceBound/lock-1")
            .match_query(Matcher::Any)
            .with_status(204)
            .create_async()
            .await;
        let abandon = server
            .mock("POST", "/devices/dev1/messages/deviceBound/lock-1/abandon")
            .match_query(Matcher::Any)
            .with_status(204)
            .create_async()
            .await;

        let transport = transport(&server);
        let message = transport.receive().await.unwrap().unwrap();
        assert_eq!(message.message_id, "msg-1");
        assert_eq!(message.lock_token, "lock-1");
        assert_eq!(message.body, b"hello");

        transport.complete(&message).await.unwrap();
        transport.abandon(&message).await.unwrap();
        receive.assert_async().await;
        complete.assert_async().await;
        abandon.assert_async().await;
    }

    #[tokio::test]
    async fn it_returns_none_when_the_queue_is_empty() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/devices/dev1/messages/deviceBound")
            .match_query(Matcher::Any)
            .with_status(204)
            .create_async()
            .await;

        assert_eq!(transport(&server).receive().await.unwrap(), None);
    }

    #[tokio::test]
    async fn it_maps_auth_failures() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/devices/dev1/messages/events")
            .match_query(Matcher::Any)
            .with_status(401)
            .create_async()
            .await;

        let res = transport(&server)
            .send_event(b"{}".to_vec(), "telemetry")
            .await;
        assert!(matches!(res, Err(TransportError::Unauthorized)));
    }

    #[tokio::test]
    async fn it_uploads_blobs_and_notifies_the_hub() {
        let mut server = mockito::Server::new_async().await;
        let sas = server
            .mock("POST", "/devices/dev1/files")
            .match_query(Matcher::Any)
            .match_body(Matcher::Json(json!({"blobName": "report.txt"})))
            .with_status(200)
            .with_body(
                json!({
                    "correlationId": "corr-1",
                    "hostName": server.host_with_port(),
                    "containerName": "uploads",
                    "blobName": "dev1/report.txt",
                    "sasToken": "?sig=abc"
                })
                .to_string(),
            )
            .create_async()
            .await;
        let blob = server
            .mock("PUT", "/uploads/dev1/report.txt")
            .match_query(Matcher::UrlEncoded("sig".into(), "abc".into()))
            .match_header("x-ms-blob-type", "BlockBlob")
            .match_body("contents")
            .with_status(201)
            .create_async()
            .await;
        let notify = server
            .mock("POST", "/devices/dev1/files/notifications")
            .match_query(Matcher::Any)
            .match_body(Matcher::PartialJson(
                json!({"correlationId": "corr-1", "isSuccess": true, "statusCode": 201}),
            ))
            .with_status(204)
            .create_async()
            .await;

        transport(&server)
            .upload_blob("report.txt", b"contents".to_vec())
            .await
            .unwrap();
        sas.assert_async().await;
        blob.assert_async().await;
        notify.assert_async().await;
    }

    #[tokio::test]
    async fn it_does_not_support_twin_operations() {
        let server = mockito::Server::new_async().await;
        let res = transport(&server).get_twin().await;
        assert!(matches!(res, Err(TransportError::Unsupported { .. })));
    }
}
