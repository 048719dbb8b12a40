use std::sync::Arc;

use reqwest::Client;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};
use url::Url;

use hubsim_transport::{FileNotification, ServiceTransport, TransportError};

use crate::events::{EventType, FileUploadEvent};
use crate::jitter::sleep_or_cancel;
use crate::retry::{Backoff, RetryPolicy};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to receive file notifications: {0}")]
    Receive(#[source] TransportError),

    #[error("failed to complete file notification: {0}")]
    Complete(#[source] TransportError),
}

impl RelayError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Receive(err) | Self::Complete(err) => err.is_transient(),
        }
    }
}

impl From<&FileNotification> for FileUploadEvent {
    fn from(notification: &FileNotification) -> Self {
        Self {
            event_type: EventType::FileUpload,
            blob_name: notification.blob_name.clone(),
            blob_uri: notification.blob_uri.clone(),
            device_id: notification.device_id.clone(),
            enqueued_time_utc: notification.enqueued_time_utc,
        }
    }
}

/// Consumes file upload notifications and forwards them to an optional
/// HTTP callback
#[derive(Clone)]
pub struct UploadRelay {
    transport: Arc<dyn ServiceTransport>,
    client: Client,
    callback: Option<Url>,
    retry: RetryPolicy,
}

impl UploadRelay {
    pub fn new(transport: Arc<dyn ServiceTransport>, callback: Option<Url>) -> Self {
        Self {
            transport,
            client: Client::new(),
            callback,
            retry: RetryPolicy {
                max_failures: 0,
                ..RetryPolicy::default()
            },
        }
    }

    async fn forward(&self, callback: &Url, event: &FileUploadEvent) -> Result<(), reqwest::Error> {
        self.client
            .post(callback.clone())
            .json(event)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Log, complete and forward one notification. Callback failures are
    /// only logged.
    pub async fn relay(&self, notification: &FileNotification) -> Result<(), RelayError> {
        info!(
            device_id = %notification.device_id,
            blob_name = %notification.blob_name,
            size = notification.blob_size_in_bytes,
            "file uploaded: {}",
            notification.blob_uri
        );
        self.transport
            .complete_file_notification(notification)
            .await
            .map_err(RelayError::Complete)?;

        if let Some(callback) = &self.callback {
            let event = FileUploadEvent::from(notification);
            match self.forward(callback, &event).await {
                Ok(()) => debug!("notification forwarded to {callback}"),
                Err(err) => warn!("failed to forward notification to {callback}: {err}"),
            }
        }
        Ok(())
    }

    #[instrument(name = "fileupload", skip_all)]
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), RelayError> {
        let mut backoff = Backoff::new(self.retry);

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.transport.receive_file_notification() => received,
            };

            let res = match received {
                Ok(None) => {
                    trace!("no notifications");
                    Ok(())
                }
                Ok(Some(notification)) => self.relay(&notification).await,
                Err(err) => Err(RelayError::Receive(err)),
            };

            match res {
                Ok(()) => backoff.reset(),
                Err(err) if err.is_transient() => {
                    let Some(wait) = backoff.record_failure() else {
                        return Err(err);
                    };
                    warn!("{err} ... will retry in {wait:?}");
                    if !sleep_or_cancel(wait, &cancel).await {
                        break;
                    }
                }
                Err(err) => return Err(err),
            }
        }

        debug!("file upload relay stopped");
        Ok(())
    }
}
