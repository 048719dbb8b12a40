use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use hubsim_transport::{DeviceTransport, InboundMessage, TransportError};

use crate::jitter::sleep_or_cancel;
use crate::retry::{Backoff, RetryPolicy};

/// Failure to process a received message
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ProcessingError(String);

impl ProcessingError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Applies a cloud-to-device message on the device
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &InboundMessage) -> Result<(), ProcessingError>;
}

/// Decodes messages as UTF-8 text and logs them
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMessageHandler;

#[async_trait]
impl MessageHandler for LogMessageHandler {
    async fn handle(&self, message: &InboundMessage) -> Result<(), ProcessingError> {
        let text = std::str::from_utf8(&message.body)
            .map_err(|e| ProcessingError::new(format!("message is not valid UTF-8: {e}")))?;
        info!(message_id = %message.message_id, "received {text}");
        Ok(())
    }
}

/// How a received message was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Completed,
    Abandoned,
}

#[derive(Debug, Error)]
pub enum InboxError {
    #[error("failed to receive messages: {0}")]
    Receive(#[source] TransportError),

    #[error("failed to settle message {message_id}: {source}")]
    Settle {
        message_id: String,
        #[source]
        source: TransportError,
    },
}

impl InboxError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Receive(err) | Self::Settle { source: err, .. } => err.is_transient(),
        }
    }
}

/// Consumes cloud-to-device messages
///
/// Every received message is either completed, if the handler succeeds, or
/// abandoned for redelivery, never both.
#[derive(Clone)]
pub struct MessageInbox {
    transport: Arc<dyn DeviceTransport>,
    handler: Arc<dyn MessageHandler>,
    retry: RetryPolicy,
}

impl MessageInbox {
    pub fn new(transport: Arc<dyn DeviceTransport>, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            transport,
            handler,
            retry: RetryPolicy {
                max_failures: 0,
                ..RetryPolicy::default()
            },
        }
    }

    /// Set the backoff used when the transport fails transiently
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Run the handler on a message and settle it accordingly
    pub async fn process_message(
        &self,
        message: &InboundMessage,
    ) -> Result<Disposition, InboxError> {
        let settle = |source| InboxError::Settle {
            message_id: message.message_id.clone(),
            source,
        };

        match self.handler.handle(message).await {
            Ok(()) => {
                self.transport.complete(message).await.map_err(settle)?;
                debug!(message_id = %message.message_id, "message completed");
                Ok(Disposition::Completed)
            }
            Err(err) => {
                warn!(message_id = %message.message_id, "failed to process message: {err}");
                self.transport.abandon(message).await.map_err(settle)?;
                debug!(message_id = %message.message_id, "message abandoned");
                Ok(Disposition::Abandoned)
            }
        }
    }

    /// Receive and process messages until cancelled
    #[instrument(name = "inbox", skip_all)]
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), InboxError> {
        let mut backoff = Backoff::new(self.retry);

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.transport.receive() => received,
            };

            let res = match received {
                Ok(None) => {
                    trace!("no messages");
                    Ok(())
                }
                Ok(Some(message)) => self.process_message(&message).await.map(|_| ()),
                Err(err) => Err(InboxError::Receive(err)),
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

        debug!("inbox stopped");
        Ok(())
    }
}
