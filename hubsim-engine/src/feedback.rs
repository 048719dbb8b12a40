use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use hubsim_transport::{
    AckMode, FeedbackBatch, FeedbackRecord, OutboundMessage, ServiceTransport, TransportError,
};
use hubsim_util::types::DeviceId;

use crate::inbox::{Disposition, ProcessingError};
use crate::jitter::sleep_or_cancel;
use crate::retry::{Backoff, RetryPolicy};

const RECORD_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum FeedbackError {
    #[error("failed to receive feedback: {0}")]
    Receive(#[source] TransportError),

    #[error("failed to settle feedback batch: {0}")]
    Settle(#[source] TransportError),

    #[error("failed to send message: {0}")]
    Send(#[source] TransportError),

    #[error("feedback monitor is no longer running")]
    Stopped,
}

impl FeedbackError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Receive(err) | Self::Settle(err) | Self::Send(err) => err.is_transient(),
            Self::Stopped => false,
        }
    }
}

/// Observes delivery feedback records
#[async_trait]
pub trait FeedbackSink: Send + Sync {
    async fn record(&self, record: &FeedbackRecord) -> Result<(), ProcessingError>;
}

/// Logs every record
#[derive(Debug, Clone, Copy, Default)]
pub struct LogFeedbackSink;

#[async_trait]
impl FeedbackSink for LogFeedbackSink {
    async fn record(&self, record: &FeedbackRecord) -> Result<(), ProcessingError> {
        info!(
            "ACK: DeviceID={} OriginalMessageId={} StatusCode={}",
            record.device_id, record.original_message_id, record.status_code
        );
        Ok(())
    }
}

/// Drains delivery feedback for the whole service session
///
/// A single monitor runs for as long as the session does. Callers interested
/// in the outcome of a specific message subscribe to the records it
/// broadcasts instead of polling feedback themselves.
#[derive(Clone)]
pub struct FeedbackMonitor {
    transport: Arc<dyn ServiceTransport>,
    sink: Arc<dyn FeedbackSink>,
    records: broadcast::Sender<FeedbackRecord>,
    retry: RetryPolicy,
}

impl FeedbackMonitor {
    pub fn new(transport: Arc<dyn ServiceTransport>, sink: Arc<dyn FeedbackSink>) -> Self {
        let (records, _) = broadcast::channel(RECORD_CHANNEL_CAPACITY);
        Self {
            transport,
            sink,
            records,
            retry: RetryPolicy {
                max_failures: 0,
                ..RetryPolicy::default()
            },
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Follow the records processed from now on
    pub fn subscribe(&self) -> broadcast::Receiver<FeedbackRecord> {
        self.records.subscribe()
    }

    /// Hand every record of the batch to the sink and settle the batch.
    ///
    /// Records are only broadcast once the whole batch was accepted.
    pub async fn process_batch(&self, batch: &FeedbackBatch) -> Result<Disposition, FeedbackError> {
        for record in &batch.records {
            if let Err(err) = self.sink.record(record).await {
                warn!(message_id = %record.original_message_id, "failed to process feedback: {err}");
                self.transport
                    .abandon_feedback(batch)
                    .await
                    .map_err(FeedbackError::Settle)?;
                return Ok(Disposition::Abandoned);
            }
        }

        self.transport
            .complete_feedback(batch)
            .await
            .map_err(FeedbackError::Settle)?;
        for record in &batch.records {
            // no subscribers is fine
            let _ = self.records.send(record.clone());
        }
        Ok(Disposition::Completed)
    }

    /// Poll for feedback until cancelled
    #[instrument(name = "feedback", skip_all)]
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), FeedbackError> {
        let mut backoff = Backoff::new(self.retry);

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.transport.receive_feedback() => received,
            };

            let res = match received {
                Ok(None) => {
                    trace!("no feedback");
                    Ok(())
                }
                Ok(Some(batch)) => {
                    debug!(records = batch.records.len(), "feedback received");
                    self.process_batch(&batch).await.map(|_| ())
                }
                Err(err) => Err(FeedbackError::Receive(err)),
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

        debug!("feedback monitor stopped");
        Ok(())
    }

    /// Send a message requesting full acknowledgement and wait for its
    /// feedback record.
    ///
    /// Returns `None` if cancelled first. The monitor must be running for
    /// the record to ever arrive.
    pub async fn send_and_wait(
        &self,
        device_id: &DeviceId,
        message: OutboundMessage,
        cancel: &CancellationToken,
    ) -> Result<Option<FeedbackRecord>, FeedbackError> {
        // subscribe before sending so the record cannot be missed
        let mut records = self.subscribe();
        let message = message.with_ack(AckMode::Full);
        let message_id = message.message_id.clone();

        self.transport
            .send(device_id, message)
            .await
            .map_err(FeedbackError::Send)?;
        info!(%message_id, "message sent, waiting for feedback");

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                received = records.recv() => received,
            };
            match received {
                Ok(record) if record.original_message_id == message_id => return Ok(Some(record)),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("missed {skipped} feedback records");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(FeedbackError::Stopped),
            }
        }
    }
}
