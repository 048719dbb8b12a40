use std::sync::Arc;
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, instrument, warn};

use hubsim_transport::{DesiredUpdates, DeviceTransport, PropertyMap, TransportError, TwinSnapshot};

use crate::desired::{MergePolicy, MergeReport, merge_desired};
use crate::jitter::{jittered_delay, sleep_or_cancel};
use crate::retry::{Backoff, RetryPolicy};
use crate::state::StateHandle;

/// Name of the reported property carrying the counter
pub const REPORTED_COUNTER_KEY: &str = "reportedCounter";

#[derive(Debug, Error)]
pub enum TwinError {
    #[error("failed to read the device twin: {0}")]
    Sync(#[source] TransportError),

    #[error("failed to subscribe to desired properties: {0}")]
    Subscribe(#[source] TransportError),

    #[error("failed to publish reported properties after {attempts} attempts: {source}")]
    Publish {
        attempts: u32,
        #[source]
        source: TransportError,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcilerOptions {
    pub merge: MergePolicy,
    /// Send the last known reported version as a precondition of every
    /// update
    pub conditional_reports: bool,
    pub retry: RetryPolicy,
}

/// Keeps the device state in sync with the twin
///
/// Desired property changes are merged into the state as they arrive, while
/// a report loop periodically increments and publishes the reported
/// counter.
#[derive(Clone)]
pub struct TwinReconciler {
    transport: Arc<dyn DeviceTransport>,
    state: StateHandle,
    options: ReconcilerOptions,
}

enum Publish {
    Done(u64),
    Skipped(u64),
}

impl TwinReconciler {
    pub fn new(
        transport: Arc<dyn DeviceTransport>,
        state: StateHandle,
        options: ReconcilerOptions,
    ) -> Self {
        Self {
            transport,
            state,
            options,
        }
    }

    /// Fetch the twin and apply its desired properties to the state
    pub async fn initial_sync(&self) -> Result<(TwinSnapshot, MergeReport), TwinError> {
        let twin = self.transport.get_twin().await.map_err(TwinError::Sync)?;
        let report = merge_desired(&self.state, &twin.desired.properties, self.options.merge);
        info!(
            desired_version = twin.desired.version,
            reported_version = twin.reported.version,
            applied = report.applied.len(),
            "twin synchronized"
        );
        Ok((twin, report))
    }

    /// Subscribe, synchronize and publish the reported counter until
    /// cancelled
    ///
    /// Desired property changes are applied in the background, one delta at
    /// a time.
    #[instrument(name = "twin", skip_all)]
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), TwinError> {
        // changes made while the twin is read must reach the subscription
        let updates = self
            .transport
            .subscribe_desired_properties()
            .await
            .map_err(TwinError::Subscribe)?;
        let (twin, _) = self.initial_sync().await?;

        let updates_cancel = cancel.child_token();
        let updates = tokio::spawn(
            apply_updates(
                self.state.clone(),
                updates,
                self.options.merge,
                twin.desired.version,
                updates_cancel.clone(),
            )
            .in_current_span(),
        );

        let res = self.report_loop(twin.reported.version, &cancel).await;

        updates_cancel.cancel();
        if let Err(err) = updates.await {
            warn!("desired property task failed: {err}");
        }
        res
    }

    async fn report_loop(
        &self,
        mut known_version: u64,
        cancel: &CancellationToken,
    ) -> Result<(), TwinError> {
        let mut rng = StdRng::from_os_rng();
        let mut backoff = Backoff::new(self.options.retry);
        let mut retry_in: Option<Duration> = None;
        // counter value waiting to be published, kept across retries
        let mut pending: Option<u64> = None;

        loop {
            let delay = match retry_in.take() {
                Some(wait) => wait,
                None => {
                    let bounds = self.state.get();
                    let delay = jittered_delay(&mut rng, bounds.sleep_min_ms, bounds.sleep_max_ms);
                    debug!(
                        "sleep for {}ms [{}-{}]",
                        delay.as_millis(),
                        bounds.sleep_min_ms,
                        bounds.sleep_max_ms
                    );
                    delay
                }
            };
            if !sleep_or_cancel(delay, cancel).await {
                break;
            }

            let counter = *pending.get_or_insert_with(|| self.state.increment_reported_counter());
            match self.publish(counter, known_version).await {
                Ok(Publish::Done(version)) => {
                    info!(counter, version, "reported counter published");
                    known_version = version;
                    pending = None;
                    backoff.reset();
                }
                Ok(Publish::Skipped(version)) => {
                    known_version = version;
                    pending = None;
                    backoff.reset();
                }
                Err(err) if err.is_transient() => match backoff.record_failure() {
                    Some(wait) => {
                        warn!("failed to publish reported properties: {err} ... will retry in {wait:?}");
                        retry_in = Some(wait);
                    }
                    None => {
                        return Err(TwinError::Publish {
                            attempts: backoff.failures(),
                            source: err,
                        });
                    }
                },
                Err(err) => {
                    return Err(TwinError::Publish {
                        attempts: backoff.failures() + 1,
                        source: err,
                    });
                }
            }
        }

        debug!("reporting stopped");
        Ok(())
    }

    async fn publish(&self, counter: u64, known_version: u64) -> Result<Publish, TransportError> {
        let mut patch = PropertyMap::new();
        patch.insert(REPORTED_COUNTER_KEY.to_owned(), json!(counter));

        let if_version = self.options.conditional_reports.then_some(known_version);
        match self
            .transport
            .update_reported_properties(patch, if_version)
            .await
        {
            Ok(version) => Ok(Publish::Done(version)),
            Err(TransportError::PreconditionFailed) if if_version.is_some() => {
                // someone else reported in between, catch up and try on the next tick
                let twin = self.transport.get_twin().await?;
                warn!(
                    expected = known_version,
                    found = twin.reported.version,
                    "reported properties changed remotely, skipping update"
                );
                Ok(Publish::Skipped(twin.reported.version))
            }
            Err(err) => Err(err),
        }
    }
}

async fn apply_updates(
    state: StateHandle,
    mut updates: DesiredUpdates,
    policy: MergePolicy,
    mut applied_version: u64,
    cancel: CancellationToken,
) {
    loop {
        let update = tokio::select! {
            _ = cancel.cancelled() => break,
            update = updates.recv() => update,
        };
        let Some(bag) = update else {
            debug!("desired property stream closed");
            break;
        };
        if bag.version <= applied_version {
            debug!(version = bag.version, "desired properties already applied");
            continue;
        }
        applied_version = bag.version;

        let report = merge_desired(&state, &bag.properties, policy);
        info!(
            version = bag.version,
            applied = report.applied.len(),
            ignored = report.ignored.len() + report.unparseable.len(),
            "desired properties updated"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ConfigState;
    use crate::testing::{Faults, FlakyDevice};
    use hubsim_transport::loopback::{LoopbackDevice, LoopbackHub};
    use hubsim_transport::{PropertyBag, RegistryTransport, TwinPatch};
    use hubsim_util::types::DeviceId;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    async fn setup() -> (LoopbackHub, Arc<LoopbackDevice>, DeviceId) {
        let hub = LoopbackHub::default();
        let device_id = DeviceId::from("dev1");
        let device = Arc::new(hub.device(device_id.clone()));
        device.open().await.unwrap();
        (hub, device, device_id)
    }

    #[tokio::test]
    async fn it_applies_the_desired_bag_on_initial_sync() {
        let (hub, device, device_id) = setup().await;
        hub.service()
            .update_twin(&device_id, TwinPatch::desired("SleepMax", json!("1200")))
            .await
            .unwrap();

        let state = StateHandle::default();
        let reconciler = TwinReconciler::new(device, state.clone(), ReconcilerOptions::default());
        reconciler.initial_sync().await.unwrap();
        let first = state.get();
        assert_eq!(first.sleep_max_ms, 1200);

        // syncing again against the same twin changes nothing
        reconciler.initial_sync().await.unwrap();
        assert_eq!(state.get(), first);
    }

    async fn flaky_setup(device: FlakyDevice) -> (Arc<FlakyDevice>, StateHandle) {
        let device = Arc::new(device);
        device.open().await.unwrap();
        let state = StateHandle::new(ConfigState {
            sleep_min_ms: 100,
            sleep_max_ms: 100,
            reported_counter: 0,
        });
        (device, state)
    }

    #[tokio::test(start_paused = true)]
    async fn it_applies_desired_changes_made_while_reading_the_twin() {
        let hub = LoopbackHub::default();
        let device_id = DeviceId::from("dev1");
        let device = FlakyDevice {
            desired_after_read: Mutex::new(Some(TwinPatch::desired("sleepmax", json!("900")))),
            ..FlakyDevice::new(&hub, device_id.clone())
        };
        let (device, state) = flaky_setup(device).await;
        let reconciler = TwinReconciler::new(device, state.clone(), ReconcilerOptions::default());

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { reconciler.run(cancel).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(hub.twin(&device_id).unwrap().desired.version, 1);
        assert_eq!(state.get().sleep_max_ms, 900);
    }

    #[tokio::test]
    async fn it_skips_deltas_already_covered_by_the_snapshot() {
        let state = StateHandle::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let bag = |props: serde_json::Value, version| {
            PropertyBag::new(props.as_object().unwrap().clone(), version)
        };
        tx.send(bag(json!({"sleepmax": 900}), 1)).unwrap();
        tx.send(bag(json!({"sleepmax": 800}), 2)).unwrap();
        tx.send(bag(json!({"sleepmin": 50}), 3)).unwrap();
        drop(tx);

        apply_updates(
            state.clone(),
            rx,
            MergePolicy::default(),
            2,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(state.get().sleep_max_ms, 300);
        assert_eq!(state.get().sleep_min_ms, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn it_retries_transient_report_failures_with_the_same_counter() {
        let hub = LoopbackHub::default();
        let device_id = DeviceId::from("dev1");
        let device = FlakyDevice {
            reported: Faults::transient(3),
            ..FlakyDevice::new(&hub, device_id.clone())
        };
        let (device, state) = flaky_setup(device).await;
        let reconciler =
            TwinReconciler::new(device.clone(), state.clone(), ReconcilerOptions::default());

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { reconciler.run(cancel).await }
        });
        // first tick at 100ms, then retries after 1s, 2s and 4s
        tokio::time::sleep(Duration::from_millis(7150)).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(device.reported.calls(), 4);
        assert_eq!(state.get().reported_counter, 1);
        let twin = hub.twin(&device_id).unwrap();
        assert_eq!(twin.reported.get(REPORTED_COUNTER_KEY), Some(&json!(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn it_gives_up_after_five_transient_report_failures() {
        let hub = LoopbackHub::default();
        let device = FlakyDevice {
            reported: Faults::unavailable(),
            ..FlakyDevice::new(&hub, DeviceId::from("dev1"))
        };
        let (device, state) = flaky_setup(device).await;
        let reconciler =
            TwinReconciler::new(device.clone(), state.clone(), ReconcilerOptions::default());

        let res = reconciler.run(CancellationToken::new()).await;
        assert!(matches!(
            res,
            Err(TwinError::Publish {
                attempts: 5,
                source: TransportError::Status(503, _)
            })
        ));
        assert_eq!(device.reported.calls(), 5);
        assert_eq!(state.get().reported_counter, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn it_stops_reporting_on_fatal_errors() {
        let hub = LoopbackHub::default();
        let device = FlakyDevice {
            reported: Faults::fatal(),
            ..FlakyDevice::new(&hub, DeviceId::from("dev1"))
        };
        let (device, state) = flaky_setup(device).await;
        let reconciler = TwinReconciler::new(device.clone(), state, ReconcilerOptions::default());

        let res = reconciler.run(CancellationToken::new()).await;
        assert!(matches!(
            res,
            Err(TwinError::Publish {
                attempts: 1,
                source: TransportError::Unauthorized
            })
        ));
        assert_eq!(device.reported.calls(), 1);
    }

    #[tokio::test]
    async fn it_fails_setup_when_the_twin_is_unavailable() {
        let hub = LoopbackHub::default();
        // not opened
        let device = Arc::new(hub.device(DeviceId::from("dev1")));
        let reconciler =
            TwinReconciler::new(device, StateHandle::default(), ReconcilerOptions::default());

        let res = reconciler.run(CancellationToken::new()).await;
        assert!(matches!(res, Err(TwinError::Subscribe(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn it_publishes_the_counter_periodically() {
        let (hub, device, device_id) = setup().await;
        let state = StateHandle::new(ConfigState {
            sleep_min_ms: 100,
            sleep_max_ms: 100,
            reported_counter: 0,
        });
        let reconciler = TwinReconciler::new(device, state.clone(), ReconcilerOptions::default());
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { reconciler.run(cancel).await }
        });

        tokio::time::sleep(Duration::from_millis(350)).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(state.get().reported_counter, 3);
        let twin = hub.twin(&device_id).unwrap();
        assert_eq!(twin.reported.get(REPORTED_COUNTER_KEY), Some(&json!(3)));
        assert_eq!(twin.reported.version, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn it_skips_a_tick_when_a_conditional_report_is_stale() {
        let (hub, device, device_id) = setup().await;
        let state = StateHandle::new(ConfigState {
            sleep_min_ms: 100,
            sleep_max_ms: 100,
            reported_counter: 0,
        });
        let options = ReconcilerOptions {
            conditional_reports: true,
            ..ReconcilerOptions::default()
        };
        let reconciler = TwinReconciler::new(device.clone(), state.clone(), options);

        // an external reporter bumps the version after the reconciler read it
        let (twin, _) = reconciler.initial_sync().await.unwrap();
        let mut patch = PropertyMap::new();
        patch.insert("other".into(), json!(true));
        device.update_reported_properties(patch, None).await.unwrap();

        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            reconciler
                .report_loop(twin.reported.version, &loop_cancel)
                .await
        });
        tokio::time::sleep(Duration::from_millis(250)).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        // first tick was skipped, the second one went through
        let twin = hub.twin(&device_id).unwrap();
        assert_eq!(twin.reported.version, 2);
        assert_eq!(twin.reported.get(REPORTED_COUNTER_KEY), Some(&json!(2)));
    }
}
