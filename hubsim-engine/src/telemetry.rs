use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use hubsim_transport::{DeviceTransport, TransportError};
use hubsim_util::types::DeviceId;

use crate::events::{AlertEvent, EventType, TelemetryEvent};
use crate::jitter::{jittered_delay, sleep_or_cancel};
use crate::state::StateHandle;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("no alert types to choose from")]
    NoAlertTypes,

    #[error("failed to encode event: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("failed to send event: {0}")]
    Transport(#[from] TransportError),
}

/// Parameters of the telemetry series
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryOptions {
    pub telemetry_type: String,
    /// Defaults to the telemetry type when empty
    pub tags: Vec<String>,
    pub initial: f64,
    pub delta_min: f64,
    pub delta_max: f64,
    pub seed: Option<u64>,
}

impl Default for TelemetryOptions {
    fn default() -> Self {
        Self {
            telemetry_type: "temperature".into(),
            tags: Vec::new(),
            initial: 25.0,
            delta_min: -0.01,
            delta_max: 0.01,
            seed: None,
        }
    }
}

impl TelemetryOptions {
    fn tags(&self) -> Vec<String> {
        if self.tags.is_empty() {
            vec![self.telemetry_type.clone()]
        } else {
            self.tags.clone()
        }
    }
}

/// Parameters of the alert series
#[derive(Debug, Clone, PartialEq)]
pub struct AlertOptions {
    pub alert_types: Vec<String>,
    pub tags: Vec<String>,
    pub severity_min: i64,
    pub severity_max: i64,
    pub seed: Option<u64>,
}

impl Default for AlertOptions {
    fn default() -> Self {
        Self {
            alert_types: Vec::new(),
            tags: Vec::new(),
            severity_min: 0,
            severity_max: 100,
            seed: None,
        }
    }
}

fn rng_for(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    }
}

/// A bounded random walk
#[derive(Debug, Clone)]
pub struct RandomWalk {
    current: f64,
    delta_min: f64,
    delta_max: f64,
}

impl RandomWalk {
    pub fn new(initial: f64, delta_min: f64, delta_max: f64) -> Self {
        Self {
            current: initial,
            delta_min,
            delta_max,
        }
    }

    pub fn current(&self) -> f64 {
        self.current
    }

    /// Return the current value and move to the next one
    pub fn advance<R: Rng + ?Sized>(&mut self, rng: &mut R) -> f64 {
        let value = self.current;
        let delta = if self.delta_min < self.delta_max {
            rng.random_range(self.delta_min..=self.delta_max)
        } else {
            self.delta_min
        };
        self.current += delta;
        value
    }
}

/// Produces synthetic telemetry and alert events for a device
#[derive(Clone)]
pub struct TelemetryGenerator {
    transport: Arc<dyn DeviceTransport>,
    device_id: DeviceId,
    state: StateHandle,
}

impl TelemetryGenerator {
    pub fn new(transport: Arc<dyn DeviceTransport>, device_id: DeviceId, state: StateHandle) -> Self {
        Self {
            transport,
            device_id,
            state,
        }
    }

    async fn send<E: Serialize>(&self, event: &E, event_type: EventType) -> Result<(), TelemetryError> {
        let body = serde_json::to_vec(event)?;
        self.transport.send_event(body, event_type.as_str()).await?;
        Ok(())
    }

    /// Send a single telemetry event with the given value
    pub async fn send_telemetry(
        &self,
        options: &TelemetryOptions,
        current: f64,
    ) -> Result<TelemetryEvent, TelemetryError> {
        let event = TelemetryEvent::new(
            self.device_id.clone(),
            options.telemetry_type.clone(),
            options.tags(),
            current,
        );
        self.send(&event, EventType::Telemetry).await?;
        Ok(event)
    }

    /// Send a single alert event
    pub async fn send_alert(
        &self,
        alert_type: &str,
        tags: &[String],
        severity: i64,
    ) -> Result<AlertEvent, TelemetryError> {
        let event = AlertEvent::new(
            self.device_id.clone(),
            alert_type.to_owned(),
            tags.to_vec(),
            severity,
        );
        self.send(&event, EventType::Alert).await?;
        Ok(event)
    }

    /// Emit the telemetry series until cancelled.
    ///
    /// Sleep bounds are read from the device state on every tick. Send
    /// failures are logged and the series continues.
    #[instrument(name = "telemetry", skip_all)]
    pub async fn run_telemetry_loop(
        &self,
        options: TelemetryOptions,
        cancel: CancellationToken,
    ) -> Result<(), TelemetryError> {
        let mut rng = rng_for(options.seed);
        let mut walk = RandomWalk::new(options.initial, options.delta_min, options.delta_max);

        loop {
            let bounds = self.state.get();
            let delay = jittered_delay(&mut rng, bounds.sleep_min_ms, bounds.sleep_max_ms);
            debug!("sleep for {}ms", delay.as_millis());
            if !sleep_or_cancel(delay, &cancel).await {
                break;
            }

            let current = walk.advance(&mut rng);
            match self.send_telemetry(&options, current).await {
                Ok(_) => info!(current, "telemetry sent"),
                Err(TelemetryError::Transport(err)) => warn!("failed to send telemetry: {err}"),
                Err(err) => return Err(err),
            }
        }

        debug!("telemetry stopped");
        Ok(())
    }

    /// Emit alerts of random type and severity until cancelled
    #[instrument(name = "alerts", skip_all)]
    pub async fn run_alert_loop(
        &self,
        options: AlertOptions,
        cancel: CancellationToken,
    ) -> Result<(), TelemetryError> {
        if options.alert_types.is_empty() {
            return Err(TelemetryError::NoAlertTypes);
        }
        let mut rng = rng_for(options.seed);

        loop {
            let bounds = self.state.get();
            let delay = jittered_delay(&mut rng, bounds.sleep_min_ms, bounds.sleep_max_ms);
            debug!("sleep for {}ms", delay.as_millis());
            if !sleep_or_cancel(delay, &cancel).await {
                break;
            }

            let severity = if options.severity_min < options.severity_max {
                rng.random_range(options.severity_min..=options.severity_max)
            } else {
                options.severity_min
            };
            let alert_type = &options.alert_types[rng.random_range(0..options.alert_types.len())];

            match self.send_alert(alert_type, &options.tags, severity).await {
                Ok(_) => info!(%alert_type, severity, "alert sent"),
                Err(TelemetryError::Transport(err)) => warn!("failed to send alert: {err}"),
                Err(err) => return Err(err),
            }
        }

        debug!("alerts stopped");
        Ok(())
    }
}
