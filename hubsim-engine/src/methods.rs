use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use hubsim_transport::{DeviceTransport, MethodRequest, MethodResponse, TransportError};
use hubsim_util::types::DeviceId;

/// Status returned for methods without a local handler
const METHOD_NOT_IMPLEMENTED: i32 = 501;

#[derive(Debug, Error)]
pub enum MethodError {
    #[error("failed to register method '{name}': {source}")]
    Register {
        name: String,
        #[source]
        source: TransportError,
    },

    #[error("method '{name}' failed: {reason}")]
    Handler { name: String, reason: String },

    #[error("method invocations stopped arriving")]
    Disconnected,
}

/// Process start reference used for computed fields
#[derive(Debug, Clone, Copy)]
pub struct ProcessClock {
    started: Instant,
    started_at: DateTime<Utc>,
}

impl ProcessClock {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}

/// What method handlers know about the device
#[derive(Debug, Clone)]
pub struct DeviceContext {
    pub device_id: DeviceId,
    pub clock: ProcessClock,
}

/// A synchronous direct method implementation
pub trait MethodHandler: Send + Sync {
    /// Name the method is invoked with, matched ignoring case
    fn name(&self) -> &str;

    fn call(&self, payload: &Value, context: &DeviceContext) -> Result<MethodResponse, MethodError>;
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct UptimeResponse<'a> {
    device_id: &'a DeviceId,
    startup_time: DateTime<Utc>,
    uptime: u64,
}

/// Reports for how many seconds the simulator has been running
#[derive(Debug, Clone, Copy, Default)]
pub struct UptimeMethod;

impl MethodHandler for UptimeMethod {
    fn name(&self) -> &str {
        "uptime"
    }

    fn call(&self, _payload: &Value, context: &DeviceContext) -> Result<MethodResponse, MethodError> {
        let response = UptimeResponse {
            device_id: &context.device_id,
            startup_time: context.clock.started_at(),
            uptime: context.clock.uptime().as_secs(),
        };
        info!("uptime invoked: {}s", response.uptime);

        let payload = serde_json::to_value(&response).map_err(|e| MethodError::Handler {
            name: self.name().to_owned(),
            reason: e.to_string(),
        })?;
        Ok(MethodResponse { status: 0, payload })
    }
}

/// Answers direct method invocations routed to the device
#[derive(Clone)]
pub struct MethodDispatcher {
    transport: Arc<dyn DeviceTransport>,
    context: DeviceContext,
    handlers: HashMap<String, Arc<dyn MethodHandler>>,
}

impl MethodDispatcher {
    pub fn new(transport: Arc<dyn DeviceTransport>, context: DeviceContext) -> Self {
        Self {
            transport,
            context,
            handlers: HashMap::new(),
        }
    }

    pub fn with_handler(mut self, handler: impl MethodHandler + 'static) -> Self {
        self.handlers
            .insert(handler.name().to_lowercase(), Arc::new(handler));
        self
    }

    /// Find the handler for the request and run it
    pub fn dispatch(&self, request: &MethodRequest) -> Result<MethodResponse, MethodError> {
        let Some(handler) = self.handlers.get(&request.name.to_lowercase()) else {
            warn!(method = %request.name, "no handler for method");
            return Ok(MethodResponse {
                status: METHOD_NOT_IMPLEMENTED,
                payload: json!({ "message": format!("method '{}' is not implemented", request.name) }),
            });
        };
        handler.call(&request.payload, &self.context)
    }

    /// Register every handler and answer invocations until cancelled.
    ///
    /// A failing handler stops the dispatcher.
    #[instrument(name = "methods", skip_all)]
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), MethodError> {
        let (tx, mut rx) = mpsc::channel(16);
        for name in self.handlers.keys() {
            self.transport
                .register_method_handler(name, tx.clone())
                .await
                .map_err(|source| MethodError::Register {
                    name: name.clone(),
                    source,
                })?;
            info!("method '{name}' registered");
        }
        drop(tx);

        loop {
            let call = tokio::select! {
                _ = cancel.cancelled() => break,
                call = rx.recv() => call,
            };
            let Some(call) = call else {
                if cancel.is_cancelled() {
                    break;
                }
                return Err(MethodError::Disconnected);
            };

            debug!(method = %call.request.name, "method invoked");
            let response = self.dispatch(&call.request)?;
            if !call.respond(response) {
                warn!("method caller is no longer waiting");
            }
        }

        debug!("methods stopped");
        Ok(())
    }
}
