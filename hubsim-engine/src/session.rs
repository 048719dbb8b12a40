use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use hubsim_transport::{DeviceTransport, TransportError};
use hubsim_util::config::{self, StoredConfig, WriteConfigError};
use hubsim_util::store::Store;

use crate::identity::DeviceIdentity;
use crate::inbox::{InboxError, LogMessageHandler, MessageInbox};
use crate::methods::{DeviceContext, MethodDispatcher, MethodError, ProcessClock, UptimeMethod};
use crate::state::{ConfigState, StateHandle};
use crate::telemetry::{AlertOptions, TelemetryError, TelemetryGenerator, TelemetryOptions};
use crate::twin::{ReconcilerOptions, TwinError, TwinReconciler};

/// A simulator command and its options
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    FakeTelemetry(TelemetryOptions),
    Telemetry {
        options: TelemetryOptions,
        current: f64,
    },
    FakeAlert(AlertOptions),
    Alert {
        alert_type: String,
        severity: i64,
        tags: Vec<String>,
    },
    SendEvent {
        body: String,
        event_type: String,
    },
    FileUpload {
        path: PathBuf,
    },
    HandleMessage,
    HandleDirectMethod,
    HandleProperties(ReconcilerOptions),
}

/// A long running activity started by a command
#[derive(Debug, Clone, PartialEq)]
pub enum LoopKind {
    Telemetry(TelemetryOptions),
    Alert(AlertOptions),
    MessageInbox,
    MethodDispatcher,
    TwinReconciler(ReconcilerOptions),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::FakeTelemetry(_) => "faketelemetry",
            Self::Telemetry { .. } => "telemetry",
            Self::FakeAlert(_) => "fakealert",
            Self::Alert { .. } => "alert",
            Self::SendEvent { .. } => "sendevent",
            Self::FileUpload { .. } => "fileupload",
            Self::HandleMessage => "handlemessage",
            Self::HandleDirectMethod => "handledirectmethod",
            Self::HandleProperties(_) => "handleproperties",
        }
    }

    /// The loops a session starts for this command, none for commands
    /// sending a single request
    pub fn loops(&self) -> Vec<LoopKind> {
        match self {
            Self::FakeTelemetry(options) => vec![LoopKind::Telemetry(options.clone())],
            Self::FakeAlert(options) => vec![LoopKind::Alert(options.clone())],
            Self::HandleMessage => vec![LoopKind::MessageInbox],
            Self::HandleDirectMethod => vec![LoopKind::MethodDispatcher],
            Self::HandleProperties(options) => vec![LoopKind::TwinReconciler(*options)],
            Self::Telemetry { .. }
            | Self::Alert { .. }
            | Self::SendEvent { .. }
            | Self::FileUpload { .. } => Vec::new(),
        }
    }
}

/// What survives a simulator run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub identity: DeviceIdentity,
    pub state: ConfigState,
}

impl StoredConfig for SessionRecord {
    fn kind() -> &'static str {
        "simulator"
    }
}

/// Durable storage for the session record
#[async_trait]
pub trait StatePersistence: Send + Sync {
    async fn persist(&self, record: &SessionRecord) -> Result<(), WriteConfigError>;
}

#[async_trait]
impl StatePersistence for Store {
    async fn persist(&self, record: &SessionRecord) -> Result<(), WriteConfigError> {
        config::write(self, record).await
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to connect to the hub: {0}")]
    Open(#[source] TransportError),

    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    #[error(transparent)]
    Twin(#[from] TwinError),

    #[error(transparent)]
    Inbox(#[from] InboxError),

    #[error(transparent)]
    Method(#[from] MethodError),

    #[error("failed to save simulator state: {0}")]
    Persist(#[from] WriteConfigError),

    #[error("simulator task failed: {0}")]
    Task(#[from] JoinError),
}

/// Failures of one-shot commands, which are reported but do not fail the
/// session
#[derive(Debug, Error)]
enum OneShotError {
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("'{0}' is not a file name")]
    FileName(PathBuf),
}

/// Runs a simulator command against an open transport
///
/// The device state is persisted exactly once when the run ends, whether the
/// command finished, failed, or was interrupted.
pub struct Session {
    identity: DeviceIdentity,
    transport: Arc<dyn DeviceTransport>,
    state: StateHandle,
    persistence: Arc<dyn StatePersistence>,
    clock: ProcessClock,
    cancel: CancellationToken,
    handle_signals: bool,
}

impl Session {
    pub fn new(
        identity: DeviceIdentity,
        transport: Arc<dyn DeviceTransport>,
        state: StateHandle,
        persistence: Arc<dyn StatePersistence>,
    ) -> Self {
        Self {
            identity,
            transport,
            state,
            persistence,
            clock: ProcessClock::start(),
            cancel: CancellationToken::new(),
            handle_signals: false,
        }
    }

    /// Cancel the session on SIGINT or SIGTERM
    pub fn with_signals(mut self) -> Self {
        self.handle_signals = true;
        self
    }

    /// Use a clock started earlier, e.g. at process start
    pub fn with_clock(mut self, clock: ProcessClock) -> Self {
        self.clock = clock;
        self
    }

    /// Token cancelling every loop of the session
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> &StateHandle {
        &self.state
    }

    pub async fn run(&self, command: Command) -> Result<(), SessionError> {
        info!(command = command.name(), device_id = %self.identity.device_id, "starting");
        let signals = self
            .handle_signals
            .then(|| tokio::spawn(cancel_on_signal(self.cancel.clone())));

        let res = self.execute(command).await;
        if let Some(signals) = signals {
            signals.abort();
        }

        let record = SessionRecord {
            identity: self.identity.clone(),
            state: self.state.get(),
        };
        let persisted = self.persistence.persist(&record).await;
        if persisted.is_ok() {
            debug!(reported_counter = record.state.reported_counter, "state saved");
        }

        match (res, persisted) {
            (Err(err), Err(persist_err)) => {
                error!("failed to save simulator state: {persist_err}");
                Err(err)
            }
            (Err(err), Ok(())) => Err(err),
            (Ok(()), Err(persist_err)) => Err(persist_err.into()),
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    async fn execute(&self, command: Command) -> Result<(), SessionError> {
        tokio::select! {
            _ = self.cancel.cancelled() => {
                info!("cancelled before connecting");
                return Ok(());
            }
            res = self.transport.open() => res.map_err(SessionError::Open)?,
        }
        debug!("connected");

        let res = self.run_loops(command).await;

        if let Err(err) = self.transport.close().await {
            warn!("failed to close connection: {err}");
        }
        res
    }

    fn generator(&self) -> TelemetryGenerator {
        TelemetryGenerator::new(
            self.transport.clone(),
            self.identity.device_id.clone(),
            self.state.clone(),
        )
    }

    fn spawn_loop(&self, tasks: &mut JoinSet<Result<(), SessionError>>, kind: LoopKind) {
        let cancel = self.cancel.clone();
        match kind {
            LoopKind::Telemetry(options) => {
                let generator = self.generator();
                tasks.spawn(
                    async move { Ok(generator.run_telemetry_loop(options, cancel).await?) }
                        .in_current_span(),
                );
            }
            LoopKind::Alert(options) => {
                let generator = self.generator();
                tasks.spawn(
                    async move { Ok(generator.run_alert_loop(options, cancel).await?) }
                        .in_current_span(),
                );
            }
            LoopKind::MessageInbox => {
                let inbox = MessageInbox::new(self.transport.clone(), Arc::new(LogMessageHandler));
                tasks.spawn(async move { Ok(inbox.run(cancel).await?) }.in_current_span());
            }
            LoopKind::MethodDispatcher => {
                let context = DeviceContext {
                    device_id: self.identity.device_id.clone(),
                    clock: self.clock,
                };
                let dispatcher = MethodDispatcher::new(self.transport.clone(), context)
                    .with_handler(UptimeMethod);
                tasks.spawn(async move { Ok(dispatcher.run(cancel).await?) }.in_current_span());
            }
            LoopKind::TwinReconciler(options) => {
                let reconciler =
                    TwinReconciler::new(self.transport.clone(), self.state.clone(), options);
                tasks.spawn(async move { Ok(reconciler.run(cancel).await?) }.in_current_span());
            }
        }
    }

    async fn run_loops(&self, command: Command) -> Result<(), SessionError> {
        let loops = command.loops();
        if loops.is_empty() {
            self.run_once(command).await;
            return Ok(());
        }

        let mut tasks = JoinSet::new();
        for kind in loops {
            self.spawn_loop(&mut tasks, kind);
        }

        let mut res = Ok(());
        while let Some(joined) = tasks.join_next().await {
            let err = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err,
                Err(err) => SessionError::Task(err),
            };
            debug!("stopping session: {err}");
            if res.is_ok() {
                res = Err(err);
            }
            // stop the other loops
            self.cancel.cancel();
        }
        res
    }

    async fn run_once(&self, command: Command) {
        let name = command.name();
        let res = tokio::select! {
            _ = self.cancel.cancelled() => {
                warn!("{name} interrupted");
                return;
            }
            res = self.send_once(command) => res,
        };
        match res {
            Ok(()) => info!("{name} sent"),
            Err(err) => error!("{name} failed: {err}"),
        }
    }

    async fn send_once(&self, command: Command) -> Result<(), OneShotError> {
        match command {
            Command::Telemetry { options, current } => {
                self.generator().send_telemetry(&options, current).await?;
            }
            Command::Alert {
                alert_type,
                severity,
                tags,
            } => {
                self.generator()
                    .send_alert(&alert_type, &tags, severity)
                    .await?;
            }
            Command::SendEvent { body, event_type } => {
                self.transport
                    .send_event(body.into_bytes(), &event_type)
                    .await?;
            }
            Command::FileUpload { path } => {
                let blob_name = unique_blob_name(&path)?;
                let data = tokio::fs::read(&path)
                    .await
                    .map_err(|source| OneShotError::ReadFile {
                        path: path.clone(),
                        source,
                    })?;
                info!(size = data.len(), "uploading {} as {blob_name}", path.display());
                self.transport.upload_blob(&blob_name, data).await?;
            }
            Command::FakeTelemetry(_)
            | Command::FakeAlert(_)
            | Command::HandleMessage
            | Command::HandleDirectMethod
            | Command::HandleProperties(_) => unreachable!("looping commands are not one-shot"),
        }
        Ok(())
    }
}

/// Lower case `{stem}-{uuid}{.ext}` name for an uploaded file
fn unique_blob_name(path: &Path) -> Result<String, OneShotError> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| OneShotError::FileName(path.to_path_buf()))?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_default();
    Ok(format!("{stem}-{}{ext}", uuid::Uuid::new_v4()).to_lowercase())
}

/// Cancel the token on SIGINT or SIGTERM
pub async fn cancel_on_signal(cancel: CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        res = shutdown_signal() => {
            match res {
                Ok(()) => info!("shutdown requested"),
                Err(err) => {
                    // without signal handling the session can only end on its own
                    error!("failed to listen for shutdown signals: {err}");
                    return;
                }
            }
            cancel.cancel();
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res,
        _ = sigterm.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> io::Result<()> {
    tokio::signal::ctrl_c().await
}
