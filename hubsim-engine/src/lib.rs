/*
The device side synchronization engine.

A `Session` opens the device transport and starts the loops required by a
simulator command. Loops share the device `ConfigState` through a
`StateHandle` and stop together through a single cancellation token.
*/

pub mod desired;
pub mod events;
pub mod feedback;
pub mod identity;
pub mod inbox;
pub mod jitter;
pub mod methods;
pub mod session;
pub mod state;
pub mod telemetry;
pub mod twin;
pub mod upload_relay;

mod retry;

#[cfg(test)]
mod testing;

pub use desired::{MergePolicy, MergeReport, merge_desired};
pub use feedback::{FeedbackError, FeedbackMonitor, FeedbackSink, LogFeedbackSink};
pub use identity::{DeviceIdentity, IdentityError, TransportKind};
pub use inbox::{Disposition, LogMessageHandler, MessageHandler, MessageInbox};
pub use methods::{DeviceContext, MethodDispatcher, MethodHandler, ProcessClock, UptimeMethod};
pub use retry::RetryPolicy;
pub use session::{
    Command, LoopKind, Session, SessionError, SessionRecord, StatePersistence, cancel_on_signal,
};
pub use state::{ConfigState, Field, StateHandle};
pub use telemetry::{AlertOptions, TelemetryGenerator, TelemetryOptions};
pub use twin::{ReconcilerOptions, TwinReconciler};
pub use upload_relay::{RelayError, UploadRelay};
