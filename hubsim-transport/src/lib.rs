/*
Everything the simulator and the service tools need to talk to a hub.

The capability traits are split by the credentials they require: a device
talks through `DeviceTransport`, while service policies use
`ServiceTransport` for messaging and `RegistryTransport` for identity and
twin management. Two implementations are provided, an in-process
`LoopbackHub` and the HTTPS REST API.
*/

mod device;
mod error;
mod model;
mod registry;
mod service;

pub mod http;
pub mod loopback;

pub use device::{DesiredUpdates, DeviceTransport};
pub use error::TransportError;
pub use model::*;
pub use registry::RegistryTransport;
pub use service::ServiceTransport;
