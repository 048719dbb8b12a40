use std::fmt::{self, Display};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use hubsim_transport::http::HttpDeviceTransport;
use hubsim_transport::loopback::LoopbackHub;
use hubsim_transport::{DeviceTransport, TransportError};
use hubsim_util::types::{DeviceId, SharedAccessKey};

/// How the simulator reaches the hub
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Http,
    /// An in-process hub, for running without a cloud account
    Loopback,
}

#[derive(Debug, Error)]
#[error("unknown transport type '{0}', expected one of: http, loopback")]
pub struct UnknownTransportError(String);

impl FromStr for TransportKind {
    type Err = UnknownTransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "http" | "https" => Ok(Self::Http),
            "loopback" => Ok(Self::Loopback),
            _ => Err(UnknownTransportError(s.to_owned())),
        }
    }
}

impl Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => f.write_str("http"),
            Self::Loopback => f.write_str("loopback"),
        }
    }
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("a host name is required for the {0} transport")]
    MissingHostName(TransportKind),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Who the simulated device is and where it connects to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    #[serde(default)]
    pub host_name: String,
    pub device_id: DeviceId,
    pub shared_access_key: SharedAccessKey,
    #[serde(default, rename = "transportType")]
    pub transport: TransportKind,
}

impl DeviceIdentity {
    /// Create the transport for this identity. The connection is not
    /// opened.
    pub fn transport(&self) -> Result<Arc<dyn DeviceTransport>, IdentityError> {
        match self.transport {
            TransportKind::Http => {
                if self.host_name.is_empty() {
                    return Err(IdentityError::MissingHostName(self.transport));
                }
                let transport = HttpDeviceTransport::new(
                    &self.host_name,
                    self.device_id.clone(),
                    self.shared_access_key.clone(),
                )?;
                Ok(Arc::new(transport))
            }
            TransportKind::Loopback => {
                let host_name = if self.host_name.is_empty() {
                    "loopback"
                } else {
                    &self.host_name
                };
                let hub = LoopbackHub::new(host_name);
                Ok(Arc::new(hub.device(self.device_id.clone())))
            }
        }
    }
}
