use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use hubsim_engine::TransportKind;
use hubsim_transport::http::HttpServiceClient;
use hubsim_transport::loopback::LoopbackHub;
use hubsim_transport::{RegistryTransport, ServiceTransport, TransportError};
use hubsim_util::config::StoredConfig;
use hubsim_util::types::SharedAccessKey;

use crate::cli::CredentialArgs;

const DEFAULT_POLICY: &str = "iothubowner";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no hub host name given, use --host-name or --connection-string")]
    MissingHostName,

    #[error("no shared access key given, use --shared-access-key or --connection-string")]
    MissingKey,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Error, PartialEq)]
pub enum InvalidConnectionStringError {
    #[error("malformed connection string segment '{0}'")]
    Malformed(String),

    #[error("connection string is missing {0}")]
    Missing(&'static str),
}

/// A hub service connection string
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionString {
    pub host_name: String,
    pub shared_access_key_name: String,
    pub shared_access_key: SharedAccessKey,
}

impl FromStr for ConnectionString {
    type Err = InvalidConnectionStringError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut host_name = None;
        let mut key_name = None;
        let mut key = None;

        for segment in s.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            // keys end with '=' padding, only the first one separates
            let (name, value) = segment
                .split_once('=')
                .ok_or_else(|| InvalidConnectionStringError::Malformed(segment.to_owned()))?;
            match name.trim().to_lowercase().as_str() {
                "hostname" => host_name = Some(value.to_owned()),
                "sharedaccesskeyname" => key_name = Some(value.to_owned()),
                "sharedaccesskey" => key = Some(value.to_owned()),
                other => debug!("ignoring connection string field {other}"),
            }
        }

        Ok(Self {
            host_name: host_name.ok_or(InvalidConnectionStringError::Missing("HostName"))?,
            shared_access_key_name: key_name
                .ok_or(InvalidConnectionStringError::Missing("SharedAccessKeyName"))?,
            shared_access_key: key
                .map(SharedAccessKey::from)
                .ok_or(InvalidConnectionStringError::Missing("SharedAccessKey"))?,
        })
    }
}

/// Service credentials kept between runs
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    #[serde(default)]
    pub host_name: String,
    pub shared_access_key_name: String,
    pub shared_access_key: SharedAccessKey,
    #[serde(rename = "transportType", default)]
    pub transport: TransportKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_upload_notification_url: Option<Url>,
}

impl StoredConfig for ServiceConfig {
    fn kind() -> &'static str {
        "service"
    }
}

/// Combine the credential flags with what a previous run stored.
///
/// Individual flags win over the connection string, which wins over the
/// stored config.
pub fn resolve(
    args: &CredentialArgs,
    saved: Option<&ServiceConfig>,
) -> Result<ServiceConfig, ConfigError> {
    let conn = args.connection_string.as_ref();

    let transport = args
        .transport
        .or_else(|| saved.map(|s| s.transport))
        .unwrap_or_default();
    let host_name = args
        .host_name
        .clone()
        .or_else(|| conn.map(|c| c.host_name.clone()))
        .or_else(|| saved.map(|s| s.host_name.clone()))
        .filter(|h| !h.is_empty());
    let host_name = match (host_name, transport) {
        (Some(host_name), _) => host_name,
        (None, TransportKind::Loopback) => "loopback".to_owned(),
        (None, TransportKind::Http) => return Err(ConfigError::MissingHostName),
    };
    let shared_access_key_name = args
        .shared_access_key_name
        .clone()
        .or_else(|| conn.map(|c| c.shared_access_key_name.clone()))
        .or_else(|| saved.map(|s| s.shared_access_key_name.clone()))
        .unwrap_or_else(|| DEFAULT_POLICY.to_owned());
    let shared_access_key = match args
        .shared_access_key
        .clone()
        .or_else(|| conn.map(|c| c.shared_access_key.clone()))
        .or_else(|| saved.map(|s| s.shared_access_key.clone()))
    {
        Some(key) => key,
        None if transport == TransportKind::Loopback => SharedAccessKey::default(),
        None => return Err(ConfigError::MissingKey),
    };

    Ok(ServiceConfig {
        host_name,
        shared_access_key_name,
        shared_access_key,
        transport,
        file_upload_notification_url: saved.and_then(|s| s.file_upload_notification_url.clone()),
    })
}

/// The service and registry capabilities of a single hub connection
#[derive(Clone)]
pub struct Hub {
    pub service: Arc<dyn ServiceTransport>,
    pub registry: Arc<dyn RegistryTransport>,
}

impl Hub {
    pub fn new<T>(transport: T) -> Self
    where
        T: ServiceTransport + RegistryTransport + 'static,
    {
        let transport = Arc::new(transport);
        Self {
            service: transport.clone(),
            registry: transport,
        }
    }
}

impl ServiceConfig {
    pub fn connect(&self) -> Result<Hub, ConfigError> {
        match self.transport {
            TransportKind::Http => Ok(Hub::new(HttpServiceClient::new(
                &self.host_name,
                &self.shared_access_key_name,
                self.shared_access_key.clone(),
            )?)),
            TransportKind::Loopback => {
                warn!("using an in-process hub, nothing is kept after exit");
                Ok(Hub::new(LoopbackHub::new(self.host_name.as_str()).service()))
            }
        }
    }
}
