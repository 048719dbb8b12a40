use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use crate::store::{Store, StoreError};

/// A configuration document persisted between runs of a tool
pub trait StoredConfig
where
    Self: Serialize,
    Self: DeserializeOwned,
{
    fn kind() -> &'static str;

    /// Name of the document holding this config, without extension
    fn default_name() -> &'static str {
        Self::kind()
    }
}

#[derive(Debug, Error)]
#[error("failed to read config: {0}")]
pub struct ReadConfigError(#[from] StoreError);

/// Load and decode a config from the root of `store`.
///
/// Returns `None` if the config was never stored.
pub async fn read<C: StoredConfig>(store: &Store) -> Result<Option<C>, ReadConfigError> {
    debug!("reading {} config", C::kind());
    let value = store.read(C::default_name()).await?;
    Ok(value)
}

#[derive(Debug, Error)]
#[error("failed to write config: {0}")]
pub struct WriteConfigError(#[from] StoreError);

/// Encode and store a config at the root of `store`, replacing any
/// previous version.
pub async fn write<C: StoredConfig>(store: &Store, config: &C) -> Result<(), WriteConfigError> {
    debug!("writing {} config", C::kind());
    store.write(C::default_name(), config).await?;
    Ok(())
}
