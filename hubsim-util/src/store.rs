use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::fs;
use tracing::trace;

use super::fs::write_atomic;

/// A directory of JSON documents, one file per document name
///
/// Writes are atomic, but two processes writing the same document race and
/// the last one wins.
#[derive(Clone, Debug)]
pub struct Store {
    root: PathBuf,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("document {path} is not valid JSON: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode document: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("invalid document name '{0}'")]
    InvalidName(String),
}

impl Store {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    // Names are single file stems, so documents never leave the root
    fn document_path(&self, name: &str) -> Result<PathBuf, StoreError> {
        let valid = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(['/', '\\']);
        if !valid {
            return Err(StoreError::InvalidName(name.to_owned()));
        }
        Ok(self.root.join(format!("{name}.json")))
    }

    /// Replace the named document
    pub async fn write<V: Serialize>(&self, name: &str, value: &V) -> Result<(), StoreError> {
        let path = self.document_path(name)?;
        let buf = serde_json::to_vec_pretty(value).map_err(StoreError::Encode)?;
        let io_err = |source| StoreError::Io {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(&self.root).await.map_err(io_err)?;
        trace!("writing {}", path.display());
        let target = path.clone();
        tokio::task::spawn_blocking(move || write_atomic(target, buf))
            .await
            .map_err(io::Error::other)
            .and_then(|res| res)
            .map_err(io_err)
    }

    /// Read the named document, `None` if it was never written
    pub async fn read<V: DeserializeOwned>(&self, name: &str) -> Result<Option<V>, StoreError> {
        let path = self.document_path(name)?;
        trace!("reading {}", path.display());

        let contents = match fs::read(&path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        serde_json::from_slice(&contents)
            .map(Some)
            .map_err(|source| StoreError::Decode { path, source })
    }
}
