use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::ops::Deref;

use crate::crypto::random_key;

/// A base64 encoded symmetric key used to sign SAS tokens
///
/// The `Debug` implementation never prints the key material.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct SharedAccessKey(String);

impl Deref for SharedAccessKey {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Default for SharedAccessKey {
    fn default() -> Self {
        Self(random_key())
    }
}

impl std::fmt::Debug for SharedAccessKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedAccessKey(<redacted>)")
    }
}

impl Display for SharedAccessKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for SharedAccessKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SharedAccessKey {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<SharedAccessKey> for String {
    fn from(value: SharedAccessKey) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_redacts_debug_output() {
        let key = SharedAccessKey::from("c2VjcmV0");
        assert_eq!(format!("{key:?}"), "SharedAccessKey(<redacted>)");
        assert_eq!(key.to_string(), "c2VjcmV0");
    }
}
