use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::ops::Deref;
use std::str::FromStr;
use thiserror::Error;

/// A device identifier as registered in the hub
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct DeviceId(String);

#[derive(Debug, Error)]
#[error("invalid device id '{0}': must be non-empty and contain no whitespace or '/'")]
pub struct InvalidDeviceIdError(String);

impl Deref for DeviceId {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for DeviceId {
    type Err = InvalidDeviceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.chars().any(|c| c.is_whitespace() || c == '/') {
            return Err(InvalidDeviceIdError(s.to_owned()));
        }
        Ok(Self(s.to_owned()))
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<DeviceId> for String {
    fn from(value: DeviceId) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_parses_valid_ids() {
        let id: DeviceId = "sim-device-01".parse().unwrap();
        assert_eq!(id.as_str(), "sim-device-01");
    }

    #[test]
    fn it_rejects_empty_or_path_like_ids() {
        assert!("".parse::<DeviceId>().is_err());
        assert!("a/b".parse::<DeviceId>().is_err());
        assert!("a b".parse::<DeviceId>().is_err());
    }
}
