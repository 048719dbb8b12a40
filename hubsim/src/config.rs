use thiserror::Error;
use tracing::{debug, warn};

use hubsim_engine::{ConfigState, DeviceIdentity, SessionRecord, TransportKind};
use hubsim_util::types::SharedAccessKey;

use crate::cli::DeviceArgs;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no device id given and none was stored before, use --device-id")]
    MissingDeviceId,

    #[error("no shared access key given for device {0}, use --shared-access-key")]
    MissingKey(String),
}

/// Combine the command line with what a previous run stored.
///
/// Flags take precedence over the stored identity. A key is only generated
/// for the loopback hub, which accepts any key.
pub fn resolve_identity(
    args: &DeviceArgs,
    saved: Option<&DeviceIdentity>,
) -> Result<DeviceIdentity, ConfigError> {
    let device_id = args
        .device_id
        .clone()
        .or_else(|| saved.map(|s| s.device_id.clone()))
        .ok_or(ConfigError::MissingDeviceId)?;

    // a stored key belongs to the stored device
    let saved = saved.filter(|s| {
        let same = s.device_id == device_id;
        if !same {
            warn!("ignoring stored identity of device {}", s.device_id);
        }
        same
    });

    let host_name = args
        .host_name
        .clone()
        .or_else(|| saved.map(|s| s.host_name.clone()))
        .unwrap_or_default();
    let transport = args
        .transport
        .or_else(|| saved.map(|s| s.transport))
        .unwrap_or_default();

    let shared_access_key = match (&args.shared_access_key, saved) {
        (Some(key), _) => key.clone(),
        (None, Some(saved)) => saved.shared_access_key.clone(),
        (None, None) if transport == TransportKind::Loopback => SharedAccessKey::default(),
        (None, None) => return Err(ConfigError::MissingKey(device_id.to_string())),
    };

    Ok(DeviceIdentity {
        host_name,
        device_id,
        shared_access_key,
        transport,
    })
}

/// State the session starts from. The reported counter carries over from
/// the previous run of the same device, the sleep bounds come from the
/// command.
pub fn initial_state(
    identity: &DeviceIdentity,
    saved: Option<&SessionRecord>,
    (sleep_min_ms, sleep_max_ms): (u64, u64),
) -> ConfigState {
    let reported_counter = saved
        .filter(|r| r.identity.device_id == identity.device_id)
        .map(|r| r.state.reported_counter)
        .unwrap_or_default();
    debug!(sleep_min_ms, sleep_max_ms, reported_counter, "initial state");

    ConfigState {
        sleep_min_ms,
        sleep_max_ms,
        reported_counter,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hubsim_util::types::DeviceId;
    use pretty_assertions::assert_eq;

    fn no_flags() -> DeviceArgs {
        DeviceArgs {
            host_name: None,
            device_id: None,
            shared_access_key: None,
            transport: None,
        }
    }

    fn saved() -> DeviceIdentity {
        DeviceIdentity {
            host_name: "hub.local".into(),
            device_id: DeviceId::from("dev1"),
            shared_access_key: SharedAccessKey::from("c2F2ZWQ="),
            transport: TransportKind::Http,
        }
    }

    #[test]
    fn it_falls_back_to_the_stored_identity() {
        let identity = resolve_identity(&no_flags(), Some(&saved())).unwrap();
        assert_eq!(identity, saved());

        let args = DeviceArgs {
            host_name: Some("other.local".into()),
            ..no_flags()
        };
        let identity = resolve_identity(&args, Some(&saved())).unwrap();
        assert_eq!(identity.host_name, "other.local");
        assert_eq!(identity.shared_access_key, saved().shared_access_key);
    }

    #[test]
    fn it_does_not_reuse_keys_of_other_devices() {
        let args = DeviceArgs {
            device_id: Some(DeviceId::from("dev2")),
            ..no_flags()
        };
        let res = resolve_identity(&args, Some(&saved()));
        assert!(matches!(res, Err(ConfigError::MissingKey(_))));
    }

    #[test]
    fn it_generates_keys_for_the_loopback_hub() {
        let args = DeviceArgs {
            device_id: Some(DeviceId::from("dev1")),
            transport: Some(TransportKind::Loopback),
            ..no_flags()
        };
        let identity = resolve_identity(&args, None).unwrap();
        assert!(!identity.shared_access_key.is_empty());
        assert!(matches!(
            resolve_identity(&no_flags(), None),
            Err(ConfigError::MissingDeviceId)
        ));
    }

    #[test]
    fn it_keeps_the_counter_of_the_same_device() {
        let record = SessionRecord {
            identity: saved(),
            state: ConfigState {
                sleep_min_ms: 1,
                sleep_max_ms: 2,
                reported_counter: 41,
            },
        };
        let state = initial_state(&saved(), Some(&record), (600, 3000));
        assert_eq!(
            state,
            ConfigState {
                sleep_min_ms: 600,
                sleep_max_ms: 3000,
                reported_counter: 41,
            }
        );
    }
}
