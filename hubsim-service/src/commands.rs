use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use hubsim_engine::{FeedbackError, FeedbackMonitor, LogFeedbackSink, RelayError, UploadRelay};
use hubsim_transport::{DeviceStatus, MethodRequest, OutboundMessage, TransportError, TwinPatch};
use hubsim_util::types::DeviceId;

use crate::cli::ServiceCommand;
use crate::config::{Hub, ServiceConfig};
use crate::output::{self, DeviceConnection};

const LIST_MAX_DEVICES: usize = 1000;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("invalid method payload: {0}")]
    MethodPayload(#[source] serde_json::Error),

    #[error("method {name} answered with status {status}: {payload}")]
    MethodStatus {
        name: String,
        status: i32,
        payload: Value,
    },

    #[error(transparent)]
    Feedback(#[from] FeedbackError),

    #[error(transparent)]
    Relay(#[from] RelayError),
}

/// Run a service command, returning the text to print
#[instrument(name = "command", skip_all)]
pub async fn execute(
    command: ServiceCommand,
    hub: &Hub,
    config: &ServiceConfig,
    cancel: &CancellationToken,
) -> Result<String, CommandError> {
    match command {
        ServiceCommand::SendMessage {
            device,
            message_body,
            ack,
        } => send_message(hub, &device.device_id, message_body, ack, cancel).await,
        ServiceCommand::DirectMethod {
            device,
            method_name,
            method_json,
            timeout,
        } => {
            direct_method(
                hub,
                &device.device_id,
                &method_name,
                &method_json,
                Duration::from_secs(timeout),
            )
            .await
        }
        ServiceCommand::PurgeMessageQueue { device } => {
            let purged = hub.service.purge_message_queue(&device.device_id).await?;
            Ok(format!("OK purged {purged} messages"))
        }
        ServiceCommand::HandleFileUpload { .. } => {
            let relay = UploadRelay::new(
                hub.service.clone(),
                config.file_upload_notification_url.clone(),
            );
            relay.run(cancel.clone()).await?;
            Ok(String::new())
        }
        ServiceCommand::GetTwin { device } => {
            info!("getting twin of {}", device.device_id);
            let twin = hub.registry.get_twin(&device.device_id).await?;
            Ok(output::twin(&twin))
        }
        ServiceCommand::SetDesiredProperty {
            device,
            property_name,
            property_value,
        } => {
            let patch = TwinPatch::desired(&property_name, Value::String(property_value.clone()));
            let twin = hub.registry.update_twin(&device.device_id, patch).await?;
            Ok(format!(
                "Desired property {property_name}={property_value} (version {})",
                twin.desired.version
            ))
        }
        ServiceCommand::Tag {
            device,
            tag_name,
            tag_value,
        } => {
            let patch = TwinPatch::tag(&tag_name, Value::String(tag_value.clone()));
            let twin = hub.registry.update_twin(&device.device_id, patch).await?;
            Ok(format!("Tag {tag_name}={tag_value} (version {})", twin.tags.version))
        }
        ServiceCommand::Add { device, format } => {
            let record = hub.registry.add_device(&device.device_id).await?;
            let conn = DeviceConnection {
                host_name: &config.host_name,
                device: &record,
            };
            Ok(format!(
                "Added: {}\n{}",
                record.device_id,
                conn.render(format.format)
            ))
        }
        ServiceCommand::Get { device, format } => {
            let record = hub.registry.get_device(&device.device_id).await?;
            let conn = DeviceConnection {
                host_name: &config.host_name,
                device: &record,
            };
            Ok(format!(
                "Get: {}\n{}\n{}",
                record.device_id,
                output::device_status(&record),
                conn.render(format.format)
            ))
        }
        ServiceCommand::List => {
            let devices = hub.registry.list_devices(LIST_MAX_DEVICES).await?;
            Ok(std::iter::once("List".to_owned())
                .chain(devices.iter().map(output::device_line))
                .collect::<Vec<_>>()
                .join("\n"))
        }
        ServiceCommand::Remove { device } => {
            hub.registry.remove_device(&device.device_id).await?;
            Ok(format!("Removed: {}", device.device_id))
        }
        ServiceCommand::Enable { device, reason } => {
            set_status(hub, &device.device_id, DeviceStatus::Enabled, reason).await
        }
        ServiceCommand::Disable { device, reason } => {
            set_status(hub, &device.device_id, DeviceStatus::Disabled, reason).await
        }
    }
}

async fn send_message(
    hub: &Hub,
    device_id: &DeviceId,
    body: String,
    ack: bool,
    cancel: &CancellationToken,
) -> Result<String, CommandError> {
    info!("sending {body} to {device_id}");
    let message = OutboundMessage::new(body);
    if !ack {
        hub.service.send(device_id, message).await?;
        return Ok("ok".to_owned());
    }

    let monitor = FeedbackMonitor::new(hub.service.clone(), Arc::new(LogFeedbackSink));
    let stop = cancel.child_token();
    let run = monitor.run(stop.clone());
    tokio::pin!(run);

    let sent = tokio::select! {
        record = monitor.send_and_wait(device_id, message, &stop) => Some(record),
        res = &mut run => {
            res?;
            None
        }
    };
    let record = match sent {
        Some(record) => {
            // let the monitor settle the batch it is working on
            stop.cancel();
            let stopped = run.await;
            let record = record?;
            stopped?;
            record
        }
        None => None,
    };

    Ok(match record {
        Some(record) => format!("ok, feedback {}", record.status_code),
        None => "ok, stopped before any feedback arrived".to_owned(),
    })
}

async fn direct_method(
    hub: &Hub,
    device_id: &DeviceId,
    name: &str,
    payload: &str,
    timeout: Duration,
) -> Result<String, CommandError> {
    let payload: Value = serde_json::from_str(payload).map_err(CommandError::MethodPayload)?;
    let name = name.to_lowercase();
    info!("invoking {name} on {device_id}");

    let response = hub
        .service
        .invoke_method(
            device_id,
            MethodRequest {
                name: name.clone(),
                payload,
            },
            timeout,
        )
        .await?;

    match response.status {
        0 | 200..=299 => Ok(format!("OK {}", response.payload)),
        status => Err(CommandError::MethodStatus {
            name,
            status,
            payload: response.payload,
        }),
    }
}

async fn set_status(
    hub: &Hub,
    device_id: &DeviceId,
    status: DeviceStatus,
    reason: Option<String>,
) -> Result<String, CommandError> {
    let mut record = hub.registry.get_device(device_id).await?;
    if record.status == status {
        return Ok(format!("{device_id} already {status}"));
    }

    record.status = status;
    record.status_reason = match status {
        DeviceStatus::Enabled => None,
        DeviceStatus::Disabled => reason,
    };
    hub.registry.update_device(&record).await?;
    Ok(format!("{device_id} {status}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hubsim_engine::TransportKind;
    use hubsim_transport::loopback::LoopbackHub;
    use hubsim_transport::{DeviceTransport, MethodResponse};
    use hubsim_util::types::SharedAccessKey;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use crate::cli::{DeviceArg, FormatArg};
    use crate::output::ConfigFormat;

    fn setup() -> (LoopbackHub, Hub, ServiceConfig) {
        let loopback = LoopbackHub::with_receive_timeout("hub.local", Duration::from_millis(20));
        let hub = Hub::new(loopback.service());
        let config = ServiceConfig {
            host_name: "hub.local".into(),
            shared_access_key_name: "iothubowner".into(),
            shared_access_key: SharedAccessKey::default(),
            transport: TransportKind::Loopback,
            file_upload_notification_url: None,
        };
        (loopback, hub, config)
    }

    fn device(id: &str) -> DeviceArg {
        DeviceArg {
            device_id: DeviceId::from(id),
        }
    }

    async fn run(command: ServiceCommand, hub: &Hub, config: &ServiceConfig) -> String {
        execute(command, hub, config, &CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn it_manages_the_device_registry() {
        let (_loopback, hub, config) = setup();

        let added = run(
            ServiceCommand::Add {
                device: device("dev1"),
                format: FormatArg {
                    format: ConfigFormat::View,
                },
            },
            &hub,
            &config,
        )
        .await;
        assert!(added.starts_with("Added: dev1\nHostName=hub.local\nDeviceId=dev1\n"));

        let disable = || ServiceCommand::Disable {
            device: device("dev1"),
            reason: Some("lost".into()),
        };
        assert_eq!(run(disable(), &hub, &config).await, "dev1 disabled");
        assert_eq!(run(disable(), &hub, &config).await, "dev1 already disabled");

        let got = run(
            ServiceCommand::Get {
                device: device("dev1"),
                format: FormatArg {
                    format: ConfigFormat::CommandLine,
                },
            },
            &hub,
            &config,
        )
        .await;
        let lines: Vec<_> = got.lines().collect();
        assert_eq!(lines[..2], ["Get: dev1", "Status=disabled [lost]"]);
        assert!(lines[2].starts_with("--host-name hub.local --device-id dev1 "));

        let enable = ServiceCommand::Enable {
            device: device("dev1"),
            reason: None,
        };
        assert_eq!(run(enable, &hub, &config).await, "dev1 enabled");
        let record = hub.registry.get_device(&DeviceId::from("dev1")).await.unwrap();
        assert_eq!(record.status_reason, None);

        let listed = run(ServiceCommand::List, &hub, &config).await;
        assert_eq!(listed.lines().count(), 2);

        let removed = run(
            ServiceCommand::Remove {
                device: device("dev1"),
            },
            &hub,
            &config,
        )
        .await;
        assert_eq!(removed, "Removed: dev1");
        assert_eq!(run(ServiceCommand::List, &hub, &config).await, "List");
    }

    #[tokio::test]
    async fn it_updates_twins() {
        let (loopback, hub, config) = setup();
        hub.registry.add_device(&DeviceId::from("dev1")).await.unwrap();

        let set = run(
            ServiceCommand::SetDesiredProperty {
                device: device("dev1"),
                property_name: "sleepmin".into(),
                property_value: "500".into(),
            },
            &hub,
            &config,
        )
        .await;
        assert_eq!(set, "Desired property sleepmin=500 (version 1)");

        run(
            ServiceCommand::Tag {
                device: device("dev1"),
                tag_name: "location".into(),
                tag_value: "lab".into(),
            },
            &hub,
            &config,
        )
        .await;

        let twin = loopback.twin(&DeviceId::from("dev1")).unwrap();
        assert_eq!(twin.desired.get("sleepmin"), Some(&json!("500")));
        assert_eq!(twin.tags.get("location"), Some(&json!("lab")));

        let printed = run(
            ServiceCommand::GetTwin {
                device: device("dev1"),
            },
            &hub,
            &config,
        )
        .await;
        assert!(printed.contains("location=lab\n"));
        assert!(printed.contains("sleepmin=500\n"));
    }

    #[tokio::test]
    async fn it_invokes_methods_with_lowercase_names() {
        let (loopback, hub, _config) = setup();
        let dev = loopback.device(DeviceId::from("dev1"));
        dev.open().await.unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::channel(1);
        dev.register_method_handler("uptime", tx).await.unwrap();
        tokio::spawn(async move {
            while let Some(call) = rx.recv().await {
                call.respond(MethodResponse {
                    status: 0,
                    payload: json!({"Uptime": 5}),
                });
            }
        });

        let out = direct_method(
            &hub,
            &DeviceId::from("dev1"),
            "UpTime",
            "{}",
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(out, r#"OK {"Uptime":5}"#);

        let res = direct_method(
            &hub,
            &DeviceId::from("dev1"),
            "uptime",
            "{not json",
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(res, Err(CommandError::MethodPayload(_))));
    }

    #[tokio::test]
    async fn it_waits_for_the_acknowledgement_of_its_message() {
        let (loopback, hub, _config) = setup();
        let dev = loopback.device(DeviceId::from("dev1"));
        dev.open().await.unwrap();

        tokio::spawn(async move {
            loop {
                if let Ok(Some(msg)) = dev.receive().await {
                    dev.complete(&msg).await.unwrap();
                    break;
                }
            }
        });

        let out = send_message(
            &hub,
            &DeviceId::from("dev1"),
            "hello".into(),
            true,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(out, "ok, feedback Success");
    }
}
