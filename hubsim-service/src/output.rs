//! Text printed by the service tools on stdout

use std::fmt::{Display, Write};
use std::str::FromStr;

use serde_json::Value;
use thiserror::Error;

use hubsim_transport::{DeviceRecord, PropertyBag, TwinSnapshot};

/// Layout of the device connection info printed by `add` and `get`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConfigFormat {
    /// `Name=value` lines
    #[default]
    View,
    /// Flags to pass to the simulator
    CommandLine,
    /// Entries of an XML `appSettings` section
    AppSettings,
}

#[derive(Debug, Error)]
#[error("unknown config format '{0}', expected view, commandline or appsettings")]
pub struct UnknownFormatError(String);

impl FromStr for ConfigFormat {
    type Err = UnknownFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "view" => Ok(Self::View),
            "commandline" => Ok(Self::CommandLine),
            "appsettings" => Ok(Self::AppSettings),
            _ => Err(UnknownFormatError(s.to_owned())),
        }
    }
}

/// What a device needs to connect to the hub
#[derive(Debug)]
pub struct DeviceConnection<'a> {
    pub host_name: &'a str,
    pub device: &'a DeviceRecord,
}

impl DeviceConnection<'_> {
    pub fn render(&self, format: ConfigFormat) -> String {
        let key = self
            .device
            .primary_key
            .as_ref()
            .map(|k| k.as_str())
            .unwrap_or_default();
        let id = self.device.device_id.as_str();
        let host = self.host_name;

        match format {
            ConfigFormat::View => {
                format!("HostName={host}\nDeviceId={id}\nSharedAccessKey={key}")
            }
            ConfigFormat::CommandLine => {
                format!("--host-name {host} --device-id {id} --shared-access-key {key}")
            }
            ConfigFormat::AppSettings => [
                ("HostName", host),
                ("DeviceId", id),
                ("SharedAccessKey", key),
            ]
            .iter()
            .map(|(name, value)| format!("<add key=\"{name}\" value=\"{value}\"/>"))
            .collect::<Vec<_>>()
            .join("\n"),
        }
    }
}

/// One line of the `list` output
pub fn device_line(device: &DeviceRecord) -> String {
    let key = device
        .primary_key
        .as_ref()
        .map(|k| k.as_str())
        .unwrap_or_default();
    format!("{} {:<16} {key}", device.generation_id, device.device_id.as_str())
}

pub fn device_status(device: &DeviceRecord) -> String {
    format!(
        "Status={} [{}]",
        device.status,
        device.status_reason.as_deref().unwrap_or_default()
    )
}

fn write_bag(out: &mut String, title: impl Display, bag: &PropertyBag) {
    // writing into a String cannot fail
    let _ = writeln!(out, "\n{title} version {}", bag.version);
    for (name, value) in &bag.properties {
        match value {
            Value::String(s) => {
                let _ = writeln!(out, "{name}={s}");
            }
            other => {
                let _ = writeln!(out, "{name}={other}");
            }
        }
    }
}

pub fn twin(twin: &TwinSnapshot) -> String {
    let mut out = String::new();
    write_bag(&mut out, "Tags", &twin.tags);
    write_bag(&mut out, "Desired properties", &twin.desired);
    write_bag(&mut out, "Reported properties", &twin.reported);
    out
}
