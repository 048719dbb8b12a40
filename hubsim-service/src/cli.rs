use std::path::PathBuf;

use clap::{Args, CommandFactory, Parser, Subcommand};
use url::Url;

use hubsim_engine::TransportKind;
use hubsim_util::types::{DeviceId, InvalidDeviceIdError, SharedAccessKey};

use crate::config::ConnectionString;
use crate::output::ConfigFormat;

fn parse_device_id(s: &str) -> Result<DeviceId, InvalidDeviceIdError> {
    s.parse()
}

#[derive(Clone, Debug, Parser)]
#[command(name = "hubsim-service", version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub credentials: CredentialArgs,

    /// Directory where the service credentials are kept between runs
    #[arg(
        env = "HUBSIM_CONFIG_DIR",
        long = "config-dir",
        value_name = "dir",
        global = true
    )]
    pub config_dir: Option<PathBuf>,

    /// Wait for the return key before exiting
    #[arg(long = "wait", global = true)]
    pub wait: bool,

    #[command(subcommand)]
    pub command: ServiceCommand,
}

#[derive(Clone, Debug, Args)]
pub struct CredentialArgs {
    /// Service connection string, "HostName=..;SharedAccessKeyName=..;SharedAccessKey=.."
    #[arg(
        env = "HUBSIM_CONNECTION_STRING",
        long = "connection-string",
        alias = "connectionString",
        value_name = "str",
        hide_env_values = true,
        global = true
    )]
    pub connection_string: Option<ConnectionString>,

    /// Host name of the IoT hub, overrides the connection string
    #[arg(
        env = "HUBSIM_HOST_NAME",
        long = "host-name",
        alias = "hostName",
        value_name = "host",
        global = true
    )]
    pub host_name: Option<String>,

    /// Name of the shared access policy, overrides the connection string
    #[arg(
        env = "HUBSIM_SHARED_ACCESS_KEY_NAME",
        long = "shared-access-key-name",
        alias = "sharedAccessKeyName",
        value_name = "policy",
        global = true
    )]
    pub shared_access_key_name: Option<String>,

    /// Base64 encoded policy key, overrides the connection string
    #[arg(
        env = "HUBSIM_SHARED_ACCESS_KEY",
        long = "shared-access-key",
        alias = "sharedAccessKey",
        value_name = "key",
        hide_env_values = true,
        global = true
    )]
    pub shared_access_key: Option<SharedAccessKey>,

    /// How to reach the hub: http or loopback
    #[arg(
        env = "HUBSIM_TRANSPORT_TYPE",
        long = "transport-type",
        alias = "transportType",
        value_name = "type",
        global = true
    )]
    pub transport: Option<TransportKind>,
}

#[derive(Clone, Debug, Args)]
pub struct DeviceArg {
    /// Identifier of the target device
    #[arg(
        long = "device-id",
        alias = "deviceId",
        value_name = "id",
        value_parser = parse_device_id
    )]
    pub device_id: DeviceId,
}

#[derive(Clone, Debug, Args)]
pub struct FormatArg {
    /// How to print the device connection info: view, commandline or appsettings
    #[arg(
        long = "config-format",
        alias = "configFormat",
        value_name = "format",
        default_value = "view"
    )]
    pub format: ConfigFormat,
}

#[derive(Clone, Debug, Subcommand)]
pub enum ServiceCommand {
    /// Send a cloud-to-device message
    #[command(name = "sendmessage")]
    SendMessage {
        #[command(flatten)]
        device: DeviceArg,

        #[arg(long = "message-body", alias = "messageBody", value_name = "body")]
        message_body: String,

        /// Wait for the delivery acknowledgement of the message
        #[arg(long = "ack")]
        ack: bool,
    },

    /// Invoke a direct method on a device and print its response
    #[command(name = "directmethod")]
    DirectMethod {
        #[command(flatten)]
        device: DeviceArg,

        #[arg(long = "method-name", alias = "methodName", value_name = "name")]
        method_name: String,

        /// JSON payload of the invocation
        #[arg(
            long = "method-json",
            alias = "methodJson",
            value_name = "json",
            default_value = "{}"
        )]
        method_json: String,

        /// Seconds to wait for the device to answer
        #[arg(long = "timeout", value_name = "secs", default_value_t = 30)]
        timeout: u64,
    },

    /// Drop every pending cloud-to-device message of a device
    #[command(name = "purgemessagequeue")]
    PurgeMessageQueue {
        #[command(flatten)]
        device: DeviceArg,
    },

    /// Relay file upload notifications until interrupted
    #[command(name = "handlefileupload")]
    HandleFileUpload {
        /// Endpoint receiving a JSON POST for every uploaded file
        #[arg(
            env = "HUBSIM_FILE_UPLOAD_NOTIFICATION_URL",
            long = "handle-file-upload-notification-url",
            alias = "handleFileUploadNotificationUrl",
            value_name = "url"
        )]
        notification_url: Option<Url>,
    },

    /// Print the tags and properties of a device twin
    #[command(name = "gettwin")]
    GetTwin {
        #[command(flatten)]
        device: DeviceArg,
    },

    /// Set a desired property on a device twin
    #[command(name = "setdesiredproperty")]
    SetDesiredProperty {
        #[command(flatten)]
        device: DeviceArg,

        #[arg(long = "property-name", alias = "propertyName", value_name = "name")]
        property_name: String,

        #[arg(long = "property-value", alias = "propertyValue", value_name = "value")]
        property_value: String,
    },

    /// Set a tag on a device twin
    #[command(name = "tag")]
    Tag {
        #[command(flatten)]
        device: DeviceArg,

        #[arg(long = "tag-name", alias = "tagName", value_name = "name")]
        tag_name: String,

        #[arg(long = "tag-value", alias = "tagValue", value_name = "value")]
        tag_value: String,
    },

    /// Register a new device
    #[command(name = "add")]
    Add {
        #[command(flatten)]
        device: DeviceArg,

        #[command(flatten)]
        format: FormatArg,
    },

    /// Print the status and connection info of a device
    #[command(name = "get")]
    Get {
        #[command(flatten)]
        device: DeviceArg,

        #[command(flatten)]
        format: FormatArg,
    },

    /// List the registered devices
    #[command(name = "list")]
    List,

    /// Delete a device from the registry
    #[command(name = "remove")]
    Remove {
        #[command(flatten)]
        device: DeviceArg,
    },

    /// Allow a device to connect
    #[command(name = "enable")]
    Enable {
        #[command(flatten)]
        device: DeviceArg,

        #[arg(long = "reason", value_name = "text")]
        reason: Option<String>,
    },

    /// Refuse connections of a device
    #[command(name = "disable")]
    Disable {
        #[command(flatten)]
        device: DeviceArg,

        #[arg(long = "reason", value_name = "text")]
        reason: Option<String>,
    },
}

impl ServiceCommand {
    /// Returns true for commands that run until interrupted
    pub fn is_long_running(&self) -> bool {
        matches!(self, Self::HandleFileUpload { .. } | Self::SendMessage { ack: true, .. })
    }
}

pub fn parse() -> Cli {
    Cli::parse()
}

pub fn usage() -> String {
    Cli::command().render_usage().to_string()
}
