use std::path::PathBuf;

use clap::{Args, CommandFactory, Parser, Subcommand};

use hubsim_engine::{
    AlertOptions, Command, MergePolicy, ReconcilerOptions, TelemetryOptions, TransportKind,
};
use hubsim_util::types::{DeviceId, InvalidDeviceIdError, SharedAccessKey};

fn parse_device_id(s: &str) -> Result<DeviceId, InvalidDeviceIdError> {
    s.parse()
}

#[derive(Clone, Debug, Parser)]
#[command(name = "hubsim", version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub device: DeviceArgs,

    /// Directory where the device identity and state are kept between runs
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
    pub command: SimulatorCommand,
}

#[derive(Clone, Debug, Args)]
pub struct DeviceArgs {
    /// Host name of the IoT hub, e.g. "myhub.azure-devices.net"
    #[arg(
        env = "HUBSIM_HOST_NAME",
        long = "host-name",
        alias = "hostName",
        value_name = "host",
        global = true
    )]
    pub host_name: Option<String>,

    /// Identifier of the simulated device
    #[arg(
        env = "HUBSIM_DEVICE_ID",
        long = "device-id",
        alias = "deviceId",
        value_name = "id",
        value_parser = parse_device_id,
        global = true
    )]
    pub device_id: Option<DeviceId>,

    /// Base64 encoded device key
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

/// Bounds of the random wait between two ticks
#[derive(Clone, Debug, Args)]
pub struct SleepArgs {
    /// Minimum wait in milliseconds
    #[arg(long = "sleep-min", alias = "sleepmin", value_name = "ms")]
    pub sleep_min: Option<u64>,

    /// Maximum wait in milliseconds
    #[arg(long = "sleep-max", alias = "sleepmax", value_name = "ms")]
    pub sleep_max: Option<u64>,
}

impl SleepArgs {
    fn or(&self, min: u64, max: u64) -> (u64, u64) {
        (self.sleep_min.unwrap_or(min), self.sleep_max.unwrap_or(max))
    }
}

#[derive(Clone, Debug, Args)]
pub struct TelemetryArgs {
    /// Kind of measurement, e.g. "temperature"
    #[arg(
        long = "telemetry-type",
        alias = "telemetryType",
        value_name = "type",
        default_value = "temperature"
    )]
    pub telemetry_type: String,

    /// Comma separated tags, defaults to the telemetry type
    #[arg(long = "tags", value_name = "tag", value_delimiter = ',')]
    pub tags: Vec<String>,
}

impl TelemetryArgs {
    fn options(self) -> TelemetryOptions {
        TelemetryOptions {
            telemetry_type: self.telemetry_type,
            tags: self.tags,
            ..TelemetryOptions::default()
        }
    }
}

#[derive(Clone, Debug, Subcommand)]
pub enum SimulatorCommand {
    /// Send a random walk telemetry series until interrupted
    #[command(name = "faketelemetry")]
    FakeTelemetry {
        #[command(flatten)]
        sleep: SleepArgs,

        #[command(flatten)]
        telemetry: TelemetryArgs,

        /// First value of the series
        #[arg(long = "initial", value_name = "value", default_value_t = 25.0)]
        initial: f64,

        /// Lowest change between two values
        #[arg(
            long = "delta-min",
            alias = "deltamin",
            value_name = "value",
            default_value_t = -0.01,
            allow_negative_numbers = true
        )]
        delta_min: f64,

        /// Highest change between two values
        #[arg(
            long = "delta-max",
            alias = "deltamax",
            value_name = "value",
            default_value_t = 0.01,
            allow_negative_numbers = true
        )]
        delta_max: f64,

        /// Seed for a reproducible series
        #[arg(long = "seed", value_name = "int")]
        seed: Option<u64>,
    },

    /// Send a single telemetry event
    #[command(name = "telemetry")]
    Telemetry {
        #[command(flatten)]
        telemetry: TelemetryArgs,

        /// Value to send
        #[arg(
            long = "current",
            value_name = "value",
            default_value_t = 0.0,
            allow_negative_numbers = true
        )]
        current: f64,
    },

    /// Send alerts of random type and severity until interrupted
    #[command(name = "fakealert")]
    FakeAlert {
        #[command(flatten)]
        sleep: SleepArgs,

        /// Comma separated alert types to pick from
        #[arg(
            long = "alert-types",
            alias = "alertTypes",
            value_name = "type",
            value_delimiter = ',',
            required = true
        )]
        alert_types: Vec<String>,

        /// Comma separated tags
        #[arg(long = "tags", value_name = "tag", value_delimiter = ',')]
        tags: Vec<String>,

        /// Lowest severity
        #[arg(long = "delta-min", alias = "deltamin", value_name = "int", default_value_t = 0)]
        severity_min: i64,

        /// Highest severity
        #[arg(long = "delta-max", alias = "deltamax", value_name = "int", default_value_t = 100)]
        severity_max: i64,

        /// Seed for a reproducible series
        #[arg(long = "seed", value_name = "int")]
        seed: Option<u64>,
    },

    /// Send a single alert
    #[command(name = "alert")]
    Alert {
        #[arg(long = "alert-type", alias = "alertType", value_name = "type")]
        alert_type: String,

        #[arg(long = "severity", value_name = "int", default_value_t = 0)]
        severity: i64,

        /// Comma separated tags
        #[arg(long = "tags", value_name = "tag", value_delimiter = ',')]
        tags: Vec<String>,
    },

    /// Send an arbitrary event
    #[command(name = "sendevent")]
    SendEvent {
        #[arg(long = "event-body", alias = "eventBody", value_name = "body")]
        event_body: String,

        #[arg(long = "event-type", alias = "eventType", value_name = "type")]
        event_type: String,
    },

    /// Upload a file to the hub storage
    #[command(name = "fileupload")]
    FileUpload {
        #[arg(long = "filename", value_name = "path")]
        filename: PathBuf,
    },

    /// Print cloud-to-device messages until interrupted
    #[command(name = "handlemessage")]
    HandleMessage,

    /// Answer the "uptime" direct method until interrupted
    #[command(name = "handledirectmethod")]
    HandleDirectMethod,

    /// Follow desired properties and report a counter until interrupted
    #[command(name = "handleproperties")]
    HandleProperties {
        #[command(flatten)]
        sleep: SleepArgs,

        /// Ignore desired sleep bounds that would leave the minimum above
        /// the maximum
        #[arg(long = "strict-bounds")]
        strict_bounds: bool,

        /// Only report if nobody else reported since the last update
        #[arg(long = "conditional-reports")]
        conditional_reports: bool,
    },
}

impl SimulatorCommand {
    /// The engine command and the sleep bounds it starts with
    pub fn into_command(self) -> (Command, (u64, u64)) {
        match self {
            Self::FakeTelemetry {
                sleep,
                telemetry,
                initial,
                delta_min,
                delta_max,
                seed,
            } => {
                let options = TelemetryOptions {
                    initial,
                    delta_min,
                    delta_max,
                    seed,
                    ..telemetry.options()
                };
                (Command::FakeTelemetry(options), sleep.or(100, 300))
            }
            Self::Telemetry { telemetry, current } => (
                Command::Telemetry {
                    options: telemetry.options(),
                    current,
                },
                (100, 300),
            ),
            Self::FakeAlert {
                sleep,
                alert_types,
                tags,
                severity_min,
                severity_max,
                seed,
            } => {
                let options = AlertOptions {
                    alert_types,
                    tags,
                    severity_min,
                    severity_max,
                    seed,
                };
                (Command::FakeAlert(options), sleep.or(10_000, 30_000))
            }
            Self::Alert {
                alert_type,
                severity,
                tags,
            } => (
                Command::Alert {
                    alert_type,
                    severity,
                    tags,
                },
                (100, 300),
            ),
            Self::SendEvent {
                event_body,
                event_type,
            } => (
                Command::SendEvent {
                    body: event_body,
                    event_type,
                },
                (100, 300),
            ),
            Self::FileUpload { filename } => (Command::FileUpload { path: filename }, (100, 300)),
            Self::HandleMessage => (Command::HandleMessage, (100, 300)),
            Self::HandleDirectMethod => (Command::HandleDirectMethod, (100, 300)),
            Self::HandleProperties {
                sleep,
                strict_bounds,
                conditional_reports,
            } => {
                let options = ReconcilerOptions {
                    merge: MergePolicy { strict_bounds },
                    conditional_reports,
                    ..ReconcilerOptions::default()
                };
                (Command::HandleProperties(options), sleep.or(600, 3000))
            }
        }
    }
}

pub fn parse() -> Cli {
    Cli::parse()
}

pub fn usage() -> String {
    Cli::command().render_usage().to_string()
}
