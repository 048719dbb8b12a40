use std::error::Error;
use std::process::ExitCode;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, trace, warn};

mod cli;
mod commands;
mod config;
mod output;

use hubsim_engine::cancel_on_signal;
use hubsim_util::config as stored;
use hubsim_util::dirs::config_dir;
use hubsim_util::logging::initialize_tracing;
use hubsim_util::store::Store;

use crate::cli::{Cli, ServiceCommand};
use crate::config::ServiceConfig;

#[tokio::main]
async fn main() -> ExitCode {
    initialize_tracing();

    let cli = cli::parse();
    let wait = cli.wait;

    let code = match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", cli::usage());
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    };

    if wait {
        wait_for_return().await;
    }
    code
}

#[instrument(name = "hubsim-service", skip_all)]
async fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let store = Store::new(cli.config_dir.clone().unwrap_or_else(config_dir));
    let saved: Option<ServiceConfig> = stored::read(&store).await?;

    let mut config = config::resolve(&cli.credentials, saved.as_ref())?;
    if let ServiceCommand::HandleFileUpload {
        notification_url: Some(url),
    } = &cli.command
    {
        config.file_upload_notification_url = Some(url.clone());
    }
    trace!(config = ?config, "using config:");
    info!("hub {} ({})", config.host_name, config.transport);

    let hub = config.connect()?;
    hub.service.open().await?;

    let cancel = CancellationToken::new();
    let signals = cli.command.is_long_running().then(|| {
        info!("press CTRL+C to stop");
        tokio::spawn(cancel_on_signal(cancel.clone()))
    });

    let res = commands::execute(cli.command, &hub, &config, &cancel).await;

    if let Some(signals) = signals {
        signals.abort();
    }
    if let Err(err) = hub.service.close().await {
        warn!("failed to close the hub connection: {err}");
    }

    // the credentials worked well enough to be worth keeping
    stored::write(&store, &config).await?;

    let text = res?;
    if !text.is_empty() {
        println!("{text}");
    }
    Ok(())
}

async fn wait_for_return() {
    let mut line = String::new();
    // any outcome, including a closed stdin, ends the wait
    let _ = BufReader::new(tokio::io::stdin()).read_line(&mut line).await;
}
