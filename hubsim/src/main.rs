use std::error::Error;
use std::process::ExitCode;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, instrument, trace};

mod cli;
mod config;

use hubsim_engine::{ProcessClock, Session, SessionRecord, StateHandle};
use hubsim_util::config as stored;
use hubsim_util::dirs::config_dir;
use hubsim_util::logging::initialize_tracing;
use hubsim_util::store::Store;

use crate::cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    let clock = ProcessClock::start();
    initialize_tracing();

    let cli = cli::parse();
    let wait = cli.wait;

    let code = match run(cli, clock).await {
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

#[instrument(name = "hubsim", skip_all)]
async fn run(cli: Cli, clock: ProcessClock) -> Result<(), Box<dyn Error>> {
    let store = Store::new(cli.config_dir.clone().unwrap_or_else(config_dir));
    let saved: Option<SessionRecord> = stored::read(&store).await?;

    let identity = config::resolve_identity(&cli.device, saved.as_ref().map(|r| &r.identity))?;
    let (command, bounds) = cli.command.into_command();
    let state = config::initial_state(&identity, saved.as_ref(), bounds);
    trace!(identity = ?identity, state = ?state, "using config:");

    info!("device id {}", identity.device_id);
    info!("transport type {}", identity.transport);

    let transport = identity.transport()?;
    let session = Session::new(
        identity,
        transport,
        StateHandle::new(state),
        Arc::new(store),
    )
    .with_clock(clock)
    .with_signals();

    if !command.loops().is_empty() {
        info!("press CTRL+C to stop");
    }
    session.run(command).await?;
    Ok(())
}

async fn wait_for_return() {
    let mut line = String::new();
    // any outcome, including a closed stdin, ends the wait
    let _ = BufReader::new(tokio::io::stdin()).read_line(&mut line).await;
}
