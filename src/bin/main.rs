use std::{process::ExitCode, sync::mpsc};

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use hydre::{
    cli::{Cli, Commands, parse_args},
    config::{Config, load_config},
    control::{self, ControlAction, ControlCommand},
    daemon,
    error::SupervisorError,
    fault::{self, Fault},
    group::Group,
    reaper::Reaper,
    supervisor::Supervisor,
};

/// Exit code for configuration that cannot be loaded or used.
const CONFIG_FAILURE: u8 = 2;

fn main() -> ExitCode {
    let args = parse_args();
    init_logging(&args);

    let config = match load_config(args.command.config_path()) {
        Ok(config) => config,
        Err(err) => {
            error!("{err}");
            return ExitCode::from(CONFIG_FAILURE);
        }
    };

    let result = match &args.command {
        Commands::Run { .. } => {
            start_reaper();
            run_group(&config)
        }
        Commands::Supervise { .. } => {
            start_reaper();
            supervise(&config).map(|()| ExitCode::SUCCESS)
        }
        Commands::Start { daemon, .. } => {
            send_control_command(&config, ControlAction::Start, daemon, args.quiet)
        }
        Commands::Stop { daemon, .. } => {
            send_control_command(&config, ControlAction::Stop, daemon, args.quiet)
        }
    };

    match result {
        Ok(code) => code,
        Err(SupervisorError::Config(err)) => {
            error!("{err}");
            ExitCode::from(CONFIG_FAILURE)
        }
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    // stdout belongs to the daemons and to control replies.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn start_reaper() {
    if let Err(err) = Reaper::start() {
        warn!("Failed to install the child reaper: {err}");
    }
}

/// Fail-fast mode: succeeds only when a termination signal ended the group.
fn run_group(config: &Config) -> Result<ExitCode, SupervisorError> {
    let (faults_tx, faults_rx) = fault::channel();

    let signal_tx = faults_tx.clone();
    ctrlc::set_handler(move || fault::post(&signal_tx, Fault::Terminated))?;

    let group = Group::new(daemon::daemon_set(config), config.timeout());
    match group.run_with(faults_tx, faults_rx) {
        Fault::Terminated => {
            info!("Daemon group stopped on request");
            Ok(ExitCode::SUCCESS)
        }
        _ => Ok(ExitCode::FAILURE),
    }
}

fn supervise(config: &Config) -> Result<(), SupervisorError> {
    let supervisor = Supervisor::new(config)?;

    let (shutdown_tx, shutdown_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(());
    })?;

    supervisor.run(shutdown_rx)
}

fn send_control_command(
    config: &Config,
    action: ControlAction,
    daemon: &str,
    quiet: bool,
) -> Result<ExitCode, SupervisorError> {
    let addr = config.client_addr()?;
    let reply = control::send_command(&addr, &ControlCommand::new(action, daemon))?;
    if !quiet && !reply.is_empty() {
        println!("{reply}");
    }
    Ok(ExitCode::SUCCESS)
}
