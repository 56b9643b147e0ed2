//! Command-line interface for hydre.
use std::{path::PathBuf, str::FromStr};

use clap::{Args, Parser, Subcommand};
use tracing::level_filters::LevelFilter;

use crate::constants::{CONFIG_FILE_ENV, DEFAULT_CONFIG_FILE};

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };

            return Ok(LogLevelArg(level));
        }

        let lowercase = trimmed.to_ascii_lowercase();
        let level = match lowercase.as_str() {
            "off" => Some(LevelFilter::OFF),
            "error" | "err" => Some(LevelFilter::ERROR),
            "warn" | "warning" => Some(LevelFilter::WARN),
            "info" | "information" => Some(LevelFilter::INFO),
            "debug" => Some(LevelFilter::DEBUG),
            "trace" => Some(LevelFilter::TRACE),
            _ => None,
        }
        .ok_or_else(|| format!("invalid log level '{trimmed}'"))?;

        Ok(LogLevelArg(level))
    }
}

/// Command-line interface for hydre.
#[derive(Parser)]
#[command(name = "hydre", version, author)]
#[command(about = "A small supervisor for groups of daemons", long_about = None)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// Do not print the supervisor's reply to `start`/`stop`.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Location of the configuration file, shared by every command.
#[derive(Args, Debug, Clone)]
pub struct ConfigArg {
    /// Path to the configuration file.
    #[arg(
        short,
        long,
        env = CONFIG_FILE_ENV,
        default_value = DEFAULT_CONFIG_FILE
    )]
    pub config: PathBuf,
}

/// Available commands for hydre.
#[derive(Subcommand)]
pub enum Commands {
    /// Run every daemon as one group; the first failure stops them all.
    Run {
        #[command(flatten)]
        config: ConfigArg,
    },

    /// Keep every daemon in its desired state and serve the control channel.
    Supervise {
        #[command(flatten)]
        config: ConfigArg,
    },

    /// Ask a running supervisor to enable and start a daemon.
    Start {
        /// Name of the daemon.
        daemon: String,

        #[command(flatten)]
        config: ConfigArg,
    },

    /// Ask a running supervisor to disable and stop a daemon.
    Stop {
        /// Name of the daemon.
        daemon: String,

        #[command(flatten)]
        config: ConfigArg,
    },
}

impl Commands {
    /// Configuration file the command operates on.
    pub fn config_path(&self) -> &PathBuf {
        match self {
            Commands::Run { config }
            | Commands::Supervise { config }
            | Commands::Start { config, .. }
            | Commands::Stop { config, .. } => &config.config,
        }
    }
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::env_lock;

    #[test]
    fn log_level_accepts_names_and_numbers() {
        assert_eq!("debug".parse::<LogLevelArg>().unwrap().as_str(), "debug");
        assert_eq!("WARNING".parse::<LogLevelArg>().unwrap().as_str(), "warn");
        assert_eq!("0".parse::<LogLevelArg>().unwrap().as_str(), "off");
        assert_eq!("5".parse::<LogLevelArg>().unwrap().as_str(), "trace");
        assert!("6".parse::<LogLevelArg>().is_err());
        assert!("".parse::<LogLevelArg>().is_err());
        assert!("loud".parse::<LogLevelArg>().is_err());
    }

    #[test]
    fn stop_takes_daemon_and_config() {
        let cli =
            Cli::try_parse_from(["hydre", "stop", "daemon-2", "-c", "/etc/hydre.yml"])
                .unwrap();
        match &cli.command {
            Commands::Stop { daemon, config } => {
                assert_eq!(daemon, "daemon-2");
                assert_eq!(config.config, PathBuf::from("/etc/hydre.yml"));
            }
            _ => panic!("expected stop command"),
        }
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = Cli::try_parse_from([
            "hydre",
            "start",
            "web",
            "--quiet",
            "--log-level",
            "debug",
            "--config",
            "x.yml",
        ])
        .unwrap();
        assert!(cli.quiet);
        assert_eq!(cli.log_level.map(|level| level.as_str()), Some("debug"));
        assert_eq!(cli.command.config_path(), &PathBuf::from("x.yml"));
    }

    #[test]
    fn config_defaults_to_env_then_file_name() {
        let _guard = env_lock();

        unsafe {
            std::env::remove_var(CONFIG_FILE_ENV);
        }
        let cli = Cli::try_parse_from(["hydre", "run"]).unwrap();
        assert_eq!(cli.command.config_path(), &PathBuf::from(DEFAULT_CONFIG_FILE));

        unsafe {
            std::env::set_var(CONFIG_FILE_ENV, "/srv/hydre.yml");
        }
        let cli = Cli::try_parse_from(["hydre", "supervise"]).unwrap();
        unsafe {
            std::env::remove_var(CONFIG_FILE_ENV);
        }
        assert_eq!(cli.command.config_path(), &PathBuf::from("/srv/hydre.yml"));
    }

    #[test]
    fn start_requires_a_daemon_name() {
        assert!(Cli::try_parse_from(["hydre", "start"]).is_err());
        assert!(Cli::try_parse_from(["hydre", "restart", "web"]).is_err());
    }
}
