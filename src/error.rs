//! Error handling for hydre.
use std::{io, num::ParseIntError, path::PathBuf};

use thiserror::Error;

use crate::control::ControlError;

/// Errors raised while turning a configuration file into a daemon set.
///
/// Every variant is fatal at startup: the binary logs it and exits nonzero.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading or accessing a configuration file.
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        /// The path that could not be read.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A `${NAME}` placeholder referenced an unset environment variable.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// The file parsed but describes something the supervisor cannot run.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Error type for reading a daemon's pid-file.
#[derive(Debug, Error)]
pub enum PidFileError {
    /// The file could not be read.
    #[error("Failed to read PID file: {0}")]
    Read(#[from] io::Error),

    /// The file does not hold a decimal integer.
    #[error("Failed to parse PID file: {0}")]
    Parse(#[from] ParseIntError),

    /// The file exists but holds nothing but whitespace.
    #[error("PID file is empty")]
    Empty,

    /// The file holds `0` or a negative number, which never names a single process.
    #[error("PID file holds non-positive pid {0}")]
    NotPositive(i32),
}

/// Top-level error returned by the supervisor entry points.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The control channel failed.
    #[error(transparent)]
    Control(#[from] ControlError),

    /// Generic I/O failure (binding the listener, spawning threads).
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Installing the termination handler failed.
    #[error("Failed to install termination handler: {0}")]
    Signal(#[from] ctrlc::Error),

    /// Error for poisoned mutex.
    #[error("Mutex is poisoned: {0}")]
    MutexPoisonError(String),
}

impl<T> From<std::sync::PoisonError<T>> for SupervisorError {
    /// Converts a `std::sync::PoisonError` into a `SupervisorError`.
    fn from(err: std::sync::PoisonError<T>) -> Self {
        SupervisorError::MutexPoisonError(err.to_string())
    }
}
