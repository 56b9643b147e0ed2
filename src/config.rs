//! Configuration management for hydre.
use regex::Regex;
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    constants::{DEFAULT_CONTROL_HOST, DEFAULT_INTERVAL_SECS, DEFAULT_TIMEOUT_SECS},
    control,
    error::ConfigError,
};

/// Represents the structure of the configuration file.
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Map of daemon names to their respective configurations.
    #[serde(default)]
    pub daemons: BTreeMap<String, DaemonConfig>,
    /// Seconds granted to the group to stop gracefully before it is killed.
    #[serde(default = "default_timeout", alias = "timeoutSeconds")]
    pub timeout: u64,
    /// Seconds between two reconciliation passes.
    #[serde(default = "default_interval", alias = "intervalSeconds")]
    pub interval: u64,
    /// Port of the control channel.
    pub port: Option<PortSpec>,
    /// Host the control server listens on.
    pub bind: Option<String>,
}

/// Configuration for an individual daemon.
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DaemonConfig {
    /// Command used to start the daemon.
    #[serde(alias = "startCommand")]
    pub command: CommandLine,
    /// Command used to stop the daemon instead of `SIGTERM`.
    pub stop_command: Option<CommandLine>,
    /// File holding the PID of a daemon that backgrounds itself.
    pub pid_file: Option<PathBuf>,
    /// Files whose new lines are streamed to standard output.
    #[serde(default)]
    pub log_files: Vec<PathBuf>,
    /// Initial desired state. In `run` mode a disabled daemon is not part of the group.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// A command either as an argument vector or as a single string.
///
/// The string form is split on ASCII whitespace. Quotes and escapes are not
/// interpreted, so `echo "a b"` yields the three arguments `echo`, `"a` and `b"`. Use the
/// list form whenever an argument contains whitespace.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum CommandLine {
    /// Structured argument list, used verbatim.
    Argv(Vec<String>),
    /// Whitespace separated command string.
    Line(String),
}

impl CommandLine {
    /// Returns the argument vector, program first.
    pub fn argv(&self) -> Vec<String> {
        match self {
            CommandLine::Argv(args) => args.clone(),
            CommandLine::Line(line) => {
                line.split_ascii_whitespace().map(str::to_string).collect()
            }
        }
    }
}

impl From<&str> for CommandLine {
    fn from(line: &str) -> Self {
        CommandLine::Line(line.to_string())
    }
}

/// Control port given either as a YAML number or as a string.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum PortSpec {
    Number(u16),
    Text(String),
}

impl PortSpec {
    fn resolve(&self) -> Result<u16, ConfigError> {
        let raw = match self {
            PortSpec::Number(port) => port.to_string(),
            PortSpec::Text(raw) => raw.clone(),
        };
        control::parse_port(&raw).map_err(|err| ConfigError::Invalid(err.to_string()))
    }
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_interval() -> u64 {
    DEFAULT_INTERVAL_SECS
}

fn default_enabled() -> bool {
    true
}

impl Config {
    /// Graceful stop budget of the group.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Period of the reconciliation loop.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    /// Port of the control channel; required by `supervise`, `start` and `stop`.
    pub fn control_port(&self) -> Result<u16, ConfigError> {
        self.port
            .as_ref()
            .ok_or_else(|| ConfigError::Invalid("no control `port` configured".into()))?
            .resolve()
    }

    /// Address the control server binds.
    pub fn control_addr(&self) -> Result<String, ConfigError> {
        let host = self.bind.as_deref().unwrap_or(DEFAULT_CONTROL_HOST);
        Ok(format!("{host}:{}", self.control_port()?))
    }

    /// Address a client dials to reach the control server.
    ///
    /// A wildcard `bind` is reached through the loopback interface.
    pub fn client_addr(&self) -> Result<String, ConfigError> {
        let host = match self.bind.as_deref() {
            None | Some("0.0.0.0") | Some("::") | Some("[::]") => DEFAULT_CONTROL_HOST,
            Some(host) => host,
        };
        Ok(format!("{host}:{}", self.control_port()?))
    }

    /// Checks invariants serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval == 0 {
            return Err(ConfigError::Invalid("`interval` must be at least 1 second".into()));
        }

        if let Some(port) = &self.port {
            port.resolve()?;
        }

        for (name, daemon) in &self.daemons {
            if name.is_empty() || name.chars().any(char::is_whitespace) {
                return Err(ConfigError::Invalid(format!(
                    "daemon name '{name}' must be non-empty and contain no whitespace"
                )));
            }

            if daemon.command.argv().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "daemon '{name}' has an empty command"
                )));
            }

            if let Some(stop) = &daemon.stop_command
                && stop.argv().is_empty()
            {
                return Err(ConfigError::Invalid(format!(
                    "daemon '{name}' has an empty stopCommand"
                )));
            }
        }

        Ok(())
    }

    /// Rewrites relative pid-file and log paths against `base`.
    fn resolve_paths(&mut self, base: &Path) {
        for daemon in self.daemons.values_mut() {
            if let Some(pid_file) = daemon.pid_file.take() {
                daemon.pid_file = Some(resolve_path(base, pid_file));
            }
            daemon.log_files = daemon
                .log_files
                .drain(..)
                .map(|path| resolve_path(base, path))
                .collect();
        }
    }
}

fn resolve_path(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// Expands `${NAME}` placeholders with environment variables.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .map_err(|err| ConfigError::Invalid(err.to_string()))?;

    let mut missing: Option<String> = None;
    let expanded = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        env::var(var_name).unwrap_or_else(|_| {
            missing.get_or_insert_with(|| var_name.to_string());
            String::new()
        })
    });

    if let Some(var_name) = missing {
        return Err(ConfigError::MissingEnvVar(var_name));
    }

    Ok(expanded.into_owned())
}

/// Parses configuration text, resolving relative paths against `base`.
pub fn parse_config(content: &str, base: &Path) -> Result<Config, ConfigError> {
    let expanded = expand_env_vars(content)?;
    let mut config: Config = serde_yaml::from_str(&expanded)?;
    config.resolve_paths(base);
    config.validate()?;
    Ok(config)
}

/// Loads and parses the configuration file, expanding environment variables.
pub fn load_config(config_path: &Path) -> Result<Config, ConfigError> {
    let content = fs::read_to_string(config_path).map_err(|source| ConfigError::Read {
        path: config_path.to_path_buf(),
        source,
    })?;

    let base_path = config_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    parse_config(&content, &base_path)
}
