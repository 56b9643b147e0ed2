//! Constants and configuration values for the hydre supervisor.
//!
//! This module centralizes the timing budgets, defaults and names used throughout the
//! supervisor so the polling loops stay in one place.

use std::time::Duration;

// ============================================================================
// Configuration Defaults
// ============================================================================

/// Configuration file used when neither `--config` nor the environment names one.
pub const DEFAULT_CONFIG_FILE: &str = "hydre.yml";

/// Environment variable consulted for the configuration path.
pub const CONFIG_FILE_ENV: &str = "HYDRE_CONFIGURATION_FILE";

/// Seconds granted to daemons to stop gracefully before they are killed.
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Seconds between two reconciliation passes.
pub const DEFAULT_INTERVAL_SECS: u64 = 5;

/// Host the control server binds when the configuration does not name one.
pub const DEFAULT_CONTROL_HOST: &str = "127.0.0.1";

// ============================================================================
// Pid-file Discovery
// ============================================================================

/// Number of reads attempted before a pid-file is declared never populated.
pub const PID_FILE_READ_ATTEMPTS: usize = 500;

/// Pause between two pid-file reads.
///
/// Together with [`PID_FILE_READ_ATTEMPTS`] this bounds discovery to roughly five
/// seconds.
pub const PID_FILE_READ_INTERVAL: Duration = Duration::from_millis(10);

// ============================================================================
// Watchers
// ============================================================================

/// Interval at which a daemon that is not our child is probed for liveness.
pub const LIVENESS_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Longest a log follower sleeps at end of file without a change notification.
pub const LOG_POLL_INTERVAL: Duration = Duration::from_millis(250);

// ============================================================================
// Control Channel
// ============================================================================

/// How long the server waits for a client to send its request line.
pub const CONTROL_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause between two non-blocking `accept` attempts on the control listener.
pub const CONTROL_ACCEPT_INTERVAL: Duration = Duration::from_millis(50);

/// Time allowed for the client to connect to a running supervisor.
pub const CONTROL_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
