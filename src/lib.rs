//! Hydre is a small supervisor for groups of daemons. It either runs a group fail-fast,
//! tearing every daemon down as soon as one of them or one of its log streams fails, or
//! keeps every daemon in a desired state that clients toggle over a local text control
//! channel. It can serve as the init process of a container and reaps orphans there.

/// CLI interface.
pub mod cli;

/// Configuration management.
pub mod config;

/// Timing budgets and defaults.
pub mod constants;

/// Control channel server and client.
pub mod control;

/// Daemon process management.
pub mod daemon;

/// Error handling.
pub mod error;

/// Fault events shared by every watcher.
pub mod fault;

/// Fail-fast group supervision.
pub mod group;

/// Log file streaming.
pub mod logs;

/// OS process handles.
pub mod process;

/// Reaper of exited children.
pub mod reaper;

/// Self-healing reconciliation loop.
pub mod reconcile;

/// Supervisor runtime that powers the self-healing mode.
pub mod supervisor;

#[cfg(test)]
mod test_utils;
