// SPDX-License-Identifier: GPL-3.0-only
//! Error types for the application
//!
//! Each component reports its own error type so the reconciliation engine
//! can tell which step of a cycle failed and react accordingly.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::service::ServiceState;

/// Failure talking to the OS display subsystem
#[derive(Error, Debug)]
pub enum PlatformError {
    /// Enumerating display devices failed
    #[error("Failed to enumerate display devices: {0}")]
    Enumeration(String),

    /// Subscribing to topology-change notifications failed
    #[error("Failed to subscribe to display changes: {0}")]
    Subscription(String),

    /// I/O error while reading device information
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure reading or rewriting the config artifact
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failure widening access on the config artifact
#[derive(Error, Debug)]
pub enum PermissionError {
    #[error("Failed to change permissions on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Permission tool rejected {path}: {reason}")]
    #[cfg_attr(unix, allow(dead_code))] // Only icacls reports a rejection
    Rejected { path: PathBuf, reason: String },
}

/// Failure controlling the downstream service
#[derive(Error, Debug)]
pub enum ServiceError {
    /// The service did not reach the expected state in time
    #[error("Service {name} did not reach {expected:?} within {timeout:?} (last seen {last:?})")]
    Timeout {
        name: String,
        expected: ServiceState,
        last: ServiceState,
        timeout: Duration,
    },

    /// The OS refused or failed a control request
    #[error("Service control error on {name}: {reason}")]
    Control { name: String, reason: String },

    /// Shutdown was requested while waiting for a state transition
    #[error("Waiting on service {0} was cancelled")]
    Cancelled(String),
}

/// Configuration-level problems; these are fatal at startup
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid settings file {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("Invalid value for setting `{name}`: {reason}")]
    InvalidValue { name: String, reason: String },

    /// The installation root could not be determined
    #[error("Could not determine installation root: {0}")]
    NoInstallRoot(String),

    /// The directory that should hold the config artifact does not exist
    #[error("Installation directory {0} does not exist")]
    InstallRootMissing(PathBuf),
}
