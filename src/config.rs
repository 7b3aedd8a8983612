// SPDX-License-Identifier: GPL-3.0-only
//! Application settings
//!
//! Built-in defaults, overridden by an optional KDL settings file,
//! overridden by command line flags (see `cli.rs`). Example file:
//!
//! ```kdl
//! target "IddSampleDriver Device"
//! service "SunshineService"
//! config-path "D:/Sunshine/config/sunshine.conf"
//! service-timeout-secs 30
//! settle-delay-ms 500
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use kdl::{KdlDocument, KdlNode, KdlValue};

use crate::engine::{EngineSettings, RetryPolicy};
use crate::error::SettingsError;
use crate::monitor::TargetDescriptor;
use crate::service::{ServiceScope, WaitPolicy};

pub const APP_NAME: &str = "virtual-monitor-helper";
pub const SETTINGS_FILE: &str = "settings.kdl";

pub const DEFAULT_TARGET: &str = "IddSampleDriver Device";

#[cfg(windows)]
pub const DEFAULT_SERVICE: &str = "SunshineService";
#[cfg(not(windows))]
pub const DEFAULT_SERVICE: &str = "sunshine";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Description of the adapter to track
    pub target: String,
    pub service: String,
    /// systemd instance owning `service`; ignored on Windows
    pub service_scope: ServiceScope,
    /// Explicit config artifact; derived from the installation root when unset
    pub config_path: Option<PathBuf>,
    pub service_timeout: Duration,
    pub poll_interval: Duration,
    pub settle_delay: Duration,
    pub retry: RetryPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        let wait = WaitPolicy::default();
        Self {
            target: DEFAULT_TARGET.to_string(),
            service: DEFAULT_SERVICE.to_string(),
            service_scope: ServiceScope::default(),
            config_path: None,
            service_timeout: wait.timeout,
            poll_interval: wait.poll_interval,
            settle_delay: Duration::ZERO,
            retry: RetryPolicy::default(),
        }
    }
}

/// First positional argument of a node
fn first_arg(node: &KdlNode) -> Option<&KdlValue> {
    node.entries()
        .iter()
        .find(|entry| entry.name().is_none())
        .map(|entry| entry.value())
}

fn string_arg(node: &KdlNode, name: &str) -> Result<String, SettingsError> {
    first_arg(node)
        .and_then(KdlValue::as_string)
        .map(str::to_string)
        .ok_or_else(|| SettingsError::InvalidValue {
            name: name.to_string(),
            reason: "expected a string".to_string(),
        })
}

fn u64_arg(node: &KdlNode, name: &str) -> Result<u64, SettingsError> {
    first_arg(node)
        .and_then(KdlValue::as_integer)
        .and_then(|value| u64::try_from(value).ok())
        .ok_or_else(|| SettingsError::InvalidValue {
            name: name.to_string(),
            reason: "expected a non-negative integer".to_string(),
        })
}

impl Settings {
    /// `<config dir>/virtual-monitor-helper/settings.kdl`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_NAME).join(SETTINGS_FILE))
    }

    /// Load settings from `explicit`, or from the default location if it exists
    pub fn load(explicit: Option<&Path>) -> Result<Self, SettingsError> {
        let (path, required) = match explicit {
            Some(path) => (path.to_path_buf(), true),
            None => match Self::default_path() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };

        match std::fs::read_to_string(&path) {
            Ok(text) => {
                info!("Loading settings from {}", path.display());
                Self::from_kdl(&text, &path)
            }
            Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No settings file at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(source) => Err(SettingsError::Read { path, source }),
        }
    }

    /// Parse a settings document on top of the defaults
    pub fn from_kdl(text: &str, path: &Path) -> Result<Self, SettingsError> {
        let document: KdlDocument = text.parse().map_err(|e: kdl::KdlError| SettingsError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let mut settings = Self::default();
        for node in document.nodes() {
            let name = node.name().value();
            match name {
                "target" => settings.target = string_arg(node, name)?,
                "service" => settings.service = string_arg(node, name)?,
                "service-scope" => {
                    settings.service_scope = string_arg(node, name)?.parse().map_err(|reason| {
                        SettingsError::InvalidValue {
                            name: name.to_string(),
                            reason,
                        }
                    })?
                }
                "config-path" => settings.config_path = Some(PathBuf::from(string_arg(node, name)?)),
                "service-timeout-secs" => {
                    settings.service_timeout = Duration::from_secs(u64_arg(node, name)?)
                }
                "poll-interval-ms" => settings.poll_interval = Duration::from_millis(u64_arg(node, name)?),
                "settle-delay-ms" => settings.settle_delay = Duration::from_millis(u64_arg(node, name)?),
                "retry-attempts" => {
                    settings.retry.max_attempts = u32::try_from(u64_arg(node, name)?).map_err(|_| {
                        SettingsError::InvalidValue {
                            name: name.to_string(),
                            reason: "too large".to_string(),
                        }
                    })?
                }
                "retry-initial-ms" => {
                    settings.retry.initial_delay = Duration::from_millis(u64_arg(node, name)?)
                }
                "retry-max-ms" => settings.retry.max_delay = Duration::from_millis(u64_arg(node, name)?),
                other => warn!("Ignoring unknown setting `{}` in {}", other, path.display()),
            }
        }

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let invalid = |name: &str, reason: &str| SettingsError::InvalidValue {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        if self.target.trim().is_empty() {
            return Err(invalid("target", "must not be empty"));
        }
        if self.service.trim().is_empty() {
            return Err(invalid("service", "must not be empty"));
        }
        if self.service_timeout.is_zero() {
            return Err(invalid("service-timeout-secs", "must be greater than zero"));
        }
        if self.poll_interval.is_zero() {
            return Err(invalid("poll-interval-ms", "must be greater than zero"));
        }
        if self.retry.max_delay < self.retry.initial_delay {
            return Err(invalid("retry-max-ms", "must not be below retry-initial-ms"));
        }
        Ok(())
    }

    /// Config artifact path: the explicit one, or the default under the installation root
    pub fn resolve_config_path(&self) -> Result<PathBuf, SettingsError> {
        match &self.config_path {
            Some(path) => Ok(path.clone()),
            None => default_config_path(),
        }
    }

    pub fn engine_settings(&self, config_path: PathBuf) -> EngineSettings {
        EngineSettings {
            target: TargetDescriptor::new(self.target.clone()),
            config_path,
            service_name: self.service.clone(),
            wait: WaitPolicy {
                timeout: self.service_timeout,
                poll_interval: self.poll_interval,
            },
            settle_delay: self.settle_delay,
            retry: self.retry,
        }
    }
}

/// Directory the downstream service is installed under
#[cfg(windows)]
pub fn install_root() -> Result<PathBuf, SettingsError> {
    std::env::var_os("ProgramFiles")
        .filter(|value| !value.is_empty())
        .map(|program_files| PathBuf::from(program_files).join("Sunshine"))
        .ok_or_else(|| SettingsError::NoInstallRoot("%ProgramFiles% is not set".to_string()))
}

/// Directory the downstream service keeps its config in
#[cfg(not(windows))]
pub fn install_root() -> Result<PathBuf, SettingsError> {
    dirs::config_dir()
        .map(|dir| dir.join("sunshine"))
        .ok_or_else(|| SettingsError::NoInstallRoot("no user config directory".to_string()))
}

pub fn default_config_path() -> Result<PathBuf, SettingsError> {
    let root = install_root()?;

    #[cfg(windows)]
    let path = root.join("config").join("sunshine.conf");
    #[cfg(not(windows))]
    let path = root.join("sunshine.conf");

    Ok(path)
}

/// Fail early when the directory that should hold the config artifact is missing
///
/// Without this, every cycle would fail on the config write and be retried
/// for nothing.
pub fn check_install_root(config_path: &Path) -> Result<(), SettingsError> {
    let dir = config_path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or(Path::new("."));

    if dir.is_dir() {
        Ok(())
    } else {
        Err(SettingsError::InstallRootMissing(dir.to_path_buf()))
    }
}
