// SPDX-License-Identifier: GPL-3.0-only
//! systemd backend driven through `systemctl`
//!
//! `systemctl` runs as a tokio child process. A call abandoned by the
//! caller's timeout kills the child.

use std::process::Output;

use tokio::process::Command;

use super::{ServiceManager, ServiceScope, ServiceState};
use crate::error::ServiceError;

#[derive(Debug, Clone, Copy)]
pub struct SystemdServices {
    scope: ServiceScope,
}

impl SystemdServices {
    pub fn new(scope: ServiceScope) -> Self {
        Self { scope }
    }

    async fn systemctl(&self, name: &str, args: &[&str]) -> Result<Output, ServiceError> {
        let mut command = Command::new("systemctl");
        if self.scope == ServiceScope::User {
            command.arg("--user");
        }
        command.args(args).arg(name).kill_on_drop(true);

        trace!("Running {:?}", command);
        command.output().await.map_err(|e| ServiceError::Control {
            name: name.to_string(),
            reason: format!("failed to run systemctl: {e}"),
        })
    }

    /// Run a control verb; `--no-block` leaves waiting to the caller
    async fn control(&self, name: &str, verb: &str) -> Result<(), ServiceError> {
        let output = self.systemctl(name, &[verb, "--no-block"]).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ServiceError::Control {
                name: name.to_string(),
                reason: format!(
                    "systemctl {verb} failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            })
        }
    }
}

/// Map systemd's `ActiveState` onto service states
fn map_active_state(name: &str, active_state: &str) -> Result<ServiceState, ServiceError> {
    match active_state {
        "active" | "reloading" | "refreshing" => Ok(ServiceState::Running),
        // An unknown unit reports an empty or "inactive" state
        "inactive" | "failed" | "dead" | "" => Ok(ServiceState::Stopped),
        "activating" => Ok(ServiceState::StartPending),
        "deactivating" => Ok(ServiceState::StopPending),
        other => Err(ServiceError::Control {
            name: name.to_string(),
            reason: format!("unexpected ActiveState {other:?}"),
        }),
    }
}

impl ServiceManager for SystemdServices {
    async fn query(&self, name: &str) -> Result<ServiceState, ServiceError> {
        // `show` succeeds for unknown units too, so the exit status is not checked
        let output = self
            .systemctl(name, &["show", "--property=ActiveState", "--value"])
            .await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        map_active_state(name, stdout.trim())
    }

    async fn stop(&self, name: &str) -> Result<(), ServiceError> {
        self.control(name, "stop").await
    }

    async fn start(&self, name: &str) -> Result<(), ServiceError> {
        self.control(name, "start").await
    }
}
