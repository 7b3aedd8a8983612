// SPDX-License-Identifier: GPL-3.0-only
//! Downstream service control
//!
//! The restart sequence (query, stop, wait, start, wait) is platform
//! independent and lives here. Backends only translate single operations:
//! - Windows: the Service Control Manager, on the blocking thread pool
//! - Linux: systemd through `systemctl`, as a tokio child process
//!
//! Every backend call is bounded by the wait policy's timeout and abandoned
//! on shutdown, so a hung service manager cannot stall the event loop.

#[cfg(windows)]
mod scm;
#[cfg(target_os = "linux")]
mod systemd;

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::ServiceError;

#[cfg(windows)]
pub use scm::ScmServices as SystemServices;
#[cfg(target_os = "linux")]
pub use systemd::SystemdServices as SystemServices;

/// Service control is unavailable; every request fails
#[cfg(not(any(windows, target_os = "linux")))]
#[derive(Debug, Clone, Copy)]
pub struct SystemServices;

#[cfg(not(any(windows, target_os = "linux")))]
impl SystemServices {
    pub fn new(_scope: ServiceScope) -> Self {
        Self
    }
}

#[cfg(not(any(windows, target_os = "linux")))]
impl ServiceManager for SystemServices {
    async fn query(&self, name: &str) -> Result<ServiceState, ServiceError> {
        Err(ServiceError::Control {
            name: name.to_string(),
            reason: "service control is not supported on this platform".to_string(),
        })
    }

    async fn stop(&self, name: &str) -> Result<(), ServiceError> {
        self.query(name).await.map(|_| ())
    }

    async fn start(&self, name: &str) -> Result<(), ServiceError> {
        self.query(name).await.map(|_| ())
    }
}

/// Run state of a service as reported by the OS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(not(windows), allow(dead_code))] // The pause states only exist in the SCM
pub enum ServiceState {
    Stopped,
    StartPending,
    StopPending,
    Running,
    ContinuePending,
    PausePending,
    Paused,
}

/// Which service manager instance owns the service (systemd only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServiceScope {
    #[default]
    User,
    System,
}

impl std::str::FromStr for ServiceScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "user" => Ok(Self::User),
            "system" => Ok(Self::System),
            other => Err(format!("expected \"user\" or \"system\", got \"{other}\"")),
        }
    }
}

/// Single service operations provided by the OS
pub trait ServiceManager {
    async fn query(&self, name: &str) -> Result<ServiceState, ServiceError>;

    /// Request a stop; does not wait for it to complete
    async fn stop(&self, name: &str) -> Result<(), ServiceError>;

    /// Request a start; does not wait for it to complete
    async fn start(&self, name: &str) -> Result<(), ServiceError>;
}

/// What [`restart`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartOutcome {
    Restarted,
    /// The service was not running and was left alone
    NotRunning,
}

/// Bounds for waiting on a state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// Resolves once `true` has been published on the shutdown channel
///
/// A dropped sender means shutdown can no longer be requested, so this
/// then never resolves.
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Run one backend call, bounded by `policy.timeout` and by shutdown
async fn bounded<T>(
    name: &str,
    operation: &str,
    policy: WaitPolicy,
    shutdown: &mut watch::Receiver<bool>,
    call: impl Future<Output = Result<T, ServiceError>>,
) -> Result<T, ServiceError> {
    tokio::select! {
        result = tokio::time::timeout(policy.timeout, call) => {
            result.unwrap_or_else(|_| Err(ServiceError::Control {
                name: name.to_string(),
                reason: format!("{operation} request got no answer within {:?}", policy.timeout),
            }))
        }
        _ = shutdown_requested(shutdown) => Err(ServiceError::Cancelled(name.to_string())),
    }
}

async fn wait_for_state<S>(
    manager: &S,
    name: &str,
    expected: ServiceState,
    policy: WaitPolicy,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), ServiceError>
where
    S: ServiceManager,
{
    let deadline = Instant::now() + policy.timeout;

    loop {
        let state = bounded(name, "query", policy, shutdown, manager.query(name)).await?;
        if state == expected {
            return Ok(());
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(ServiceError::Timeout {
                name: name.to_string(),
                expected,
                last: state,
                timeout: policy.timeout,
            });
        }

        trace!(service = %name, "Waiting for {:?}, currently {:?}", expected, state);
        tokio::select! {
            _ = tokio::time::sleep(policy.poll_interval.min(deadline - now)) => {}
            _ = shutdown_requested(shutdown) => {
                return Err(ServiceError::Cancelled(name.to_string()));
            }
        }
    }
}

/// Restart `name` if it is running
///
/// Stops the service and waits for `Stopped`, then starts it and waits for
/// `Running`. Each wait is bounded by `policy.timeout` and abandoned when
/// shutdown is requested. A service that is not running is not started.
pub async fn restart<S>(
    manager: &S,
    name: &str,
    policy: WaitPolicy,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<RestartOutcome, ServiceError>
where
    S: ServiceManager,
{
    let state = bounded(name, "query", policy, shutdown, manager.query(name)).await?;
    if state != ServiceState::Running {
        info!(service = %name, "Service is not running ({:?}), leaving it alone", state);
        return Ok(RestartOutcome::NotRunning);
    }

    info!(service = %name, "Stopping service");
    bounded(name, "stop", policy, shutdown, manager.stop(name)).await?;
    wait_for_state(manager, name, ServiceState::Stopped, policy, shutdown).await?;

    info!(service = %name, "Starting service");
    bounded(name, "start", policy, shutdown, manager.start(name)).await?;
    wait_for_state(manager, name, ServiceState::Running, policy, shutdown).await?;

    info!(service = %name, "Service restarted");
    Ok(RestartOutcome::Restarted)
}
