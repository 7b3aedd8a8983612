// SPDX-License-Identifier: GPL-3.0-only
//! Windows Service Control Manager backend
//!
//! SCM calls block, so each one runs on tokio's blocking pool. A call the
//! caller gave up on finishes in the background; its handles are still closed.

use std::io;

use windows_sys::Win32::Foundation::{ERROR_SERVICE_ALREADY_RUNNING, ERROR_SERVICE_NOT_ACTIVE};
use windows_sys::Win32::Security::SC_HANDLE;
use windows_sys::Win32::System::Services::{
    CloseServiceHandle, ControlService, OpenSCManagerW, OpenServiceW, QueryServiceStatus,
    SC_MANAGER_CONNECT, SERVICE_CONTINUE_PENDING, SERVICE_CONTROL_STOP, SERVICE_PAUSE_PENDING,
    SERVICE_PAUSED, SERVICE_QUERY_STATUS, SERVICE_RUNNING, SERVICE_START, SERVICE_START_PENDING,
    SERVICE_STATUS, SERVICE_STOP, SERVICE_STOP_PENDING, SERVICE_STOPPED, StartServiceW,
};

use super::{ServiceManager, ServiceScope, ServiceState};
use crate::error::ServiceError;

/// Owned SCM handle, closed on drop
struct ScHandle(SC_HANDLE);

impl Drop for ScHandle {
    fn drop(&mut self) {
        // SAFETY: the handle was returned non-null by the SCM and is closed once
        unsafe {
            CloseServiceHandle(self.0);
        }
    }
}

fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn control_error(name: &str, what: &str, err: io::Error) -> ServiceError {
    ServiceError::Control {
        name: name.to_string(),
        reason: format!("{what}: {err}"),
    }
}

fn map_state(name: &str, raw: u32) -> Result<ServiceState, ServiceError> {
    Ok(match raw {
        SERVICE_STOPPED => ServiceState::Stopped,
        SERVICE_START_PENDING => ServiceState::StartPending,
        SERVICE_STOP_PENDING => ServiceState::StopPending,
        SERVICE_RUNNING => ServiceState::Running,
        SERVICE_CONTINUE_PENDING => ServiceState::ContinuePending,
        SERVICE_PAUSE_PENDING => ServiceState::PausePending,
        SERVICE_PAUSED => ServiceState::Paused,
        other => {
            return Err(ServiceError::Control {
                name: name.to_string(),
                reason: format!("unknown service state {other}"),
            });
        }
    })
}

/// Services managed by the local SCM
///
/// Every operation opens its own handles with only the access it needs, so
/// querying works without administrator rights.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScmServices;

impl ScmServices {
    /// The SCM has a single scope; `scope` only matters for systemd
    pub fn new(_scope: ServiceScope) -> Self {
        Self
    }

    fn open(name: &str, access: u32) -> Result<(ScHandle, ScHandle), ServiceError> {
        // SAFETY: null machine and database names select the local active database
        let manager =
            unsafe { OpenSCManagerW(std::ptr::null(), std::ptr::null(), SC_MANAGER_CONNECT) };
        if manager.is_null() {
            return Err(control_error(
                name,
                "cannot connect to the service control manager",
                io::Error::last_os_error(),
            ));
        }
        let manager = ScHandle(manager);

        let wide = to_wide(name);
        // SAFETY: `wide` is NUL-terminated and outlives the call
        let service = unsafe { OpenServiceW(manager.0, wide.as_ptr(), access) };
        if service.is_null() {
            return Err(control_error(
                name,
                "cannot open service",
                io::Error::last_os_error(),
            ));
        }

        // Service first so it is closed before the manager
        Ok((ScHandle(service), manager))
    }
}

/// Run a blocking SCM operation off the runtime thread
async fn on_blocking_pool<T, F>(name: &str, operation: F) -> Result<T, ServiceError>
where
    T: Send + 'static,
    F: FnOnce(&str) -> Result<T, ServiceError> + Send + 'static,
{
    let owned = name.to_string();
    tokio::task::spawn_blocking(move || operation(&owned))
        .await
        .map_err(|e| ServiceError::Control {
            name: name.to_string(),
            reason: format!("service control task failed: {e}"),
        })?
}

fn query_blocking(name: &str) -> Result<ServiceState, ServiceError> {
    let (service, _manager) = ScmServices::open(name, SERVICE_QUERY_STATUS)?;

    // SAFETY: SERVICE_STATUS is plain data; all-zero is a valid value
    let mut status: SERVICE_STATUS = unsafe { std::mem::zeroed() };
    // SAFETY: `status` is a valid, writable SERVICE_STATUS
    if unsafe { QueryServiceStatus(service.0, &mut status) } == 0 {
        return Err(control_error(
            name,
            "cannot query status",
            io::Error::last_os_error(),
        ));
    }

    map_state(name, status.dwCurrentState)
}

fn stop_blocking(name: &str) -> Result<(), ServiceError> {
    let (service, _manager) = ScmServices::open(name, SERVICE_STOP)?;

    // SAFETY: SERVICE_STATUS is plain data; all-zero is a valid value
    let mut status: SERVICE_STATUS = unsafe { std::mem::zeroed() };
    // SAFETY: `status` is a valid, writable SERVICE_STATUS
    if unsafe { ControlService(service.0, SERVICE_CONTROL_STOP, &mut status) } == 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(ERROR_SERVICE_NOT_ACTIVE as i32) {
            debug!(service = %name, "Service already stopped");
            return Ok(());
        }
        return Err(control_error(name, "stop request failed", err));
    }
    Ok(())
}

fn start_blocking(name: &str) -> Result<(), ServiceError> {
    let (service, _manager) = ScmServices::open(name, SERVICE_START)?;

    // SAFETY: no arguments are passed
    if unsafe { StartServiceW(service.0, 0, std::ptr::null()) } == 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(ERROR_SERVICE_ALREADY_RUNNING as i32) {
            debug!(service = %name, "Service already running");
            return Ok(());
        }
        return Err(control_error(name, "start request failed", err));
    }
    Ok(())
}

impl ServiceManager for ScmServices {
    async fn query(&self, name: &str) -> Result<ServiceState, ServiceError> {
        on_blocking_pool(name, query_blocking).await
    }

    async fn stop(&self, name: &str) -> Result<(), ServiceError> {
        on_blocking_pool(name, stop_blocking).await
    }

    async fn start(&self, name: &str) -> Result<(), ServiceError> {
        on_blocking_pool(name, start_blocking).await
    }
}
