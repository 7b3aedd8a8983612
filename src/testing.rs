// SPDX-License-Identifier: GPL-3.0-only
//! Scripted stand-ins for the OS, used by unit tests
//!
//! Each fake is a cheap handle over shared state: tests keep a clone to
//! steer or inspect the fake after handing another clone to the engine.

use std::cell::{Cell, RefCell};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::error::{PermissionError, PlatformError, ServiceError};
use crate::monitor::{DeviceRecord, DisplayPlatform};
use crate::permissions::AccessGrantor;
use crate::service::{ServiceManager, ServiceState};

/// Display enumeration returning whatever the test last set
#[derive(Debug, Clone, Default)]
pub struct ScriptedDisplays {
    devices: Rc<RefCell<Option<Vec<(String, String)>>>>,
    enumerations: Rc<Cell<usize>>,
}

impl ScriptedDisplays {
    /// Always enumerate `(description, identifier)` pairs in this order
    pub fn fixed(devices: Vec<(&str, &str)>) -> Self {
        let displays = Self::default();
        displays.set(devices);
        displays
    }

    pub fn failing() -> Self {
        let displays = Self::default();
        displays.fail();
        displays
    }

    pub fn set(&self, devices: Vec<(&str, &str)>) {
        let devices = devices
            .into_iter()
            .map(|(description, identifier)| (description.to_string(), identifier.to_string()))
            .collect();
        *self.devices.borrow_mut() = Some(devices);
    }

    /// Make every following enumeration fail
    pub fn fail(&self) {
        *self.devices.borrow_mut() = None;
    }

    /// Number of enumerations performed so far
    pub fn enumerations(&self) -> usize {
        self.enumerations.get()
    }
}

impl DisplayPlatform for ScriptedDisplays {
    fn enumerate_display_devices(&self) -> Result<Vec<DeviceRecord>, PlatformError> {
        self.enumerations.set(self.enumerations.get() + 1);
        let devices = self.devices.borrow();
        let devices = devices
            .as_ref()
            .ok_or_else(|| PlatformError::Enumeration("scripted failure".to_string()))?;

        Ok(devices
            .iter()
            .enumerate()
            .map(|(index, (description, identifier))| {
                DeviceRecord::new(description.as_str(), identifier.as_str(), index as u32)
            })
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceCall {
    Stop,
    Start,
}

/// A side effect observed by a fake, in the order it happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Permissions were granted; carries the config content at that moment
    Grant { config: String },
    Service(ServiceCall),
}

/// Side effects shared between several fakes
#[derive(Debug, Clone, Default)]
pub struct StepLog {
    steps: Rc<RefCell<Vec<Step>>>,
}

impl StepLog {
    pub fn steps(&self) -> Vec<Step> {
        self.steps.borrow().clone()
    }

    fn push(&self, step: Step) {
        self.steps.borrow_mut().push(step);
    }
}

#[derive(Debug)]
struct ServiceInner {
    state: ServiceState,
    /// State to settle into and the number of queries left before it does
    pending: Option<(ServiceState, u32)>,
    transition_polls: u32,
    stuck_stopping: bool,
    failing_stop: bool,
    hanging_queries: bool,
    calls: Vec<ServiceCall>,
    log: Option<StepLog>,
}

impl ServiceInner {
    fn record(&mut self, call: ServiceCall) {
        self.calls.push(call);
        if let Some(log) = &self.log {
            log.push(Step::Service(call));
        }
    }
}

/// In-memory service whose transitions take a configurable number of polls
#[derive(Debug, Clone)]
pub struct FakeService {
    inner: Rc<RefCell<ServiceInner>>,
}

impl FakeService {
    fn with_state(state: ServiceState) -> Self {
        Self {
            inner: Rc::new(RefCell::new(ServiceInner {
                state,
                pending: None,
                transition_polls: 0,
                stuck_stopping: false,
                failing_stop: false,
                hanging_queries: false,
                calls: Vec::new(),
                log: None,
            })),
        }
    }

    pub fn running() -> Self {
        Self::with_state(ServiceState::Running)
    }

    pub fn stopped() -> Self {
        Self::with_state(ServiceState::Stopped)
    }

    /// Report the pending state for `polls` queries before settling
    pub fn with_transition_polls(self, polls: u32) -> Self {
        self.inner.borrow_mut().transition_polls = polls;
        self
    }

    /// Accept stop requests but never finish stopping
    pub fn stuck_stopping(self) -> Self {
        self.set_stuck_stopping();
        self
    }

    pub fn set_stuck_stopping(&self) {
        self.inner.borrow_mut().stuck_stopping = true;
    }

    pub fn failing_stop(self) -> Self {
        self.inner.borrow_mut().failing_stop = true;
        self
    }

    /// Never answer state queries
    pub fn hanging(self) -> Self {
        self.inner.borrow_mut().hanging_queries = true;
        self
    }

    pub fn logging_to(self, log: &StepLog) -> Self {
        self.inner.borrow_mut().log = Some(log.clone());
        self
    }

    pub fn state(&self) -> ServiceState {
        self.inner.borrow().state
    }

    pub fn calls(&self) -> Vec<ServiceCall> {
        self.inner.borrow().calls.clone()
    }

    /// Number of start requests, i.e. restarts that got past the stop
    pub fn restarts(&self) -> usize {
        self.inner
            .borrow()
            .calls
            .iter()
            .filter(|&&call| call == ServiceCall::Start)
            .count()
    }
}

impl ServiceManager for FakeService {
    async fn query(&self, _name: &str) -> Result<ServiceState, ServiceError> {
        if self.inner.borrow().hanging_queries {
            std::future::pending::<()>().await;
        }

        let mut inner = self.inner.borrow_mut();
        if let Some((target, remaining)) = inner.pending {
            if remaining == 0 {
                inner.state = target;
                inner.pending = None;
            } else {
                inner.pending = Some((target, remaining - 1));
            }
        }
        Ok(inner.state)
    }

    async fn stop(&self, name: &str) -> Result<(), ServiceError> {
        let mut inner = self.inner.borrow_mut();
        inner.record(ServiceCall::Stop);
        if inner.failing_stop {
            return Err(ServiceError::Control {
                name: name.to_string(),
                reason: "access denied".to_string(),
            });
        }
        inner.state = ServiceState::StopPending;
        if !inner.stuck_stopping {
            inner.pending = Some((ServiceState::Stopped, inner.transition_polls));
        }
        Ok(())
    }

    async fn start(&self, _name: &str) -> Result<(), ServiceError> {
        let mut inner = self.inner.borrow_mut();
        inner.record(ServiceCall::Start);
        inner.state = ServiceState::StartPending;
        inner.pending = Some((ServiceState::Running, inner.transition_polls));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct GrantorInner {
    grants: Vec<PathBuf>,
    failure: Option<String>,
    log: Option<StepLog>,
}

/// Records grants instead of touching the file system
#[derive(Debug, Clone, Default)]
pub struct FakeGrantor {
    inner: Rc<RefCell<GrantorInner>>,
}

impl FakeGrantor {
    pub fn logging_to(self, log: &StepLog) -> Self {
        self.inner.borrow_mut().log = Some(log.clone());
        self
    }

    pub fn fail_with(&self, reason: &str) {
        self.inner.borrow_mut().failure = Some(reason.to_string());
    }

    /// Paths successfully granted, in order
    pub fn grants(&self) -> Vec<PathBuf> {
        self.inner.borrow().grants.clone()
    }
}

impl AccessGrantor for FakeGrantor {
    fn grant_broad_access(&self, path: &Path) -> Result<(), PermissionError> {
        let mut inner = self.inner.borrow_mut();
        if let Some(reason) = &inner.failure {
            return Err(PermissionError::Rejected {
                path: path.to_path_buf(),
                reason: reason.clone(),
            });
        }
        inner.grants.push(path.to_path_buf());
        if let Some(log) = &inner.log {
            log.push(Step::Grant {
                config: fs::read_to_string(path).unwrap_or_default(),
            });
        }
        Ok(())
    }
}
