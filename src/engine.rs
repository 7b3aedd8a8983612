// SPDX-License-Identifier: GPL-3.0-only
//! Reconciliation engine
//!
//! Keeps the downstream config's `output_name` equal to the current
//! identifier of the target display adapter.
//!
//! # States
//!
//! - `Uninitialized`: the adapter has not been resolved since startup
//! - `Resolved(id)`: the adapter was last seen with `id`
//! - `Lost`: the adapter disappeared after a change notification
//!
//! # Cycles
//!
//! Startup always runs a full reconcile when the adapter is present. A
//! topology change re-resolves the adapter and reconciles only when its
//! identifier differs from the last one written to the config. When the
//! adapter is gone the service is restarted but the config is left alone,
//! so an adapter that comes back unchanged costs nothing.
//!
//! A full reconcile writes the config, widens its permissions and restarts
//! the service, in that order. A failed write ends the cycle there; later
//! steps run even if an earlier non-write step failed.
//!
//! Notifications are handled one at a time on a single task. Nothing in
//! here ever ends the process: failures are reported through
//! [`CycleOutcome`] and logged, and retriable ones are retried with bounded
//! exponential backoff.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::error::{PermissionError, PlatformError, ServiceError, SyncError};
use crate::hotplug::TopologyChanged;
use crate::monitor::{self, DisplayId, DisplayPlatform, TargetDescriptor};
use crate::permissions::AccessGrantor;
use crate::service::{self, RestartOutcome, ServiceManager, WaitPolicy};
use crate::sync::{self, OUTPUT_NAME_KEY};

/// Backoff for cycles that failed on enumeration or on the config write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive failed cycles after which we wait for the next notification
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): doubles each time, capped
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Everything the engine needs to know about its environment
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub target: TargetDescriptor,
    pub config_path: PathBuf,
    pub service_name: String,
    pub wait: WaitPolicy,
    /// Quiet period after a notification; events arriving meanwhile join the same cycle
    pub settle_delay: Duration,
    pub retry: RetryPolicy,
}

/// The engine's only persistent state
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconciliationState {
    previous_identifier: Option<DisplayId>,
}

impl ReconciliationState {
    /// Identifier last successfully written to the config
    pub fn previous_identifier(&self) -> Option<&str> {
        self.previous_identifier.as_deref()
    }

    fn record(&mut self, identifier: DisplayId) {
        self.previous_identifier = Some(identifier);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Resolved(DisplayId),
    Lost,
}

/// Result of each step of a full reconcile
///
/// `permissions` and `restart` are `None` when the step was skipped because
/// the config write failed.
#[derive(Debug)]
pub struct ReconcileReport {
    pub identifier: DisplayId,
    pub config: Result<(), SyncError>,
    pub permissions: Option<Result<(), PermissionError>>,
    pub restart: Option<Result<RestartOutcome, ServiceError>>,
}

impl ReconcileReport {
    pub fn config_written(&self) -> bool {
        self.config.is_ok()
    }

    /// Every step ran and succeeded
    pub fn is_complete(&self) -> bool {
        self.config.is_ok()
            && matches!(self.permissions, Some(Ok(())))
            && matches!(self.restart, Some(Ok(_)))
    }
}

/// What a single cycle did
#[derive(Debug)]
pub enum CycleOutcome {
    /// Startup found no adapter; nothing was touched
    NotFound,
    /// The adapter disappeared; the service restart result is attached
    Lost {
        restart: Result<RestartOutcome, ServiceError>,
    },
    /// The adapter still has the identifier already in the config
    Unchanged(DisplayId),
    /// A full reconcile ran
    Reconciled(ReconcileReport),
    /// The display devices could not be enumerated; nothing was touched
    EnumerationFailed(PlatformError),
}

impl CycleOutcome {
    /// Cycles that changed nothing because of a possibly transient failure
    pub fn needs_retry(&self) -> bool {
        match self {
            Self::EnumerationFailed(_) => true,
            Self::Reconciled(report) => !report.config_written(),
            _ => false,
        }
    }
}

impl std::fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "device not found"),
            Self::Lost { restart } => match restart {
                Ok(outcome) => write!(f, "device lost, service {:?}", outcome),
                Err(e) => write!(f, "device lost, restart failed: {}", e),
            },
            Self::Unchanged(id) => write!(f, "unchanged at {}", id),
            Self::Reconciled(report) if report.is_complete() => {
                write!(f, "reconciled to {}", report.identifier)
            }
            Self::Reconciled(report) => write!(f, "incomplete reconcile to {}", report.identifier),
            Self::EnumerationFailed(e) => write!(f, "enumeration failed: {}", e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleKind {
    Startup,
    TopologyChange,
}

/// Pending retry bookkeeping for the event loop
#[derive(Debug, Default)]
struct RetryState {
    attempts: u32,
    due: Option<(Instant, CycleKind)>,
}

impl RetryState {
    fn reset(&mut self) {
        self.attempts = 0;
        self.due = None;
    }

    /// Schedule or clear a retry after a cycle of `kind` produced `outcome`
    fn after(&mut self, outcome: &CycleOutcome, kind: CycleKind, policy: &RetryPolicy) {
        debug!("{:?} cycle finished: {}", kind, outcome);
        if !outcome.needs_retry() {
            if self.attempts > 0 {
                info!("Recovered after {} failed attempt(s)", self.attempts);
            }
            self.reset();
            return;
        }

        self.attempts += 1;
        if self.attempts > policy.max_attempts {
            error!(
                "Giving up after {} failed attempt(s), waiting for the next display change",
                policy.max_attempts
            );
            self.due = None;
            return;
        }

        let delay = policy.delay_for(self.attempts);
        warn!(
            "Retrying in {:?} (attempt {}/{})",
            delay, self.attempts, policy.max_attempts
        );
        self.due = Some((Instant::now() + delay, kind));
    }
}

async fn sleep_until_due(due: Option<Instant>) {
    match due {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

pub struct Engine<P, S, G> {
    platform: P,
    services: S,
    grantor: G,
    settings: EngineSettings,
    state: ReconciliationState,
    phase: EngineState,
    shutdown: watch::Receiver<bool>,
}

impl<P, S, G> Engine<P, S, G>
where
    P: DisplayPlatform,
    S: ServiceManager,
    G: AccessGrantor,
{
    pub fn new(
        platform: P,
        services: S,
        grantor: G,
        settings: EngineSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            platform,
            services,
            grantor,
            settings,
            state: ReconciliationState::default(),
            phase: EngineState::Uninitialized,
            shutdown,
        }
    }

    pub fn state(&self) -> &EngineState {
        &self.phase
    }

    #[cfg(test)]
    pub fn reconciliation_state(&self) -> &ReconciliationState {
        &self.state
    }

    /// Initial cycle: reconcile unconditionally if the adapter is present
    pub async fn startup(&mut self) -> CycleOutcome {
        let target = &self.settings.target;
        let record = match monitor::resolve(&self.platform, target) {
            Ok(record) => record,
            Err(e) => {
                error!("{}", e);
                return CycleOutcome::EnumerationFailed(e);
            }
        };

        match record {
            Some(record) => {
                info!(
                    identifier = %record.identifier,
                    "Found {} as {}", record.description, record.identifier
                );
                CycleOutcome::Reconciled(self.reconcile(record.identifier).await)
            }
            None => {
                warn!("Virtual display device ({}) not found", target);
                CycleOutcome::NotFound
            }
        }
    }

    /// Cycle run for every display topology change
    pub async fn on_topology_changed(&mut self) -> CycleOutcome {
        let target = &self.settings.target;
        let record = match monitor::resolve(&self.platform, target) {
            Ok(record) => record,
            Err(e) => {
                error!("{}", e);
                return CycleOutcome::EnumerationFailed(e);
            }
        };

        let Some(record) = record else {
            warn!(
                "{} has been lost, restarting {}",
                target, self.settings.service_name
            );
            // Never resolved since startup: nothing was lost yet
            if self.state.previous_identifier().is_some() {
                self.phase = EngineState::Lost;
            }
            let restart = self.restart_service().await;
            return CycleOutcome::Lost { restart };
        };

        let identifier = record.identifier;
        if self.state.previous_identifier() == Some(identifier.as_str()) {
            info!(identifier = %identifier, "Display name has not changed");
            self.phase = EngineState::Resolved(identifier.clone());
            return CycleOutcome::Unchanged(identifier);
        }

        info!(
            identifier = %identifier,
            previous = ?self.state.previous_identifier(),
            "Display name has changed"
        );
        CycleOutcome::Reconciled(self.reconcile(identifier).await)
    }

    /// Write `identifier` to the config, open up its permissions and restart the service
    pub async fn reconcile(&mut self, identifier: DisplayId) -> ReconcileReport {
        let path = self.settings.config_path.clone();

        if let Err(e) = sync::set_key(&path, OUTPUT_NAME_KEY, &identifier) {
            error!("{}", e);
            return ReconcileReport {
                identifier,
                config: Err(e),
                permissions: None,
                restart: None,
            };
        }

        self.state.record(identifier.clone());
        self.phase = EngineState::Resolved(identifier.clone());

        let permissions = self.grantor.grant_broad_access(&path);
        if let Err(e) = &permissions {
            // A running service can still read the file it already had access to
            warn!("{}", e);
        }

        let restart = self.restart_service().await;

        ReconcileReport {
            identifier,
            config: Ok(()),
            permissions: Some(permissions),
            restart: Some(restart),
        }
    }

    async fn restart_service(&mut self) -> Result<RestartOutcome, ServiceError> {
        let result = service::restart(
            &self.services,
            &self.settings.service_name,
            self.settings.wait,
            &mut self.shutdown,
        )
        .await;

        if let Err(e) = &result {
            error!("Error restarting service: {}", e);
        }
        result
    }

    async fn run_cycle(&mut self, kind: CycleKind) -> CycleOutcome {
        match kind {
            CycleKind::Startup => self.startup().await,
            CycleKind::TopologyChange => self.on_topology_changed().await,
        }
    }

    /// Let a burst of notifications settle and fold it into one cycle
    async fn settle(&self, events: &mut mpsc::Receiver<TopologyChanged>) {
        if self.settings.settle_delay.is_zero() {
            return;
        }

        tokio::time::sleep(self.settings.settle_delay).await;
        let mut drained = 0;
        while events.try_recv().is_ok() {
            drained += 1;
        }
        if drained > 0 {
            debug!("Folded {} additional display change(s) into this cycle", drained);
        }
    }

    /// Run startup, then handle notifications until shutdown or until the
    /// notification stream ends
    pub async fn run(mut self, mut events: mpsc::Receiver<TopologyChanged>) {
        let mut retry = RetryState::default();
        let mut shutdown = self.shutdown.clone();
        let policy = self.settings.retry;

        let outcome = self.startup().await;
        retry.after(&outcome, CycleKind::Startup, &policy);

        info!("Waiting for display changes");
        loop {
            let due = retry.due.map(|(at, _)| at);

            tokio::select! {
                _ = service::shutdown_requested(&mut shutdown) => {
                    info!("Shutdown requested");
                    break;
                }
                event = events.recv() => {
                    if event.is_none() {
                        warn!("Display change notifications ended");
                        break;
                    }
                    self.settle(&mut events).await;
                    info!("The display settings changed, checking {}", self.settings.target);

                    // A fresh notification supersedes a pending retry
                    retry.reset();
                    let outcome = self.on_topology_changed().await;
                    retry.after(&outcome, CycleKind::TopologyChange, &policy);
                }
                _ = sleep_until_due(due) => {
                    let kind = retry.due.map_or(CycleKind::TopologyChange, |(_, kind)| kind);
                    retry.due = None;
                    info!("Retrying {:?} cycle", kind);
                    let outcome = self.run_cycle(kind).await;
                    retry.after(&outcome, kind, &policy);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use super::*;
    use crate::service::ServiceState;
    use crate::testing::{FakeGrantor, FakeService, ScriptedDisplays, ServiceCall, Step, StepLog};

    const TARGET: &str = "IddSampleDriver Device";

    struct Fixture {
        _dir: tempfile::TempDir,
        config_path: PathBuf,
        displays: ScriptedDisplays,
        service: FakeService,
        grantor: FakeGrantor,
        log: StepLog,
        shutdown: watch::Sender<bool>,
        engine: Engine<ScriptedDisplays, FakeService, FakeGrantor>,
    }

    fn settings(config_path: &Path) -> EngineSettings {
        EngineSettings {
            target: TargetDescriptor::new(TARGET),
            config_path: config_path.to_path_buf(),
            service_name: "SunshineService".to_string(),
            wait: WaitPolicy {
                timeout: Duration::from_secs(5),
                poll_interval: Duration::from_millis(100),
            },
            settle_delay: Duration::ZERO,
            retry: RetryPolicy::default(),
        }
    }

    fn fixture(config: Option<&str>, devices: Vec<(&str, &str)>) -> Fixture {
        fixture_with(config, devices, |_| {})
    }

    fn fixture_with(
        config: Option<&str>,
        devices: Vec<(&str, &str)>,
        adjust: impl FnOnce(&mut EngineSettings),
    ) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("sunshine.conf");
        if let Some(content) = config {
            fs::write(&config_path, content).unwrap();
        }

        let log = StepLog::default();
        let displays = ScriptedDisplays::fixed(devices);
        let service = FakeService::running().logging_to(&log);
        let grantor = FakeGrantor::default().logging_to(&log);
        let mut settings = settings(&config_path);
        adjust(&mut settings);
        let (shutdown, rx) = watch::channel(false);
        let engine = Engine::new(displays.clone(), service.clone(), grantor.clone(), settings, rx);

        Fixture {
            _dir: dir,
            config_path,
            displays,
            service,
            grantor,
            log,
            shutdown,
            engine,
        }
    }

    fn read(path: &Path) -> String {
        fs::read_to_string(path).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_reconciles_found_device() {
        let mut f = fixture(
            Some("resolution = 1920x1080\n"),
            vec![
                ("Generic Monitor", r"\\.\DISPLAY1"),
                (TARGET, r"\\.\DISPLAY5"),
            ],
        );

        let outcome = f.engine.startup().await;

        let CycleOutcome::Reconciled(report) = outcome else {
            panic!("expected a reconcile");
        };
        assert!(report.is_complete());
        assert_eq!(
            read(&f.config_path),
            "resolution = 1920x1080\noutput_name = \\\\.\\DISPLAY5\n"
        );
        assert_eq!(f.grantor.grants(), vec![f.config_path.clone()]);
        assert_eq!(f.service.restarts(), 1);
        assert_eq!(f.engine.state(), &EngineState::Resolved(r"\\.\DISPLAY5".to_string()));
        assert_eq!(
            f.engine.reconciliation_state().previous_identifier(),
            Some(r"\\.\DISPLAY5")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_without_device_touches_nothing() {
        let mut f = fixture(Some("fps = 60\n"), vec![("Generic Monitor", r"\\.\DISPLAY1")]);

        let outcome = f.engine.startup().await;

        assert!(matches!(outcome, CycleOutcome::NotFound));
        assert_eq!(read(&f.config_path), "fps = 60\n");
        assert_eq!(f.service.restarts(), 0);
        assert!(f.grantor.grants().is_empty());
        assert_eq!(f.engine.state(), &EngineState::Uninitialized);
        assert_eq!(f.engine.reconciliation_state().previous_identifier(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_notification_restarts_once() {
        let mut f = fixture(Some("fps = 60\n"), Vec::new());
        assert!(matches!(f.engine.startup().await, CycleOutcome::NotFound));

        f.displays.set(vec![(TARGET, r"\\.\DISPLAY5")]);
        let first = f.engine.on_topology_changed().await;
        let second = f.engine.on_topology_changed().await;

        assert!(matches!(first, CycleOutcome::Reconciled(_)));
        assert!(matches!(second, CycleOutcome::Unchanged(ref id) if id == r"\\.\DISPLAY5"));
        assert_eq!(f.service.restarts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_changed_identifier_updates_config() {
        let mut f = fixture(
            Some("resolution = 1920x1080\noutput_name = \\\\.\\DISPLAY3\n"),
            vec![(TARGET, r"\\.\DISPLAY3")],
        );
        f.engine.startup().await;

        f.displays.set(vec![(TARGET, r"\\.\DISPLAY5")]);
        let outcome = f.engine.on_topology_changed().await;

        assert!(matches!(outcome, CycleOutcome::Reconciled(ref r) if r.is_complete()));
        assert_eq!(
            read(&f.config_path),
            "resolution = 1920x1080\noutput_name = \\\\.\\DISPLAY5\n"
        );
        assert_eq!(f.service.restarts(), 2);
        assert_eq!(
            f.engine.reconciliation_state().previous_identifier(),
            Some(r"\\.\DISPLAY5")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_device_restarts_without_touching_config() {
        let mut f = fixture(Some("fps = 60\n"), vec![(TARGET, r"\\.\DISPLAY5")]);
        f.engine.startup().await;
        let written = read(&f.config_path);
        let restarts_before = f.service.restarts();
        let grants_before = f.grantor.grants().len();

        f.displays.set(Vec::new());
        let outcome = f.engine.on_topology_changed().await;

        assert!(matches!(
            outcome,
            CycleOutcome::Lost {
                restart: Ok(RestartOutcome::Restarted)
            }
        ));
        assert_eq!(f.service.restarts(), restarts_before + 1);
        assert_eq!(f.grantor.grants().len(), grants_before);
        assert_eq!(read(&f.config_path), written);
        assert_eq!(f.engine.state(), &EngineState::Lost);
        assert_eq!(
            f.engine.reconciliation_state().previous_identifier(),
            Some(r"\\.\DISPLAY5")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_returning_unchanged_is_a_no_op() {
        let mut f = fixture(Some("fps = 60\n"), vec![(TARGET, r"\\.\DISPLAY5")]);
        f.engine.startup().await;
        f.displays.set(Vec::new());
        f.engine.on_topology_changed().await;
        let restarts = f.service.restarts();

        f.displays.set(vec![(TARGET, r"\\.\DISPLAY5")]);
        let outcome = f.engine.on_topology_changed().await;

        assert!(matches!(outcome, CycleOutcome::Unchanged(_)));
        assert_eq!(f.service.restarts(), restarts);
        assert_eq!(f.engine.state(), &EngineState::Resolved(r"\\.\DISPLAY5".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_config_failure_skips_remaining_steps() {
        let mut f = fixture(None, vec![(TARGET, r"\\.\DISPLAY5")]);

        let outcome = f.engine.startup().await;

        assert!(outcome.needs_retry());
        let CycleOutcome::Reconciled(report) = outcome else {
            panic!("expected a reconcile attempt");
        };
        assert!(matches!(report.config, Err(SyncError::Read { .. })));
        assert!(report.permissions.is_none());
        assert!(report.restart.is_none());
        assert!(f.grantor.grants().is_empty());
        assert_eq!(f.service.restarts(), 0);
        assert_eq!(f.engine.reconciliation_state().previous_identifier(), None);
        assert_eq!(f.engine.state(), &EngineState::Uninitialized);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_failure_still_restarts() {
        let mut f = fixture(Some("fps = 60\n"), vec![(TARGET, r"\\.\DISPLAY5")]);
        f.grantor.fail_with("access denied");

        let outcome = f.engine.startup().await;

        let CycleOutcome::Reconciled(report) = outcome else {
            panic!("expected a reconcile");
        };
        assert!(matches!(report.permissions, Some(Err(_))));
        assert!(matches!(report.restart, Some(Ok(RestartOutcome::Restarted))));
        assert_eq!(f.service.restarts(), 1);
        assert_eq!(
            f.engine.reconciliation_state().previous_identifier(),
            Some(r"\\.\DISPLAY5")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_timeout_keeps_written_identifier() {
        let mut f = fixture(Some("fps = 60\n"), vec![(TARGET, r"\\.\DISPLAY5")]);
        f.service.set_stuck_stopping();

        let outcome = f.engine.startup().await;

        assert!(!outcome.needs_retry());
        let CycleOutcome::Reconciled(report) = outcome else {
            panic!("expected a reconcile");
        };
        assert!(matches!(report.restart, Some(Err(ServiceError::Timeout { .. }))));
        assert_eq!(
            f.engine.reconciliation_state().previous_identifier(),
            Some(r"\\.\DISPLAY5")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_enumeration_failure_touches_nothing() {
        let mut f = fixture(Some("fps = 60\n"), Vec::new());
        f.displays.fail();

        let outcome = f.engine.on_topology_changed().await;

        assert!(matches!(outcome, CycleOutcome::EnumerationFailed(_)));
        assert!(outcome.needs_retry());
        assert_eq!(f.service.restarts(), 0);
        assert_eq!(f.engine.state(), &EngineState::Uninitialized);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_handles_notifications_in_order() {
        let f = fixture(Some("fps = 60\n"), Vec::new());
        let (tx, rx) = mpsc::channel(8);
        let displays = f.displays.clone();

        let driver = async {
            displays.set(vec![(TARGET, r"\\.\DISPLAY5")]);
            tx.send(TopologyChanged).await.unwrap();
            tx.send(TopologyChanged).await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
            drop(tx);
        };
        tokio::join!(f.engine.run(rx), driver);

        assert_eq!(f.service.restarts(), 1);
        assert_eq!(read(&f.config_path), "fps = 60\noutput_name = \\\\.\\DISPLAY5\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retries_failed_config_write() {
        let f = fixture(None, vec![(TARGET, r"\\.\DISPLAY5")]);
        let (tx, rx) = mpsc::channel(8);
        let path = f.config_path.clone();

        let driver = async {
            // First retry fires after RetryPolicy::default().initial_delay
            tokio::time::sleep(Duration::from_secs(1)).await;
            fs::write(&path, "fps = 60\n").unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(tx);
        };
        tokio::join!(f.engine.run(rx), driver);

        assert_eq!(read(&f.config_path), "fps = 60\noutput_name = \\\\.\\DISPLAY5\n");
        assert_eq!(f.service.restarts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let f = fixture(Some("fps = 60\n"), Vec::new());
        let (_tx, rx) = mpsc::channel::<TopologyChanged>(8);
        let shutdown = &f.shutdown;

        let driver = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            shutdown.send(true).unwrap();
        };
        tokio::join!(f.engine.run(rx), driver);

        assert_eq!(f.service.state(), ServiceState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_writes_then_grants_then_restarts() {
        let mut f = fixture(Some("fps = 60\n"), vec![(TARGET, r"\\.\DISPLAY5")]);

        f.engine.startup().await;

        assert_eq!(
            f.log.steps(),
            vec![
                Step::Grant {
                    config: "fps = 60\noutput_name = \\\\.\\DISPLAY5\n".to_string()
                },
                Step::Service(ServiceCall::Stop),
                Step::Service(ServiceCall::Start),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_before_first_resolve_stays_uninitialized() {
        let mut f = fixture(Some("fps = 60\n"), Vec::new());
        f.engine.startup().await;

        let outcome = f.engine.on_topology_changed().await;

        assert!(matches!(
            outcome,
            CycleOutcome::Lost {
                restart: Ok(RestartOutcome::Restarted)
            }
        ));
        assert_eq!(f.service.restarts(), 1);
        assert_eq!(f.engine.state(), &EngineState::Uninitialized);
        assert_eq!(read(&f.config_path), "fps = 60\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_folds_burst_into_one_cycle() {
        let f = fixture_with(Some("fps = 60\n"), Vec::new(), |settings| {
            settings.settle_delay = Duration::from_millis(500);
        });
        let (tx, rx) = mpsc::channel(8);
        let displays = f.displays.clone();

        let driver = async {
            tx.send(TopologyChanged).await.unwrap();
            // The adapter shows up halfway through the burst
            tokio::time::sleep(Duration::from_millis(100)).await;
            displays.set(vec![(TARGET, r"\\.\DISPLAY5")]);
            tx.send(TopologyChanged).await.unwrap();
            tx.send(TopologyChanged).await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(tx);
        };
        tokio::join!(f.engine.run(rx), driver);

        // Startup plus a single cycle for the whole burst
        assert_eq!(f.displays.enumerations(), 2);
        assert_eq!(f.service.restarts(), 1);
        assert_eq!(read(&f.config_path), "fps = 60\noutput_name = \\\\.\\DISPLAY5\n");
        assert_eq!(
            f.log.steps(),
            vec![
                Step::Grant {
                    config: "fps = 60\noutput_name = \\\\.\\DISPLAY5\n".to_string()
                },
                Step::Service(ServiceCall::Stop),
                Step::Service(ServiceCall::Start),
            ]
        );
    }

    #[test]
    fn test_outcome_summary() {
        let lost = CycleOutcome::Lost {
            restart: Err(ServiceError::Cancelled("SunshineService".to_string())),
        };
        assert!(lost.to_string().starts_with("device lost, restart failed"));
        assert_eq!(
            CycleOutcome::Unchanged(r"\\.\DISPLAY5".to_string()).to_string(),
            r"unchanged at \\.\DISPLAY5"
        );
        assert_eq!(CycleOutcome::NotFound.to_string(), "device not found");
    }

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
        };

        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(4), Duration::from_secs(10));
        assert_eq!(policy.delay_for(64), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 2,
            ..RetryPolicy::default()
        };
        let mut retry = RetryState::default();
        let failed = || CycleOutcome::EnumerationFailed(PlatformError::Enumeration("boom".into()));

        retry.after(&failed(), CycleKind::Startup, &policy);
        assert!(matches!(retry.due, Some((_, CycleKind::Startup))));
        retry.after(&failed(), CycleKind::Startup, &policy);
        assert!(retry.due.is_some());
        retry.after(&failed(), CycleKind::Startup, &policy);
        assert!(retry.due.is_none());

        retry.after(&CycleOutcome::NotFound, CycleKind::TopologyChange, &policy);
        assert_eq!(retry.attempts, 0);
    }
}
