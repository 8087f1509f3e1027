//! Process supervisor - launches services in dependency order, restarts
//! crashed ones and shuts everything down in reverse order

use crate::config::{ResolvedConfig, Settings};
use crate::runtime::backoff::Backoff;
use crate::runtime::process::{
    EventSender, ProcessConfig, ProcessError, ProcessEvent, ProcessNotice, RunningProcess,
    ServiceState,
};
use crate::runtime::state::{ServiceStatus, StatusSnapshot};
use crate::runtime::volume::{VolumeError, VolumeManager};
use crate::service::ServiceDefinition;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

/// Supervisor tunables
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How long a service may wait for its dependencies to become Ready
    pub dependency_timeout: Duration,
    pub backoff: Backoff,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for SupervisorConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            dependency_timeout: Duration::from_millis(settings.dependency_timeout_ms),
            backoff: Backoff::new(
                Duration::from_millis(settings.backoff_initial_ms),
                Duration::from_millis(settings.backoff_max_ms),
            ),
        }
    }
}

/// A service ready to be handed to the supervisor
#[derive(Debug, Clone)]
pub struct PreparedService {
    pub definition: Arc<ServiceDefinition>,
    pub config: ResolvedConfig,
}

struct ServiceSlot {
    def: Arc<ServiceDefinition>,
    config: ResolvedConfig,
    state: ServiceState,
    process: Option<RunningProcess>,
    restart_count: u32,
    /// Set while Pending; the dependency timeout counts from here
    waiting_since: Option<Instant>,
    restart_at: Option<Instant>,
    started_at: Option<DateTime<Utc>>,
    last_exit_code: Option<i32>,
    last_error: Option<String>,
}

impl ServiceSlot {
    fn is_settled(&self) -> bool {
        matches!(self.state, ServiceState::Failed | ServiceState::Stopped)
            && self.restart_at.is_none()
            && self.process.is_none()
    }

    fn status(&self) -> ServiceStatus {
        ServiceStatus {
            name: self.def.name.clone(),
            state: self.state,
            pid: self.process.as_ref().and_then(|p| p.pid),
            restart_count: self.restart_count,
            started_at: self.started_at,
            last_exit_code: self.last_exit_code,
            last_error: self.last_error.clone(),
        }
    }
}

/// Result of a supervisor run
#[derive(Debug)]
pub struct SupervisorReport {
    /// Service failures surfaced during the run, in the order they happened
    pub failures: Vec<SupervisorError>,
    /// Status of every service when the run ended
    pub services: Vec<ServiceStatus>,
}

impl SupervisorReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn has_dependency_timeout(&self) -> bool {
        self.failures
            .iter()
            .any(|f| matches!(f, SupervisorError::DependencyTimeout { .. }))
    }

    pub fn service(&self, name: &str) -> Option<&ServiceStatus> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Process exit code: 4 for a dependency timeout, 1 for any other failure
    pub fn exit_code(&self) -> u8 {
        if self.has_dependency_timeout() {
            4
        } else if self.is_success() {
            0
        } else {
            1
        }
    }
}

/// Owns the registry of services and drives their state machines.
///
/// All transitions happen on the task running [`Supervisor::run`]; process
/// exits, readiness and output arrive as events on a single channel.
pub struct Supervisor {
    config: SupervisorConfig,
    volumes: VolumeManager,
    registry: IndexMap<String, ServiceSlot>,
    /// First-launch order, reversed on shutdown
    launch_order: Vec<String>,
    next_instance: u64,
    event_tx: EventSender,
    event_rx: mpsc::UnboundedReceiver<ProcessNotice>,
    status_tx: watch::Sender<StatusSnapshot>,
    failures: Vec<SupervisorError>,
    stopping: bool,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(StatusSnapshot::default());

        Self {
            config,
            volumes: VolumeManager::new(),
            registry: IndexMap::new(),
            launch_order: Vec::new(),
            next_instance: 1,
            event_tx,
            event_rx,
            status_tx,
            failures: Vec::new(),
            stopping: false,
        }
    }

    /// Receive a snapshot after every state change
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.status_tx.subscribe()
    }

    /// Register services in start order and launch those without dependencies.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self, services: Vec<PreparedService>) {
        self.stopping = false;
        let now = Instant::now();

        log::info!("Starting {} services...", services.len());
        for service in services {
            let name = service.definition.name.clone();
            self.registry.insert(
                name,
                ServiceSlot {
                    def: service.definition,
                    config: service.config,
                    state: ServiceState::Pending,
                    process: None,
                    restart_count: 0,
                    waiting_since: Some(now),
                    restart_at: None,
                    started_at: None,
                    last_exit_code: None,
                    last_error: None,
                },
            );
        }

        self.launch_eligible();
        self.publish();
    }

    /// Process events until shutdown is requested or every service has
    /// settled, then stop whatever still runs.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> SupervisorReport {
        let mut shutdown_open = true;

        loop {
            if *shutdown.borrow() {
                log::info!("Shutdown requested");
                break;
            }
            if self.registry.values().all(ServiceSlot::is_settled) {
                log::info!("All services have stopped");
                break;
            }

            let deadline = self.next_deadline();

            tokio::select! {
                changed = shutdown.changed(), if shutdown_open => {
                    if changed.is_err() {
                        shutdown_open = false;
                    }
                }
                Some(notice) = self.event_rx.recv() => self.handle_notice(notice),
                _ = sleep_until(deadline) => self.on_timer(Instant::now()),
            }
        }

        self.stop().await;

        SupervisorReport {
            failures: std::mem::take(&mut self.failures),
            services: self.status_tx.borrow().services.clone(),
        }
    }

    /// Stop every running instance in reverse launch order and clear the
    /// registry. The last published snapshot keeps the final states.
    ///
    /// Pending restarts and dependency waits are cancelled first.
    pub async fn stop(&mut self) {
        self.stopping = true;
        log::info!("Shutting down all services...");

        for slot in self.registry.values_mut() {
            slot.waiting_since = None;
            if slot.restart_at.take().is_some() || slot.state == ServiceState::Pending {
                slot.state = ServiceState::Stopped;
            }
        }

        let names: Vec<String> = self.launch_order.iter().rev().cloned().collect();
        for name in names {
            let Some(slot) = self.registry.get_mut(&name) else {
                continue;
            };
            let Some(mut process) = slot.process.take() else {
                continue;
            };
            let code = process.stop(slot.def.stop_grace).await;
            log::info!("[{}] Stopped (exit code: {:?})", name, code);
            slot.last_exit_code = code;
            slot.state = ServiceState::Stopped;
            self.publish();
        }

        self.publish();
        self.registry.clear();
        self.launch_order.clear();
        log::info!("All services shut down");
    }

    /// Apply an exit of `instance` of `service`
    pub fn on_exit(&mut self, service: &str, instance: u64, code: Option<i32>) {
        let backoff = self.config.backoff;
        let stopping = self.stopping;
        let Some(slot) = self.registry.get_mut(service) else {
            return;
        };
        if slot.process.as_ref().map(|p| p.instance) != Some(instance) {
            return;
        }

        slot.process = None;
        slot.last_exit_code = code;

        if stopping {
            slot.state = ServiceState::Stopped;
            self.publish();
            return;
        }

        let mut terminal_failure = None;
        if slot.def.restart.should_restart(code) {
            slot.state = ServiceState::Failed;
            if slot.restart_count < slot.def.max_restarts {
                let delay = backoff.delay(slot.restart_count);
                log::warn!(
                    "[{}] Exited with code {:?}, restarting in {}ms ({}/{})",
                    service,
                    code,
                    delay.as_millis(),
                    slot.restart_count + 1,
                    slot.def.max_restarts
                );
                slot.restart_at = Some(Instant::now() + delay);
            } else {
                terminal_failure = Some(SupervisorError::RestartBudgetExhausted {
                    service: service.to_string(),
                    restarts: slot.restart_count,
                    last_exit: code,
                });
            }
        } else if code == Some(0) {
            log::info!("[{}] Exited cleanly", service);
            slot.state = ServiceState::Stopped;
        } else {
            slot.state = ServiceState::Failed;
            terminal_failure = Some(SupervisorError::Exited {
                service: service.to_string(),
                code,
            });
        }

        if let Some(error) = terminal_failure {
            self.record_failure(service, error);
        }
        if self
            .registry
            .get(service)
            .is_some_and(ServiceSlot::is_settled)
        {
            self.fail_dependents(service);
        }

        self.launch_eligible();
        self.publish();
    }

    /// Current status of every registered service
    pub fn status(&self) -> Vec<ServiceStatus> {
        self.registry.values().map(ServiceSlot::status).collect()
    }

    fn handle_notice(&mut self, notice: ProcessNotice) {
        let ProcessNotice {
            service,
            instance,
            event,
        } = notice;

        match event {
            ProcessEvent::Output { line, is_stderr } => {
                if is_stderr {
                    log::warn!("[{}] {}", service, line);
                } else {
                    log::info!("[{}] {}", service, line);
                }
            }
            ProcessEvent::Started { pid } => {
                log::info!("[{}] Process started with PID: {}", service, pid);
            }
            ProcessEvent::Ready => {
                let Some(slot) = self.registry.get_mut(&service) else {
                    return;
                };
                let current = slot.process.as_ref().map(|p| p.instance) == Some(instance);
                if current && slot.state == ServiceState::Starting {
                    log::info!("[{}] Ready ({})", service, slot.def.readiness.describe());
                    slot.state = ServiceState::Ready;
                    self.launch_eligible();
                    self.publish();
                }
            }
            ProcessEvent::Exited { code } => self.on_exit(&service, instance, code),
        }
    }

    fn on_timer(&mut self, now: Instant) {
        if self.stopping {
            return;
        }

        let due_restarts: Vec<String> = self
            .registry
            .iter()
            .filter(|(_, slot)| slot.restart_at.is_some_and(|at| at <= now))
            .map(|(name, _)| name.clone())
            .collect();

        for name in due_restarts {
            if let Some(slot) = self.registry.get_mut(&name) {
                slot.restart_at = None;
                slot.restart_count += 1;
            }
            self.launch(&name);
        }

        let timeout = self.config.dependency_timeout;
        let timed_out: Vec<String> = self
            .registry
            .iter()
            .filter(|(_, slot)| {
                slot.state == ServiceState::Pending
                    && slot.waiting_since.is_some_and(|since| since + timeout <= now)
            })
            .map(|(name, _)| name.clone())
            .collect();

        for name in timed_out {
            // may already have failed as a dependent of an earlier timeout
            if self.registry.get(&name).map(|s| s.state) != Some(ServiceState::Pending) {
                continue;
            }
            let waiting_on = self.unready_dependencies(&name);
            self.record_failure(
                &name,
                SupervisorError::DependencyTimeout {
                    service: name.clone(),
                    waiting_on,
                    timeout,
                },
            );
            self.fail_dependents(&name);
        }

        self.launch_eligible();
        self.publish();
    }

    /// Earliest restart or dependency deadline
    fn next_deadline(&self) -> Option<Instant> {
        let timeout = self.config.dependency_timeout;
        self.registry
            .values()
            .filter_map(|slot| {
                let wait = match slot.state {
                    ServiceState::Pending => slot.waiting_since.map(|since| since + timeout),
                    _ => None,
                };
                match (slot.restart_at, wait) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                }
            })
            .min()
    }

    /// Launch every Pending service whose dependencies are all Ready, in
    /// start order
    fn launch_eligible(&mut self) {
        if self.stopping {
            return;
        }

        let names: Vec<String> = self.registry.keys().cloned().collect();
        for name in names {
            let eligible = match self.registry.get(&name) {
                Some(slot) if slot.state == ServiceState::Pending => {
                    slot.def.depends_on.iter().all(|dep| {
                        self.registry.get(dep).map(|d| d.state) == Some(ServiceState::Ready)
                    })
                }
                _ => false,
            };
            if eligible {
                self.launch(&name);
            }
        }
    }

    fn launch(&mut self, name: &str) {
        let instance = self.next_instance;
        let events = self.event_tx.clone();
        let Some(slot) = self.registry.get_mut(name) else {
            return;
        };

        if let Err(e) = self.volumes.ensure_all(&slot.def.volumes) {
            self.record_failure(
                name,
                SupervisorError::Volume {
                    service: name.to_string(),
                    source: e,
                },
            );
            self.fail_dependents(name);
            return;
        }

        let spawned = ProcessConfig::for_service(&slot.def, &slot.config)
            .and_then(|config| RunningProcess::spawn(&config, instance, &slot.def.readiness, events));

        match spawned {
            Ok(process) => {
                self.next_instance += 1;
                slot.started_at = Some(process.started_at);
                slot.process = Some(process);
                slot.state = ServiceState::Starting;
                slot.waiting_since = None;
                slot.last_error = None;
                if !self.launch_order.iter().any(|n| n == name) {
                    self.launch_order.push(name.to_string());
                }
            }
            Err(e) => {
                self.record_failure(
                    name,
                    SupervisorError::Spawn {
                        service: name.to_string(),
                        source: e,
                    },
                );
                self.fail_dependents(name);
            }
        }
    }

    /// Fail every Pending service that (transitively) depends on `name`
    fn fail_dependents(&mut self, name: &str) {
        let dependents: Vec<String> = self
            .registry
            .iter()
            .filter(|(_, slot)| {
                slot.state == ServiceState::Pending && slot.def.depends_on.iter().any(|d| d == name)
            })
            .map(|(n, _)| n.clone())
            .collect();

        for dependent in dependents {
            self.record_failure(
                &dependent,
                SupervisorError::DependencyFailed {
                    service: dependent.clone(),
                    dependency: name.to_string(),
                },
            );
            self.fail_dependents(&dependent);
        }
    }

    fn unready_dependencies(&self, name: &str) -> Vec<String> {
        self.registry
            .get(name)
            .map(|slot| {
                slot.def
                    .depends_on
                    .iter()
                    .filter(|dep| {
                        self.registry.get(*dep).map(|d| d.state) != Some(ServiceState::Ready)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn record_failure(&mut self, name: &str, error: SupervisorError) {
        log::error!("{}", error);
        if let Some(slot) = self.registry.get_mut(name) {
            slot.state = ServiceState::Failed;
            slot.waiting_since = None;
            slot.last_error = Some(error.to_string());
        }
        self.failures.push(error);
    }

    fn publish(&self) {
        self.status_tx.send_replace(StatusSnapshot::new(self.status()));
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Failures scoped to a single service
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Service '{service}' gave up waiting {}ms for: {}", timeout.as_millis(), waiting_on.join(", "))]
    DependencyTimeout {
        service: String,
        waiting_on: Vec<String>,
        timeout: Duration,
    },

    #[error("Dependency '{dependency}' failed before service '{service}' could start")]
    DependencyFailed { service: String, dependency: String },

    #[error("Service '{service}' exhausted its restart budget after {restarts} restarts (last exit code: {last_exit:?})")]
    RestartBudgetExhausted {
        service: String,
        restarts: u32,
        last_exit: Option<i32>,
    },

    #[error("Service '{service}' exited with code {code:?}")]
    Exited { service: String, code: Option<i32> },

    #[error("Service '{service}': {source}")]
    Volume {
        service: String,
        #[source]
        source: VolumeError,
    },

    #[error("Service '{service}': {source}")]
    Spawn {
        service: String,
        #[source]
        source: ProcessError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ReadinessProbe;
    use crate::service::RestartPolicy;

    fn prepared(def: ServiceDefinition) -> PreparedService {
        PreparedService {
            definition: Arc::new(def),
            config: ResolvedConfig::default(),
        }
    }

    fn quick() -> SupervisorConfig {
        SupervisorConfig {
            dependency_timeout: Duration::from_secs(5),
            backoff: Backoff::new(Duration::from_millis(10), Duration::from_millis(40)),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stale_exit_is_ignored() {
        let mut supervisor = Supervisor::new(quick());
        let status_rx = supervisor.subscribe();
        supervisor.start(vec![prepared(
            ServiceDefinition::shell("redis", "sleep 5")
                .with_readiness(ReadinessProbe::Grace(Duration::ZERO)),
        )]);

        supervisor.on_exit("redis", 999, Some(1));
        assert_eq!(supervisor.status()[0].state, ServiceState::Starting);

        supervisor.stop().await;
        assert!(supervisor.status().is_empty());
        assert_eq!(
            status_rx.borrow().service("redis").map(|s| s.state),
            Some(ServiceState::Stopped)
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dependent_waits_for_ready() {
        let mut supervisor = Supervisor::new(quick());
        supervisor.start(vec![
            prepared(
                ServiceDefinition::shell("postgres", "sleep 5")
                    .with_readiness(ReadinessProbe::Grace(Duration::from_secs(60))),
            ),
            prepared(ServiceDefinition::shell("django", "sleep 5").depends_on(["postgres"])),
        ]);

        let states: Vec<_> = supervisor.status().iter().map(|s| s.state).collect();
        assert_eq!(states, vec![ServiceState::Starting, ServiceState::Pending]);

        let status_rx = supervisor.subscribe();
        supervisor.stop().await;
        let states: Vec<_> = status_rx.borrow().services.iter().map(|s| s.state).collect();
        assert_eq!(states, vec![ServiceState::Stopped, ServiceState::Stopped]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_clean_exit_without_restart_is_stopped() {
        let mut supervisor = Supervisor::new(quick());
        supervisor.start(vec![prepared(
            ServiceDefinition::shell("migrate", "exit 0")
                .with_restart(RestartPolicy::OnFailure, 3)
                .with_readiness(ReadinessProbe::Grace(Duration::ZERO)),
        )]);

        let (_tx, rx) = watch::channel(false);
        let report = supervisor.run(rx).await;
        assert!(report.is_success());
        let migrate = report.service("migrate").unwrap();
        assert_eq!(migrate.state, ServiceState::Stopped);
        assert_eq!(migrate.restart_count, 0);
        assert_eq!(migrate.last_exit_code, Some(0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_crash_without_restart_policy_is_reported() {
        let mut supervisor = Supervisor::new(quick());
        supervisor.start(vec![prepared(
            ServiceDefinition::shell("celerybeat", "exit 2")
                .with_readiness(ReadinessProbe::Grace(Duration::ZERO)),
        )]);

        let (_tx, rx) = watch::channel(false);
        let report = supervisor.run(rx).await;
        assert!(matches!(
            report.failures.as_slice(),
            [SupervisorError::Exited { code: Some(2), .. }]
        ));
        assert_eq!(report.service("celerybeat").unwrap().state, ServiceState::Failed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_failure_fails_dependents_only() {
        let mut supervisor = Supervisor::new(quick());
        supervisor.start(vec![
            prepared(ServiceDefinition::new(
                "postgres",
                vec!["/nonexistent/stackvisor-postgres".into()],
            )),
            prepared(ServiceDefinition::shell("django", "sleep 5").depends_on(["postgres"])),
            prepared(
                ServiceDefinition::shell("redis", "exit 0")
                    .with_readiness(ReadinessProbe::Grace(Duration::ZERO)),
            ),
        ]);

        let (_tx, rx) = watch::channel(false);
        let report = supervisor.run(rx).await;

        assert!(matches!(report.failures[0], SupervisorError::Spawn { .. }));
        assert!(matches!(
            report.failures[1],
            SupervisorError::DependencyFailed { ref dependency, .. } if dependency == "postgres"
        ));
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.service("redis").unwrap().state, ServiceState::Stopped);
    }

    #[test]
    fn test_report_flags_dependency_timeout() {
        let report = SupervisorReport {
            failures: vec![SupervisorError::DependencyTimeout {
                service: "django".into(),
                waiting_on: vec!["postgres".into()],
                timeout: Duration::from_secs(30),
            }],
            services: Vec::new(),
        };
        assert!(report.has_dependency_timeout());
        assert!(!report.is_success());
        assert_eq!(report.exit_code(), 4);
        assert_eq!(
            report.failures[0].to_string(),
            "Service 'django' gave up waiting 30000ms for: postgres"
        );
    }
}
