//! Launched service instances

use crate::config::ResolvedConfig;
use crate::runtime::readiness::ReadinessProbe;
use crate::service::ServiceDefinition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Lifecycle state of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// Registered, waiting for dependencies
    Pending,
    /// Process launched, readiness not yet confirmed
    Starting,
    /// Process passed its readiness probe
    Ready,
    /// Exited unexpectedly or could not be started
    Failed,
    /// Shut down, or exited cleanly with no restart due
    Stopped,
}

impl ServiceState {
    /// A process exists for this state
    pub fn is_running(&self) -> bool {
        matches!(self, ServiceState::Starting | ServiceState::Ready)
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceState::Pending => "pending",
            ServiceState::Starting => "starting",
            ServiceState::Ready => "ready",
            ServiceState::Failed => "failed",
            ServiceState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Everything needed to spawn one instance
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub name: String,
    pub executable: String,
    pub args: Vec<String>,
    /// Added on top of the supervisor's own environment
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl ProcessConfig {
    pub fn for_service(
        service: &ServiceDefinition,
        config: &ResolvedConfig,
    ) -> Result<Self, ProcessError> {
        let (executable, args) = service
            .command
            .split_first()
            .ok_or_else(|| ProcessError::EmptyCommand(service.name.clone()))?;

        Ok(Self {
            name: service.name.clone(),
            executable: executable.clone(),
            args: args.to_vec(),
            env: config
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            working_dir: service.working_dir.clone(),
        })
    }
}

/// Something that happened to a process instance
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    Started { pid: u32 },
    Output { line: String, is_stderr: bool },
    /// Readiness probe passed
    Ready,
    /// `None` when terminated by a signal
    Exited { code: Option<i32> },
}

/// An event tagged with the instance it belongs to
#[derive(Debug, Clone)]
pub struct ProcessNotice {
    pub service: String,
    /// Distinguishes restarts of the same service
    pub instance: u64,
    pub event: ProcessEvent,
}

pub type EventSender = mpsc::UnboundedSender<ProcessNotice>;

#[derive(Debug, Clone, Copy)]
enum StopSignal {
    Terminate,
    Kill,
}

/// Handle to a launched instance.
///
/// The child is owned by a monitor task which reports its exit as an event;
/// dropping the handle kills the child.
pub struct RunningProcess {
    pub name: String,
    pub instance: u64,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    control_tx: mpsc::UnboundedSender<StopSignal>,
    exit_rx: watch::Receiver<Option<Option<i32>>>,
    readiness_task: JoinHandle<()>,
}

impl RunningProcess {
    /// Spawn the process together with its monitor, output and readiness tasks
    pub fn spawn(
        config: &ProcessConfig,
        instance: u64,
        readiness: &ReadinessProbe,
        events: EventSender,
    ) -> Result<Self, ProcessError> {
        log::info!(
            "[{}] Starting: {} {}",
            config.name,
            config.executable,
            config.args.join(" ")
        );

        let mut cmd = Command::new(&config.executable);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }

        // own process group: a terminal Ctrl+C reaches only the supervisor,
        // which then stops services in order
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| ProcessError::SpawnFailed {
            name: config.name.clone(),
            source: e,
        })?;

        let pid = child.id();
        let notify = Notifier {
            service: config.name.clone(),
            instance,
            tx: events,
        };
        notify.send(ProcessEvent::Started {
            pid: pid.unwrap_or(0),
        });

        if let Some(stdout) = child.stdout.take() {
            let notify = notify.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    notify.send(ProcessEvent::Output {
                        line,
                        is_stderr: false,
                    });
                }
            });
        }

        if let Some(stderr) = child.stderr.take() {
            let notify = notify.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    notify.send(ProcessEvent::Output {
                        line,
                        is_stderr: true,
                    });
                }
            });
        }

        let readiness_task = {
            let notify = notify.clone();
            let probe = readiness.clone();
            let env = config.env.clone();
            tokio::spawn(async move {
                probe.wait_ready(&notify.service, &env).await;
                notify.send(ProcessEvent::Ready);
            })
        };

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(monitor(child, control_rx, exit_tx, notify));

        Ok(Self {
            name: config.name.clone(),
            instance,
            pid,
            started_at: Utc::now(),
            control_tx,
            exit_rx,
            readiness_task,
        })
    }

    /// Exit code once the process is gone; `Some(None)` for a signal death
    pub fn exit_status(&self) -> Option<Option<i32>> {
        *self.exit_rx.borrow()
    }

    /// SIGTERM, then SIGKILL if the process outlives `grace`
    pub async fn stop(&mut self, grace: Duration) -> Option<i32> {
        self.readiness_task.abort();

        if let Some(code) = self.exit_status() {
            return code;
        }

        log::info!("[{}] Stopping process...", self.name);
        let _ = self.control_tx.send(StopSignal::Terminate);

        match tokio::time::timeout(grace, self.wait_exit()).await {
            Ok(code) => code,
            Err(_) => {
                log::warn!(
                    "[{}] Process did not exit within {}ms, forcing kill",
                    self.name,
                    grace.as_millis()
                );
                let _ = self.control_tx.send(StopSignal::Kill);
                self.wait_exit().await
            }
        }
    }

    async fn wait_exit(&mut self) -> Option<i32> {
        match self.exit_rx.wait_for(|status| status.is_some()).await {
            Ok(status) => (*status).flatten(),
            Err(_) => None,
        }
    }
}

impl Drop for RunningProcess {
    fn drop(&mut self) {
        self.readiness_task.abort();
    }
}

#[derive(Clone)]
struct Notifier {
    service: String,
    instance: u64,
    tx: EventSender,
}

impl Notifier {
    fn send(&self, event: ProcessEvent) {
        let _ = self.tx.send(ProcessNotice {
            service: self.service.clone(),
            instance: self.instance,
            event,
        });
    }
}

async fn monitor(
    mut child: Child,
    mut control_rx: mpsc::UnboundedReceiver<StopSignal>,
    exit_tx: watch::Sender<Option<Option<i32>>>,
    notify: Notifier,
) {
    let mut control_open = true;

    let code = loop {
        tokio::select! {
            status = child.wait() => {
                break match status {
                    Ok(status) => exit_code(&notify.service, status),
                    Err(e) => {
                        log::error!("[{}] Error waiting for process: {}", notify.service, e);
                        None
                    }
                };
            }
            signal = control_rx.recv(), if control_open => match signal {
                Some(StopSignal::Terminate) => terminate(&mut child),
                Some(StopSignal::Kill) => kill(&mut child),
                None => {
                    // handle dropped
                    control_open = false;
                    let _ = child.start_kill();
                }
            },
        }
    };

    exit_tx.send_replace(Some(code));
    notify.send(ProcessEvent::Exited { code });
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    signal_group(child, nix::sys::signal::Signal::SIGTERM);
}

#[cfg(unix)]
fn kill(child: &mut Child) {
    signal_group(child, nix::sys::signal::Signal::SIGKILL);
}

/// Signal the child's whole process group, so `sh -c` pipelines stop too
#[cfg(unix)]
fn signal_group(child: &mut Child, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    match child.id() {
        Some(pid) => {
            let _ = killpg(Pid::from_raw(pid as i32), signal);
        }
        None => {
            let _ = child.start_kill();
        }
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(not(unix))]
fn kill(child: &mut Child) {
    let _ = child.start_kill();
}

fn exit_code(service: &str, status: ExitStatus) -> Option<i32> {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            log::debug!("[{}] Terminated by signal {}", service, signal);
        }
    }
    #[cfg(not(unix))]
    let _ = service;

    status.code()
}

/// Errors raised when launching a process
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Service '{0}' has an empty command")]
    EmptyCommand(String),

    #[error("Failed to spawn process '{name}': {source}")]
    SpawnFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell(name: &str, script: &str) -> ProcessConfig {
        ProcessConfig {
            name: name.to_string(),
            executable: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: HashMap::new(),
            working_dir: None,
        }
    }

    async fn next_exit(rx: &mut mpsc::UnboundedReceiver<ProcessNotice>) -> Option<i32> {
        loop {
            let notice = rx.recv().await.expect("event channel open");
            if let ProcessEvent::Exited { code } = notice.event {
                return code;
            }
        }
    }

    #[tokio::test]
    async fn test_exit_is_reported_as_event() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let process = RunningProcess::spawn(
            &shell("worker", "exit 3"),
            7,
            &ReadinessProbe::Grace(Duration::from_secs(60)),
            tx,
        )
        .unwrap();

        assert_eq!(next_exit(&mut rx).await, Some(3));
        assert_eq!(process.exit_status(), Some(Some(3)));
    }

    #[tokio::test]
    async fn test_output_and_env_are_forwarded() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut config = shell("web", "echo \"port=$PORT\"; echo oops >&2");
        config.env.insert("PORT".into(), "8000".into());
        let _process =
            RunningProcess::spawn(&config, 1, &ReadinessProbe::Grace(Duration::ZERO), tx).unwrap();

        let mut lines = Vec::new();
        loop {
            let notice = rx.recv().await.unwrap();
            assert_eq!(notice.instance, 1);
            match notice.event {
                ProcessEvent::Output { line, is_stderr } => lines.push((line, is_stderr)),
                ProcessEvent::Exited { .. } => break,
                _ => {}
            }
        }
        // readers may still be draining after exit; give them a moment
        while let Ok(Some(notice)) =
            tokio::time::timeout(Duration::from_millis(200), rx.recv()).await
        {
            if let ProcessEvent::Output { line, is_stderr } = notice.event {
                lines.push((line, is_stderr));
            }
        }
        assert!(lines.contains(&("port=8000".to_string(), false)));
        assert!(lines.contains(&("oops".to_string(), true)));
    }

    #[tokio::test]
    async fn test_child_has_its_own_process_group() {
        use nix::unistd::{getpgid, Pid};

        let (tx, _rx) = mpsc::unbounded_channel();
        let mut process = RunningProcess::spawn(
            &shell("postgres", "sleep 2"),
            1,
            &ReadinessProbe::Grace(Duration::ZERO),
            tx,
        )
        .unwrap();

        let pid = Pid::from_raw(process.pid.unwrap() as i32);
        let child_group = getpgid(Some(pid)).unwrap();
        assert_eq!(child_group, pid);
        assert_ne!(child_group, getpgid(None).unwrap());

        process.stop(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_stop_terminates_gracefully() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut process = RunningProcess::spawn(
            &shell("db", "trap 'exit 0' TERM; while true; do sleep 0.05; done"),
            1,
            &ReadinessProbe::Grace(Duration::ZERO),
            tx,
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let code = process.stop(Duration::from_secs(5)).await;
        assert_eq!(code, Some(0));
    }

    #[tokio::test]
    async fn test_stop_kills_after_grace() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut process = RunningProcess::spawn(
            &shell("stubborn", "trap '' TERM; while true; do sleep 0.05; done"),
            1,
            &ReadinessProbe::Grace(Duration::ZERO),
            tx,
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let code = process.stop(Duration::from_millis(200)).await;
        assert_eq!(code, None);
        assert!(process.exit_status().is_some());
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = ProcessConfig {
            name: "ghost".into(),
            executable: "/nonexistent/stackvisor-test-binary".into(),
            args: vec![],
            env: HashMap::new(),
            working_dir: None,
        };
        let result = RunningProcess::spawn(&config, 1, &ReadinessProbe::default(), tx);
        assert!(matches!(result, Err(ProcessError::SpawnFailed { .. })));
    }
}
