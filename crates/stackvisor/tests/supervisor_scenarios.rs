//! End-to-end supervisor scenarios with real child processes.
//!
//! Each test writes a manifest into a temp dir, builds a launch plan from it
//! and runs the supervisor until the scenario has played out.
#![cfg(unix)]

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use stackvisor::cli::{self, UpArgs};
use stackvisor::runtime::{ServiceStatus, SupervisorReport};
use stackvisor::{
    GraphError, LaunchPlan, Manifest, ManifestPaths, PlanError, ServiceState, StatusSnapshot,
    Supervisor, SupervisorConfig, SupervisorError,
};
use tokio::sync::watch;

// ── Harness ──────────────────────────────────────────────────────────

fn plan(dir: &Path, yaml: &str) -> Result<LaunchPlan, PlanError> {
    let path = dir.join("stack.yaml");
    std::fs::write(&path, yaml).unwrap();
    let manifest = Manifest::from_file(&path)?;
    LaunchPlan::from_manifest(
        &manifest,
        &HashMap::new(),
        &ManifestPaths {
            base_dir: dir.to_path_buf(),
            state_dir: dir.join(".stackvisor"),
        },
    )
}

/// Run the plan, requesting shutdown once `stop_when` holds for a snapshot.
/// The run also ends by itself once every service has settled.
async fn run_until<F>(plan: LaunchPlan, stop_when: F) -> SupervisorReport
where
    F: Fn(&StatusSnapshot) -> bool + Send + Sync + 'static,
{
    let mut supervisor = Supervisor::new(SupervisorConfig::from(&plan.settings));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut status_rx = supervisor.subscribe();

    let watcher = tokio::spawn(async move {
        let reached = status_rx
            .wait_for(|s| !s.services.is_empty() && stop_when(s))
            .await
            .is_ok();
        if reached {
            let _ = shutdown_tx.send(true);
        }
    });

    supervisor.start(plan.services);
    let report = tokio::time::timeout(Duration::from_secs(20), supervisor.run(shutdown_rx))
        .await
        .expect("supervisor did not finish");
    watcher.abort();
    report
}

fn state(snapshot: &StatusSnapshot, name: &str) -> Option<ServiceState> {
    snapshot.service(name).map(|s| s.state)
}

fn lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

fn status<'a>(report: &'a SupervisorReport, name: &str) -> &'a ServiceStatus {
    report.service(name).unwrap()
}

// ── Ordering ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_chain_starts_in_order_and_stops_in_reverse() {
    let dir = tempfile::tempdir().unwrap();
    let service = |name: &str| {
        format!(
            r#"
  {name}:
    command: ["sh", "-c", "trap 'echo {name} >> stopped.txt; exit 0' TERM; echo {name} >> started.txt; while true; do sleep 0.05; done"]
    working_dir: "."
    ready:
      grace_ms: 100"#
        )
    };
    let yaml = format!(
        "services:{}\n    depends_on: [a, b]{}\n    depends_on: [a]{}\n",
        service("c"),
        service("b"),
        service("a"),
    );

    let plan = plan(dir.path(), &yaml).unwrap();
    assert_eq!(plan.order(), vec!["a", "b", "c"]);

    let report = run_until(plan, |s| {
        s.services.iter().all(|svc| svc.state == ServiceState::Ready)
    })
    .await;

    assert!(report.is_success(), "{:?}", report.failures);
    assert_eq!(lines(&dir.path().join("started.txt")), vec!["a", "b", "c"]);
    assert_eq!(lines(&dir.path().join("stopped.txt")), vec!["c", "b", "a"]);
    for name in ["a", "b", "c"] {
        assert_eq!(status(&report, name).state, ServiceState::Stopped);
    }
}

// ── Restarts ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_restart_budget_is_exhausted() {
    let dir = tempfile::tempdir().unwrap();
    let plan = plan(
        dir.path(),
        r#"
settings:
  backoff_initial_ms: 20
  backoff_max_ms: 80
services:
  celeryworker:
    command: "echo launch >> launches.txt; exit 1"
    working_dir: "."
    restart: on-failure
    max_restarts: 3
    ready:
      grace_ms: 0
"#,
    )
    .unwrap();

    let started = std::time::Instant::now();
    let report = run_until(plan, |_| false).await;
    let elapsed = started.elapsed();

    assert_eq!(lines(&dir.path().join("launches.txt")).len(), 4);
    let worker = status(&report, "celeryworker");
    assert_eq!(worker.state, ServiceState::Failed);
    assert_eq!(worker.restart_count, 3);
    assert_eq!(worker.last_exit_code, Some(1));
    assert!(matches!(
        report.failures.as_slice(),
        [SupervisorError::RestartBudgetExhausted { restarts: 3, last_exit: Some(1), .. }]
    ));
    assert_eq!(report.exit_code(), 1);
    // 20 + 40 + 80
    assert!(elapsed >= Duration::from_millis(140), "{:?}", elapsed);
}

#[tokio::test]
async fn test_always_restarts_clean_exits() {
    let dir = tempfile::tempdir().unwrap();
    let plan = plan(
        dir.path(),
        r#"
settings:
  backoff_initial_ms: 10
services:
  celerybeat:
    command: "echo launch >> launches.txt; exit 0"
    working_dir: "."
    restart: always
    max_restarts: 2
"#,
    )
    .unwrap();

    let report = run_until(plan, |_| false).await;

    assert_eq!(lines(&dir.path().join("launches.txt")).len(), 3);
    assert_eq!(status(&report, "celerybeat").restart_count, 2);
    assert!(matches!(
        report.failures.as_slice(),
        [SupervisorError::RestartBudgetExhausted { last_exit: Some(0), .. }]
    ));
}

#[tokio::test]
async fn test_shutdown_during_backoff_cancels_restart() {
    let dir = tempfile::tempdir().unwrap();
    let plan = plan(
        dir.path(),
        r#"
settings:
  backoff_initial_ms: 5000
services:
  flower:
    command: "echo launch >> launches.txt; exit 1"
    working_dir: "."
    restart: on-failure
"#,
    )
    .unwrap();

    let started = std::time::Instant::now();
    let report = run_until(plan, |s| {
        s.service("flower").and_then(|f| f.last_exit_code) == Some(1)
    })
    .await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(lines(&dir.path().join("launches.txt")).len(), 1);
    let flower = status(&report, "flower");
    assert_eq!(flower.state, ServiceState::Stopped);
    assert_eq!(flower.restart_count, 0);
    assert!(report.is_success());
}

// ── Dependency failures ──────────────────────────────────────────────

#[tokio::test]
async fn test_dependency_timeout_leaves_siblings_running() {
    let dir = tempfile::tempdir().unwrap();
    let plan = plan(
        dir.path(),
        r#"
settings:
  dependency_timeout_ms: 300
services:
  postgres:
    command: ["sleep", "30"]
    ready:
      tcp: "127.0.0.1:1"
      interval_ms: 50
  redis:
    command: ["sleep", "30"]
    ready:
      grace_ms: 50
  django:
    command: ["sleep", "30"]
    depends_on: [postgres]
  celeryworker:
    command: ["sleep", "30"]
    depends_on: [django]
"#,
    )
    .unwrap();

    let report = run_until(plan, |s| {
        state(s, "django") == Some(ServiceState::Failed)
            && state(s, "redis") == Some(ServiceState::Ready)
    })
    .await;

    assert!(matches!(
        &report.failures[0],
        SupervisorError::DependencyTimeout { service, waiting_on, .. }
            if service == "django" && waiting_on == &vec!["postgres".to_string()]
    ));
    assert!(matches!(
        &report.failures[1],
        SupervisorError::DependencyFailed { service, dependency }
            if service == "celeryworker" && dependency == "django"
    ));
    assert_eq!(report.exit_code(), 4);
    assert_eq!(status(&report, "django").pid, None);
    assert_eq!(status(&report, "redis").state, ServiceState::Stopped);
}

#[tokio::test]
async fn test_cycle_launches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = r#"
services:
  a:
    command: "echo a >> launches.txt"
    working_dir: "."
    depends_on: [b]
  b:
    command: "echo b >> launches.txt"
    working_dir: "."
    depends_on: [a]
"#;

    let err = plan(dir.path(), yaml).unwrap_err();
    match &err {
        PlanError::Graph(GraphError::Cycle(cycle)) => {
            assert_eq!(cycle.participants, vec!["a", "b"]);
        }
        other => panic!("expected a cycle, got {:?}", other),
    }

    let code = cli::up(UpArgs {
        manifest: dir.path().join("stack.yaml").display().to_string(),
        arg: Vec::new(),
        dry_run: false,
        state_dir: None,
    })
    .await
    .unwrap();

    assert_eq!(code, 3);
    assert!(!dir.path().join("launches.txt").exists());
    assert!(!dir.path().join(".stackvisor").exists());
}

#[tokio::test]
async fn test_volume_failure_is_scoped_to_its_service() {
    let dir = tempfile::tempdir().unwrap();
    let plan = plan(
        dir.path(),
        r#"
volumes:
  postgres_data: {}
services:
  postgres:
    command: "exit 0"
    volumes:
      - ./missing_backups:/backups:ro
  django:
    command: "exit 0"
    depends_on: [postgres]
  redis:
    command: "exit 0"
    volumes:
      - postgres_data:/data
    ready:
      grace_ms: 0
"#,
    )
    .unwrap();

    let report = run_until(plan, |_| false).await;

    assert!(matches!(report.failures[0], SupervisorError::Volume { .. }));
    assert!(matches!(
        &report.failures[1],
        SupervisorError::DependencyFailed { dependency, .. } if dependency == "postgres"
    ));
    assert_eq!(report.failures.len(), 2);
    assert_eq!(status(&report, "redis").state, ServiceState::Stopped);
    assert!(dir.path().join(".stackvisor/volumes/postgres_data").is_dir());
}

// ── Configuration ────────────────────────────────────────────────────

#[tokio::test]
async fn test_env_layers_reach_the_process() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join(".envs")).unwrap();
    std::fs::write(
        dir.path().join(".envs/django"),
        "GREETING=hello\nTARGET=file\n",
    )
    .unwrap();

    let plan = plan(
        dir.path(),
        r#"
env:
  STAGE: production
services:
  django:
    command: ["sh", "-c", "echo \"$STAGE $GREETING $TARGET\" > out.txt"]
    working_dir: "."
    env_file: ./.envs/django
    environment:
      TARGET: world
    ready:
      grace_ms: 0
"#,
    )
    .unwrap();

    let report = run_until(plan, |_| false).await;

    assert!(report.is_success(), "{:?}", report.failures);
    assert_eq!(
        lines(&dir.path().join("out.txt")),
        vec!["production hello world"]
    );
}

#[tokio::test]
async fn test_shell_sees_escaped_command_substitution() {
    let dir = tempfile::tempdir().unwrap();
    let plan = plan(
        dir.path(),
        r#"
services:
  django:
    command: "echo workers=$$(echo 4) > out.txt"
    working_dir: "."
    ready:
      grace_ms: 0
"#,
    )
    .unwrap();

    let report = run_until(plan, |_| false).await;

    assert!(report.is_success(), "{:?}", report.failures);
    assert_eq!(lines(&dir.path().join("out.txt")), vec!["workers=4"]);
}
