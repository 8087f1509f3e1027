//! Command-line interface: `up`, `down` and `status`

use crate::config::{Manifest, ManifestPaths};
use crate::runtime::{
    process_alive, LaunchPlan, StateStore, StatusSnapshot, Supervisor, SupervisorConfig,
};
use anyhow::Context;
use argh::FromArgs;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;

/// Default state directory, relative to the manifest
pub const STATE_DIR_NAME: &str = ".stackvisor";

/// Supervise a local stack of cooperating services
#[derive(FromArgs, Debug)]
pub struct StackvisorArgs {
    /// log level (error, warn, info, debug, trace)
    #[argh(option, short = 'l', default = "String::from(\"info\")")]
    pub log_level: String,

    #[argh(subcommand)]
    pub command: Command,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
pub enum Command {
    Up(UpArgs),
    Down(DownArgs),
    Status(StatusArgs),
}

/// Bring the stack up and supervise it until interrupted
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "up")]
pub struct UpArgs {
    /// path to the manifest (default: stack.yaml)
    #[argh(positional, default = "String::from(\"stack.yaml\")")]
    pub manifest: String,

    /// override manifest arguments (format: key:=value)
    #[argh(option, short = 'a', from_str_fn(parse_arg_override))]
    pub arg: Vec<(String, String)>,

    /// show the launch plan without starting anything
    #[argh(switch)]
    pub dry_run: bool,

    /// state directory (default: .stackvisor next to the manifest)
    #[argh(option)]
    pub state_dir: Option<PathBuf>,
}

/// Ask a running supervisor to stop the stack
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "down")]
pub struct DownArgs {
    /// path to the manifest (default: stack.yaml)
    #[argh(positional, default = "String::from(\"stack.yaml\")")]
    pub manifest: String,

    /// state directory (default: .stackvisor next to the manifest)
    #[argh(option)]
    pub state_dir: Option<PathBuf>,

    /// seconds to wait for the supervisor to exit (default: 60)
    #[argh(option, default = "60")]
    pub timeout_secs: u64,
}

/// Show the last recorded status of every service
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "status")]
pub struct StatusArgs {
    /// path to the manifest (default: stack.yaml)
    #[argh(positional, default = "String::from(\"stack.yaml\")")]
    pub manifest: String,

    /// state directory (default: .stackvisor next to the manifest)
    #[argh(option)]
    pub state_dir: Option<PathBuf>,

    /// output format: table, json (default: table)
    #[argh(option, short = 'f', default = "String::from(\"table\")")]
    pub format: String,
}

/// Parse argument override in format "key:=value"
fn parse_arg_override(s: &str) -> Result<(String, String), String> {
    let parts: Vec<&str> = s.splitn(2, ":=").collect();
    if parts.len() != 2 || parts[0].is_empty() {
        return Err(format!(
            "Invalid argument format '{}'. Expected 'key:=value'",
            s
        ));
    }
    Ok((parts[0].to_string(), parts[1].to_string()))
}

impl UpArgs {
    /// Convert argument overrides to a HashMap
    pub fn arg_overrides(&self) -> HashMap<String, String> {
        self.arg.iter().cloned().collect()
    }

    /// Manifest directory and state directory
    pub fn paths(&self) -> ManifestPaths {
        manifest_paths(&self.manifest, &self.state_dir)
    }
}

impl DownArgs {
    pub fn paths(&self) -> ManifestPaths {
        manifest_paths(&self.manifest, &self.state_dir)
    }
}

impl StatusArgs {
    pub fn paths(&self) -> ManifestPaths {
        manifest_paths(&self.manifest, &self.state_dir)
    }
}

/// Every subcommand finds the state directory next to the manifest unless told otherwise
fn manifest_paths(manifest: &str, state_dir: &Option<PathBuf>) -> ManifestPaths {
    let base_dir = match Path::new(manifest).parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let state_dir = state_dir
        .clone()
        .unwrap_or_else(|| base_dir.join(STATE_DIR_NAME));
    ManifestPaths {
        base_dir,
        state_dir,
    }
}

/// Run `up`, returning the process exit code
pub async fn up(args: UpArgs) -> anyhow::Result<u8> {
    log::info!("Loading manifest: {}", args.manifest);
    let manifest = match Manifest::from_file(&args.manifest) {
        Ok(manifest) => manifest,
        Err(e) => {
            log::error!("Failed to load manifest: {}", e);
            return Ok(2);
        }
    };

    let images = manifest.images();
    if !images.is_empty() {
        log::debug!("Images: {}", images.join(", "));
    }

    let paths = args.paths();
    let plan = match LaunchPlan::from_manifest(&manifest, &args.arg_overrides(), &paths) {
        Ok(plan) => plan,
        Err(e) => {
            log::error!("{}", e);
            return Ok(e.exit_code());
        }
    };

    if args.dry_run {
        println!("{}", plan);
        return Ok(0);
    }

    let store = StateStore::new(&paths.state_dir);
    // held until `up` returns, on every path
    let _lock = store.claim()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        log::info!("Received termination signal, initiating shutdown...");
        let _ = shutdown_tx.send(true);
    })
    .context("Error setting signal handler")?;

    let mut supervisor = Supervisor::new(SupervisorConfig::from(&plan.settings));
    let writer = {
        let store = store.clone();
        let mut status_rx = supervisor.subscribe();
        tokio::spawn(async move {
            while status_rx.changed().await.is_ok() {
                let snapshot = status_rx.borrow_and_update().clone();
                if let Err(e) = store.write_status(&snapshot) {
                    log::warn!("Failed to record status: {}", e);
                }
            }
        })
    };

    log::info!("Bringing up stack: {}", plan.order().join(" -> "));
    supervisor.start(plan.services);
    let report = supervisor.run(shutdown_rx).await;
    writer.abort();

    store.write_status(&StatusSnapshot::new(report.services.clone()))?;

    for failure in &report.failures {
        log::error!("{}", failure);
    }
    log::info!("Stackvisor exiting");
    Ok(report.exit_code())
}

/// Run `down`, returning the process exit code
pub async fn down(args: DownArgs) -> anyhow::Result<u8> {
    let store = StateStore::new(args.paths().state_dir);
    let Some(pid) = store.running_supervisor() else {
        println!("No supervisor running in {}", store.dir().display());
        return Ok(0);
    };

    println!("Stopping supervisor (pid {})...", pid);
    terminate(pid)?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.timeout_secs);
    while process_alive(pid) {
        if tokio::time::Instant::now() >= deadline {
            log::error!(
                "Supervisor {} still running after {}s",
                pid,
                args.timeout_secs
            );
            return Ok(1);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    println!("Stack is down");
    Ok(0)
}

#[cfg(unix)]
fn terminate(pid: u32) -> anyhow::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
        .with_context(|| format!("Failed to signal supervisor {}", pid))
}

#[cfg(not(unix))]
fn terminate(pid: u32) -> anyhow::Result<()> {
    anyhow::bail!("Stopping supervisor {} is only supported on unix", pid)
}

/// Run `status`, returning the process exit code
pub fn status(args: StatusArgs) -> anyhow::Result<u8> {
    let store = StateStore::new(args.paths().state_dir);
    let running = store.running_supervisor();
    let snapshot = store.read_status()?;

    match args.format.as_str() {
        "json" => {
            let value = serde_json::json!({
                "running": running.is_some(),
                "supervisor_pid": running,
                "snapshot": snapshot,
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        _ => {
            match (running, &snapshot) {
                (Some(pid), Some(snapshot)) => {
                    let up = snapshot.services.iter().filter(|s| s.state.is_running());
                    println!(
                        "Supervisor: running (pid {}), {}/{} services up",
                        pid,
                        up.count(),
                        snapshot.services.len()
                    );
                }
                (Some(pid), None) => println!("Supervisor: running (pid {})", pid),
                (None, _) => println!("Supervisor: not running"),
            }
            match snapshot {
                Some(snapshot) => {
                    println!(
                        "Last update: {}\n",
                        snapshot.updated_at.format("%Y-%m-%d %H:%M:%S")
                    );
                    print!("{}", snapshot);
                }
                None => println!("No status recorded in {}", store.dir().display()),
            }
        }
    }

    Ok(0)
}
