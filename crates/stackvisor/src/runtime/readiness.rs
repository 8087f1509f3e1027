//! Readiness probes deciding when a started service may be depended on

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;

/// How a `Starting` service proves it is `Ready`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessProbe {
    /// Ready once the process has stayed alive for this long
    Grace(Duration),
    /// Ready once the command exits with status 0
    Command {
        command: Vec<String>,
        interval: Duration,
    },
    /// Ready once a TCP connection to `address` succeeds
    Tcp { address: String, interval: Duration },
}

impl Default for ReadinessProbe {
    fn default() -> Self {
        ReadinessProbe::Grace(Duration::from_millis(crate::config::DEFAULT_READY_GRACE_MS))
    }
}

impl ReadinessProbe {
    /// Resolve once the probe passes. Never resolves if it never passes;
    /// the caller owns cancellation.
    pub async fn wait_ready(&self, service: &str, env: &HashMap<String, String>) {
        match self {
            ReadinessProbe::Grace(grace) => tokio::time::sleep(*grace).await,
            ReadinessProbe::Command { command, interval } => {
                while !run_check(service, command, env).await {
                    tokio::time::sleep(*interval).await;
                }
            }
            ReadinessProbe::Tcp { address, interval } => loop {
                match TcpStream::connect(address.as_str()).await {
                    Ok(_) => break,
                    Err(e) => {
                        log::trace!("[{}] {} not accepting yet: {}", service, address, e);
                        tokio::time::sleep(*interval).await;
                    }
                }
            },
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ReadinessProbe::Grace(grace) => format!("alive for {}ms", grace.as_millis()),
            ReadinessProbe::Command { command, .. } => format!("`{}` succeeds", command.join(" ")),
            ReadinessProbe::Tcp { address, .. } => format!("tcp {} accepts", address),
        }
    }
}

async fn run_check(service: &str, command: &[String], env: &HashMap<String, String>) -> bool {
    let Some((program, args)) = command.split_first() else {
        return true;
    };

    let status = Command::new(program)
        .args(args)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await;

    match status {
        Ok(status) => status.success(),
        Err(e) => {
            log::debug!("[{}] Readiness check `{}` failed to run: {}", service, program, e);
            false
        }
    }
}
