//! Immutable service definitions produced from a manifest

use crate::config::LayerRef;
use crate::runtime::{ReadinessProbe, VolumeBinding};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Restart policy for a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Never restart (default)
    #[default]
    #[serde(alias = "none", alias = "never")]
    No,
    /// Restart on non-zero exit or death by signal
    OnFailure,
    /// Restart on any exit
    Always,
}

impl RestartPolicy {
    /// Whether an exit with `code` calls for a relaunch.
    ///
    /// `None` means the process was killed by a signal.
    pub fn should_restart(&self, code: Option<i32>) -> bool {
        match self {
            RestartPolicy::No => false,
            RestartPolicy::OnFailure => code != Some(0),
            RestartPolicy::Always => true,
        }
    }
}

/// One service of the stack, fully resolved from the manifest
#[derive(Debug, Clone)]
pub struct ServiceDefinition {
    pub name: String,
    /// Image reference, carried for identification only
    pub image: Option<String>,
    /// Build context, carried for identification only
    pub build: Option<String>,
    /// Configuration layers, merged in order
    pub layers: Vec<LayerRef>,
    /// Program followed by its arguments
    pub command: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Services that must be Ready before this one starts
    pub depends_on: Vec<String>,
    pub restart: RestartPolicy,
    /// Number of restarts allowed before the service is given up on
    pub max_restarts: u32,
    pub volumes: Vec<VolumeBinding>,
    pub readiness: ReadinessProbe,
    /// Time between SIGTERM and SIGKILL on shutdown
    pub stop_grace: Duration,
}

impl ServiceDefinition {
    /// Definition with default policies; mostly useful for tests and embedding
    pub fn new(name: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            name: name.into(),
            image: None,
            build: None,
            layers: Vec::new(),
            command,
            working_dir: None,
            depends_on: Vec::new(),
            restart: RestartPolicy::No,
            max_restarts: crate::config::DEFAULT_MAX_RESTARTS,
            volumes: Vec::new(),
            readiness: ReadinessProbe::default(),
            stop_grace: Duration::from_millis(crate::config::DEFAULT_SHUTDOWN_GRACE_MS),
        }
    }

    /// Shell command definition (`/bin/sh -c <script>`)
    pub fn shell(name: impl Into<String>, script: &str) -> Self {
        Self::new(name, shell_command(script))
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_restart(mut self, policy: RestartPolicy, max_restarts: u32) -> Self {
        self.restart = policy;
        self.max_restarts = max_restarts;
        self
    }

    pub fn with_readiness(mut self, readiness: ReadinessProbe) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn with_layer(mut self, layer: LayerRef) -> Self {
        self.layers.push(layer);
        self
    }

    /// Command line as a single display string
    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }
}

/// Wrap a script string so it runs through the POSIX shell
pub fn shell_command(script: &str) -> Vec<String> {
    vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
}
