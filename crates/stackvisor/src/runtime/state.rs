//! Pid file and status snapshot shared by `up`, `down` and `status`

use crate::runtime::process::ServiceState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::fs::File;
use std::path::{Path, PathBuf};

const PID_FILE: &str = "supervisor.pid";
const STATUS_FILE: &str = "status.json";

/// Operator-facing view of one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    pub state: ServiceState,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub restart_count: u32,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_exit_code: Option<i32>,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Status of the whole stack at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub supervisor_pid: u32,
    pub updated_at: DateTime<Utc>,
    pub services: Vec<ServiceStatus>,
}

impl StatusSnapshot {
    pub fn new(services: Vec<ServiceStatus>) -> Self {
        Self {
            supervisor_pid: std::process::id(),
            updated_at: Utc::now(),
            services,
        }
    }

    pub fn service(&self, name: &str) -> Option<&ServiceStatus> {
        self.services.iter().find(|s| s.name == name)
    }
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl std::fmt::Display for StatusSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{:<20} {:<10} {:>8} {:>9} {:>6}  {}",
            "SERVICE", "STATE", "PID", "RESTARTS", "EXIT", "STARTED"
        )?;
        for s in &self.services {
            writeln!(
                f,
                "{:<20} {:<10} {:>8} {:>9} {:>6}  {}",
                s.name,
                s.state.to_string(),
                s.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
                s.restart_count,
                s.last_exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "-".into()),
                s.started_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".into()),
            )?;
            if let Some(err) = &s.last_error {
                writeln!(f, "    error: {}", err)?;
            }
        }
        Ok(())
    }
}

/// Files under the state directory
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Record this process as the running supervisor.
    ///
    /// The pid file stays exclusively locked while the returned guard lives,
    /// and is removed when the guard drops. Fails if another supervisor holds
    /// the lock.
    #[cfg(unix)]
    pub fn claim(&self) -> Result<SupervisorLock, StateError> {
        use nix::errno::Errno;
        use nix::fcntl::{Flock, FlockArg};
        use std::io::Write;
        use std::os::unix::fs::MetadataExt;

        std::fs::create_dir_all(&self.dir).map_err(|e| self.io_error(&self.dir, e))?;
        let path = self.dir.join(PID_FILE);

        let lock = loop {
            let file = self.open_pid_file(&path)?;
            let lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(lock) => lock,
                Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
                    return Err(StateError::AlreadyRunning(self.read_pid().unwrap_or_default()));
                }
                Err((_, errno)) => return Err(self.io_error(&path, errno.into())),
            };

            // the previous owner may have unlinked the file before we locked it
            let held = lock.metadata().map_err(|e| self.io_error(&path, e))?;
            match std::fs::metadata(&path) {
                Ok(current) if current.dev() == held.dev() && current.ino() == held.ino() => {
                    break lock;
                }
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(self.io_error(&path, e)),
            }
        };

        lock.set_len(0).map_err(|e| self.io_error(&path, e))?;
        (&*lock)
            .write_all(std::process::id().to_string().as_bytes())
            .map_err(|e| self.io_error(&path, e))?;

        Ok(SupervisorLock { path, _file: lock })
    }

    #[cfg(not(unix))]
    pub fn claim(&self) -> Result<SupervisorLock, StateError> {
        if let Some(pid) = self.running_supervisor() {
            return Err(StateError::AlreadyRunning(pid));
        }
        std::fs::create_dir_all(&self.dir).map_err(|e| self.io_error(&self.dir, e))?;
        let path = self.dir.join(PID_FILE);
        std::fs::write(&path, std::process::id().to_string())
            .map_err(|e| self.io_error(&path, e))?;
        Ok(SupervisorLock { path })
    }

    #[cfg(unix)]
    fn open_pid_file(&self, path: &Path) -> Result<File, StateError> {
        std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| self.io_error(path, e))
    }

    pub fn read_pid(&self) -> Option<u32> {
        std::fs::read_to_string(self.dir.join(PID_FILE))
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    /// Pid of the recorded supervisor, if it still holds the pid file lock.
    ///
    /// A pid file nobody has locked is left over from a crash; its pid may
    /// already belong to an unrelated process.
    pub fn running_supervisor(&self) -> Option<u32> {
        let pid = self.read_pid()?;
        (self.pid_file_locked() && process_alive(pid)).then_some(pid)
    }

    #[cfg(unix)]
    fn pid_file_locked(&self) -> bool {
        use nix::errno::Errno;
        use nix::fcntl::{Flock, FlockArg};

        let Ok(file) = File::open(self.dir.join(PID_FILE)) else {
            return false;
        };
        match Flock::lock(file, FlockArg::LockSharedNonblock) {
            Ok(_shared) => false,
            Err((_, errno)) => errno == Errno::EWOULDBLOCK,
        }
    }

    #[cfg(not(unix))]
    fn pid_file_locked(&self) -> bool {
        true
    }

    /// Replace the snapshot atomically
    pub fn write_status(&self, snapshot: &StatusSnapshot) -> Result<(), StateError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| self.io_error(&self.dir, e))?;
        let path = self.dir.join(STATUS_FILE);
        let tmp = self.dir.join(format!("{}.tmp", STATUS_FILE));
        let json = serde_json::to_vec_pretty(snapshot)?;
        std::fs::write(&tmp, json).map_err(|e| self.io_error(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| self.io_error(&path, e))
    }

    pub fn read_status(&self) -> Result<Option<StatusSnapshot>, StateError> {
        let path = self.dir.join(STATUS_FILE);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_error(&path, e)),
        }
    }

    fn io_error(&self, path: &Path, source: std::io::Error) -> StateError {
        StateError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Ownership of a state directory, held for the life of `up`
pub struct SupervisorLock {
    path: PathBuf,
    #[cfg(unix)]
    _file: nix::fcntl::Flock<File>,
}

impl SupervisorLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SupervisorLock {
    fn drop(&mut self) {
        // the lock itself is released after this, when `_file` drops
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Failed to remove {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Whether a process with this pid exists
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        // exists but belongs to someone else
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn process_alive(pid: u32) -> bool {
    pid == std::process::id()
}

/// Errors reading or writing supervisor state
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("A supervisor is already running with pid {0}")]
    AlreadyRunning(u32),

    #[error("State file error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid status snapshot: {0}")]
    Json(#[from] serde_json::Error),
}
