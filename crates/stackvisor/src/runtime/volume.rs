//! Persistent storage locations bound to services

use std::path::{Path, PathBuf};

/// Name of the file written to check that a location is writable
const WRITE_PROBE: &str = ".stackvisor-write-probe";

/// A persistent location and where the service expects it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeBinding {
    /// Named volume, or the host path itself for bind mounts
    pub name: String,
    pub host_path: PathBuf,
    /// Path the service was declared to see the data under
    pub container_path: String,
    pub read_only: bool,
}

impl VolumeBinding {
    pub fn new(
        name: impl Into<String>,
        host_path: impl Into<PathBuf>,
        container_path: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            host_path: host_path.into(),
            container_path: container_path.into(),
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// Makes sure volume locations exist before their owners start
#[derive(Debug, Clone, Default)]
pub struct VolumeManager;

impl VolumeManager {
    pub fn new() -> Self {
        Self
    }

    /// Create the host location if needed and verify it can be written.
    ///
    /// Calling this again on a satisfied binding changes nothing.
    pub fn ensure(&self, binding: &VolumeBinding) -> Result<(), VolumeError> {
        let path = &binding.host_path;

        match std::fs::metadata(path) {
            Ok(meta) if !meta.is_dir() => {
                return Err(VolumeError::NotADirectory {
                    volume: binding.name.clone(),
                    path: path.clone(),
                });
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if binding.read_only {
                    return Err(VolumeError::Missing {
                        volume: binding.name.clone(),
                        path: path.clone(),
                    });
                }
                log::info!(
                    "Creating volume '{}' at {}",
                    binding.name,
                    path.display()
                );
                std::fs::create_dir_all(path).map_err(|e| VolumeError::Create {
                    volume: binding.name.clone(),
                    path: path.clone(),
                    source: e,
                })?;
            }
            Err(e) => {
                return Err(VolumeError::Create {
                    volume: binding.name.clone(),
                    path: path.clone(),
                    source: e,
                });
            }
        }

        if !binding.read_only {
            check_writable(path).map_err(|e| VolumeError::NotWritable {
                volume: binding.name.clone(),
                path: path.clone(),
                source: e,
            })?;
        }

        Ok(())
    }

    /// Ensure every binding, stopping at the first failure
    pub fn ensure_all<'a>(
        &self,
        bindings: impl IntoIterator<Item = &'a VolumeBinding>,
    ) -> Result<(), VolumeError> {
        bindings.into_iter().try_for_each(|b| self.ensure(b))
    }
}

fn check_writable(dir: &Path) -> std::io::Result<()> {
    let probe = dir.join(WRITE_PROBE);
    std::fs::write(&probe, b"")?;
    std::fs::remove_file(&probe)
}

/// Errors raised while preparing a volume
#[derive(Debug, thiserror::Error)]
pub enum VolumeError {
    #[error("Volume '{volume}': {} exists but is not a directory", path.display())]
    NotADirectory { volume: String, path: PathBuf },

    #[error("Volume '{volume}': read-only location {} does not exist", path.display())]
    Missing { volume: String, path: PathBuf },

    #[error("Volume '{volume}': cannot create {}: {source}", path.display())]
    Create {
        volume: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Volume '{volume}': {} is not writable: {source}", path.display())]
    NotWritable {
        volume: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = walk(dir)
            .into_iter()
            .map(|p| p.strip_prefix(dir).unwrap().display().to_string())
            .collect();
        names.sort();
        names
    }

    fn walk(dir: &Path) -> Vec<PathBuf> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            out.push(path.clone());
            if path.is_dir() {
                out.extend(walk(&path));
            }
        }
        out
    }

    #[test]
    fn test_ensure_creates_nested_location() {
        let root = tempfile::tempdir().unwrap();
        let binding = VolumeBinding::new(
            "postgres_data",
            root.path().join("volumes/postgres_data"),
            "/var/lib/postgresql/data",
        );

        VolumeManager::new().ensure(&binding).unwrap();
        assert!(binding.host_path.is_dir());
        assert!(!binding.host_path.join(WRITE_PROBE).exists());
    }

    #[test]
    fn test_ensure_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let binding = VolumeBinding::new("backups", root.path().join("backups"), "/backups");
        let manager = VolumeManager::new();

        manager.ensure(&binding).unwrap();
        let once = listing(root.path());
        manager.ensure(&binding).unwrap();
        assert_eq!(listing(root.path()), once);
    }

    #[test]
    fn test_ensure_rejects_file() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("not_a_dir");
        std::fs::write(&path, b"data").unwrap();

        let err = VolumeManager::new()
            .ensure(&VolumeBinding::new("data", &path, "/data"))
            .unwrap_err();
        assert!(matches!(err, VolumeError::NotADirectory { .. }));
    }

    #[test]
    fn test_read_only_binding_must_exist() {
        let root = tempfile::tempdir().unwrap();
        let binding =
            VolumeBinding::new("certs", root.path().join("certs"), "/etc/certs").read_only();

        let err = VolumeManager::new().ensure(&binding).unwrap_err();
        assert!(matches!(err, VolumeError::Missing { .. }));
        assert!(!binding.host_path.exists());
    }
}
