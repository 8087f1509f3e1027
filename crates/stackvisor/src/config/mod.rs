//! Manifest loading, substitution and configuration layers

pub mod layers;
pub mod manifest;
pub mod substitution;

pub use layers::*;
pub use manifest::*;
pub use substitution::*;

/// How long a dependent waits for its dependencies to become Ready
pub const DEFAULT_DEPENDENCY_TIMEOUT_MS: u64 = 30_000;
/// Time between SIGTERM and SIGKILL on shutdown
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 10_000;
pub const DEFAULT_BACKOFF_INITIAL_MS: u64 = 1_000;
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;
/// Restarts allowed per service before it is given up on
pub const DEFAULT_MAX_RESTARTS: u32 = 3;
/// Services without a probe are Ready after staying up this long
pub const DEFAULT_READY_GRACE_MS: u64 = 2_000;
/// Retry interval of command and tcp readiness probes
pub const DEFAULT_PROBE_INTERVAL_MS: u64 = 500;
