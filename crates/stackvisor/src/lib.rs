//! Stackvisor
//!
//! Brings up a local stack of cooperating services described in a YAML
//! manifest, keeps them running and tears them down in order.
//!
//! # Overview
//!
//! - Services start only after their dependencies report Ready
//! - Crashed services are restarted with capped exponential backoff
//! - Shutdown stops services in reverse start order
//! - Environment is layered from the manifest, env files and per-service values
//! - Named volumes are created and checked before a service launches
//!
//! # Example Manifest
//!
//! ```yaml
//! version: "1.0"
//!
//! args:
//!   web_port:
//!     default: 8000
//!
//! volumes:
//!   postgres_data: {}
//!
//! services:
//!   postgres:
//!     command: ["postgres", "-D", "/var/lib/postgresql/data"]
//!     env_file: ./.envs/.production/.postgres
//!     volumes:
//!       - postgres_data:/var/lib/postgresql/data
//!     ready:
//!       tcp: "127.0.0.1:5432"
//!
//!   django:
//!     command: "gunicorn config.wsgi --bind 0.0.0.0:$(arg web_port)"
//!     depends_on: [postgres]
//!     restart: on-failure
//! ```

pub mod cli;
pub mod config;
pub mod runtime;
pub mod service;

pub use cli::StackvisorArgs;
pub use config::{
    ConfigLoadError, ConfigLoader, Manifest, ManifestError, ManifestPaths, ResolvedConfig,
    SubstitutionContext, SubstitutionError,
};
pub use runtime::{
    CycleError, GraphError, LaunchPlan, PlanError, ProcessEvent, ServiceGraph, ServiceState,
    StateStore, StatusSnapshot, Supervisor, SupervisorConfig, SupervisorError, SupervisorReport,
    VolumeManager,
};
pub use service::{RestartPolicy, ServiceDefinition};
