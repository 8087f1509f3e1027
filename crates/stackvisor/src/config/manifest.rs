//! Stack manifest YAML schema and its translation into service definitions

use crate::config::{LayerRef, SubstitutionContext, SubstitutionError};
use crate::runtime::{ReadinessProbe, VolumeBinding};
use crate::service::{shell_command, RestartPolicy, ServiceDefinition};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root of a stack manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default = "default_version")]
    pub version: String,

    /// Argument definitions with defaults, usable as `$(arg name)`
    #[serde(default)]
    pub args: IndexMap<String, ArgDefinition>,

    /// Environment layer applied first to every service
    #[serde(default)]
    pub env: IndexMap<String, ScalarValue>,

    /// Supervisor tunables
    #[serde(default)]
    pub settings: Settings,

    /// Base definitions that services can `extends`
    #[serde(default)]
    pub templates: IndexMap<String, ServiceSpec>,

    /// Named persistent volumes
    #[serde(default)]
    pub volumes: IndexMap<String, Option<VolumeSpec>>,

    /// Services, in declaration order
    pub services: IndexMap<String, ServiceSpec>,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// Argument definition with default value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArgDefinition {
    pub default: ScalarValue,
    #[serde(default)]
    pub description: Option<String>,
}

/// YAML scalars accepted where a string is ultimately needed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl ScalarValue {
    pub fn as_string(&self) -> String {
        match self {
            ScalarValue::Bool(b) => b.to_string(),
            ScalarValue::Int(i) => i.to_string(),
            ScalarValue::Float(f) => f.to_string(),
            ScalarValue::String(s) => s.clone(),
        }
    }

    /// Interpret a substituted string the way YAML would
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("true") {
            return ScalarValue::Bool(true);
        }
        if s.eq_ignore_ascii_case("false") {
            return ScalarValue::Bool(false);
        }
        if let Ok(i) = s.parse::<i64>() {
            return ScalarValue::Int(i);
        }
        if let Ok(f) = s.parse::<f64>() {
            return ScalarValue::Float(f);
        }
        ScalarValue::String(s.to_string())
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            ScalarValue::Bool(b) => *b,
            ScalarValue::Int(i) => *i != 0,
            ScalarValue::Float(f) => *f != 0.0,
            ScalarValue::String(s) => {
                !s.is_empty()
                    && !s.eq_ignore_ascii_case("false")
                    && !s.eq_ignore_ascii_case("0")
                    && !s.eq_ignore_ascii_case("no")
            }
        }
    }
}

/// Supervisor tunables; every field has a default
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub dependency_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub max_restarts: u32,
    pub ready_grace_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            dependency_timeout_ms: super::DEFAULT_DEPENDENCY_TIMEOUT_MS,
            shutdown_grace_ms: super::DEFAULT_SHUTDOWN_GRACE_MS,
            backoff_initial_ms: super::DEFAULT_BACKOFF_INITIAL_MS,
            backoff_max_ms: super::DEFAULT_BACKOFF_MAX_MS,
            max_restarts: super::DEFAULT_MAX_RESTARTS,
            ready_grace_ms: super::DEFAULT_READY_GRACE_MS,
        }
    }
}

/// A named volume declaration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeSpec {
    /// Host location; defaults to `<state_dir>/volumes/<name>`
    #[serde(default)]
    pub path: Option<String>,
}

/// A service or template as written in the manifest.
///
/// Every field is optional so a service can override only what differs from
/// the template it extends.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceSpec {
    #[serde(default)]
    pub extends: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub build: Option<String>,
    #[serde(default)]
    pub command: Option<CommandSpec>,
    #[serde(default)]
    pub env_file: Option<EnvFiles>,
    /// A key with no value is passed through from the supervisor's environment
    #[serde(default)]
    pub environment: Option<IndexMap<String, Option<ScalarValue>>>,
    #[serde(default)]
    pub depends_on: Option<Vec<String>>,
    #[serde(default)]
    pub restart: Option<RestartPolicy>,
    #[serde(default)]
    pub max_restarts: Option<u32>,
    /// `source:target[:ro]` entries
    #[serde(default)]
    pub volumes: Option<Vec<String>>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub ready: Option<ReadySpec>,
    #[serde(default)]
    pub stop_grace_period_ms: Option<u64>,
    /// Boolean or a substitution such as `$(arg with_flower)`
    #[serde(default)]
    pub enabled: Option<ScalarValue>,
}

impl ServiceSpec {
    /// Apply `self` as an override record on top of `base`.
    /// Fields set here replace the base field as a whole.
    pub fn overriding(&self, base: &ServiceSpec) -> ServiceSpec {
        fn pick<T: Clone>(over: &Option<T>, base: &Option<T>) -> Option<T> {
            over.clone().or_else(|| base.clone())
        }

        ServiceSpec {
            extends: None,
            image: pick(&self.image, &base.image),
            build: pick(&self.build, &base.build),
            command: pick(&self.command, &base.command),
            env_file: pick(&self.env_file, &base.env_file),
            environment: pick(&self.environment, &base.environment),
            depends_on: pick(&self.depends_on, &base.depends_on),
            restart: pick(&self.restart, &base.restart),
            max_restarts: pick(&self.max_restarts, &base.max_restarts),
            volumes: pick(&self.volumes, &base.volumes),
            working_dir: pick(&self.working_dir, &base.working_dir),
            ready: pick(&self.ready, &base.ready),
            stop_grace_period_ms: pick(&self.stop_grace_period_ms, &base.stop_grace_period_ms),
            enabled: pick(&self.enabled, &base.enabled),
        }
    }
}

/// `command: "/start"` runs through the shell, `command: [prog, arg]` runs directly
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandSpec {
    Shell(String),
    Exec(Vec<String>),
}

impl CommandSpec {
    fn to_argv(&self, ctx: &SubstitutionContext) -> Result<Vec<String>, SubstitutionError> {
        match self {
            CommandSpec::Shell(script) => Ok(shell_command(&ctx.substitute(script)?)),
            CommandSpec::Exec(argv) => ctx.substitute_all(argv),
        }
    }
}

/// `env_file` accepts a single path or a list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvFiles {
    One(String),
    Many(Vec<String>),
}

impl EnvFiles {
    pub fn paths(&self) -> Vec<String> {
        match self {
            EnvFiles::One(path) => vec![path.clone()],
            EnvFiles::Many(paths) => paths.clone(),
        }
    }
}

/// Readiness declaration; at most one of `command` and `tcp`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadySpec {
    #[serde(default)]
    pub grace_ms: Option<u64>,
    #[serde(default)]
    pub command: Option<CommandSpec>,
    #[serde(default)]
    pub tcp: Option<String>,
    #[serde(default)]
    pub interval_ms: Option<u64>,
}

/// Directories manifest paths are resolved against
#[derive(Debug, Clone)]
pub struct ManifestPaths {
    /// Directory containing the manifest
    pub base_dir: PathBuf,
    /// Where supervisor state and default volumes live
    pub state_dir: PathBuf,
}

impl Manifest {
    /// Load a manifest from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ManifestError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_yaml(&content)
    }

    /// Parse a manifest from a YAML string
    pub fn from_yaml(content: &str) -> Result<Self, ManifestError> {
        let manifest: Manifest = serde_yaml::from_str(content)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Structural checks that do not need substitution
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.services.is_empty() {
            return Err(ManifestError::Validation("no services declared".into()));
        }

        for name in self.services.keys() {
            let spec = self.effective_spec(name)?;
            if spec.command.is_none() {
                return Err(ManifestError::Validation(format!(
                    "service '{}' has no command",
                    name
                )));
            }
            if let Some(ready) = &spec.ready {
                if ready.command.is_some() && ready.tcp.is_some() {
                    return Err(ManifestError::Validation(format!(
                        "service '{}': ready accepts either 'command' or 'tcp', not both",
                        name
                    )));
                }
            }
        }

        Ok(())
    }

    /// The service spec with its template chain applied
    pub fn effective_spec(&self, service: &str) -> Result<ServiceSpec, ManifestError> {
        let spec = self
            .services
            .get(service)
            .ok_or_else(|| ManifestError::Validation(format!("unknown service '{}'", service)))?;

        let mut merged = spec.clone();
        let mut seen = HashSet::new();
        while let Some(template) = merged.extends.clone() {
            if !seen.insert(template.clone()) {
                return Err(ManifestError::TemplateCycle {
                    service: service.to_string(),
                    template,
                });
            }
            let base = self.templates.get(&template).ok_or_else(|| {
                ManifestError::UnknownTemplate {
                    service: service.to_string(),
                    template: template.clone(),
                }
            })?;
            let next_extends = base.extends.clone();
            merged = merged.overriding(base);
            merged.extends = next_extends;
        }

        Ok(merged)
    }

    /// Argument values after applying `-a key:=value` overrides
    pub fn substitution_context(
        &self,
        overrides: &HashMap<String, String>,
    ) -> Result<SubstitutionContext, ManifestError> {
        let mut args: HashMap<String, String> = self
            .args
            .iter()
            .map(|(name, def)| (name.clone(), def.default.as_string()))
            .collect();

        for (name, value) in overrides {
            if !self.args.contains_key(name) {
                return Err(ManifestError::UnknownArgument(name.clone()));
            }
            args.insert(name.clone(), value.clone());
        }

        Ok(SubstitutionContext::new().with_args(args))
    }

    /// Translate enabled services into immutable definitions, in declaration order
    pub fn definitions(
        &self,
        ctx: &SubstitutionContext,
        paths: &ManifestPaths,
    ) -> Result<Vec<ServiceDefinition>, ManifestError> {
        let mut enabled = IndexMap::new();
        for name in self.services.keys() {
            let spec = self.effective_spec(name)?;
            if self.is_enabled(name, &spec, ctx)? {
                enabled.insert(name.clone(), spec);
            } else {
                log::info!("[{}] Disabled, skipping", name);
            }
        }

        for (name, spec) in &enabled {
            for dep in spec.depends_on.iter().flatten() {
                if self.services.contains_key(dep) && !enabled.contains_key(dep) {
                    return Err(ManifestError::DisabledDependency {
                        service: name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let global_env = self.global_layer(ctx)?;
        enabled
            .iter()
            .map(|(name, spec)| self.definition(name, spec, ctx, paths, global_env.as_ref()))
            .collect()
    }

    fn is_enabled(
        &self,
        name: &str,
        spec: &ServiceSpec,
        ctx: &SubstitutionContext,
    ) -> Result<bool, ManifestError> {
        match &spec.enabled {
            None => Ok(true),
            Some(ScalarValue::String(s)) => {
                let resolved = subst(ctx, s, || format!("service '{}' enabled", name))?;
                Ok(ScalarValue::parse(&resolved).is_truthy())
            }
            Some(value) => Ok(value.is_truthy()),
        }
    }

    fn global_layer(&self, ctx: &SubstitutionContext) -> Result<Option<LayerRef>, ManifestError> {
        if self.env.is_empty() {
            return Ok(None);
        }
        let mut values = IndexMap::new();
        for (key, value) in &self.env {
            let resolved = subst(ctx, &value.as_string(), || format!("global env '{}'", key))?;
            values.insert(key.clone(), resolved);
        }
        Ok(Some(LayerRef::inline("env", values)))
    }

    fn definition(
        &self,
        name: &str,
        spec: &ServiceSpec,
        ctx: &SubstitutionContext,
        paths: &ManifestPaths,
        global_env: Option<&LayerRef>,
    ) -> Result<ServiceDefinition, ManifestError> {
        let command = spec
            .command
            .as_ref()
            .ok_or_else(|| ManifestError::Validation(format!("service '{}' has no command", name)))?
            .to_argv(ctx)
            .map_err(|e| ManifestError::Substitution {
                context: format!("service '{}' command", name),
                source: e,
            })?;

        let mut layers: Vec<LayerRef> = global_env.cloned().into_iter().collect();
        for path in spec.env_file.iter().flat_map(EnvFiles::paths) {
            let path = subst(ctx, &path, || format!("service '{}' env_file", name))?;
            layers.push(LayerRef::File(PathBuf::from(path)));
        }
        if let Some(environment) = &spec.environment {
            let mut values = IndexMap::new();
            for (key, value) in environment {
                match value {
                    Some(value) => {
                        let resolved = subst(ctx, &value.as_string(), || {
                            format!("service '{}' environment '{}'", name, key)
                        })?;
                        values.insert(key.clone(), resolved);
                    }
                    None => {
                        if let Ok(inherited) = std::env::var(key) {
                            values.insert(key.clone(), inherited);
                        }
                    }
                }
            }
            layers.push(LayerRef::inline(format!("{}.environment", name), values));
        }

        let working_dir = spec
            .working_dir
            .as_ref()
            .map(|dir| {
                subst(ctx, dir, || format!("service '{}' working_dir", name))
                    .map(|dir| resolve_host_path(&dir, &paths.base_dir))
            })
            .transpose()?;

        let mut volumes = Vec::new();
        for entry in spec.volumes.iter().flatten() {
            let entry = subst(ctx, entry, || format!("service '{}' volumes", name))?;
            volumes.push(self.volume_binding(name, &entry, paths)?);
        }

        let settings = &self.settings;
        let readiness = match &spec.ready {
            None => ReadinessProbe::Grace(Duration::from_millis(settings.ready_grace_ms)),
            Some(ready) => self.readiness(name, ready, ctx)?,
        };

        let image = spec
            .image
            .as_ref()
            .map(|s| subst(ctx, s, || format!("service '{}' image", name)))
            .transpose()?;
        let build = spec
            .build
            .as_ref()
            .map(|s| subst(ctx, s, || format!("service '{}' build", name)))
            .transpose()?;

        Ok(ServiceDefinition {
            name: name.to_string(),
            image,
            build,
            layers,
            command,
            working_dir,
            depends_on: spec.depends_on.clone().unwrap_or_default(),
            restart: spec.restart.unwrap_or_default(),
            max_restarts: spec.max_restarts.unwrap_or(settings.max_restarts),
            volumes,
            readiness,
            stop_grace: Duration::from_millis(
                spec.stop_grace_period_ms.unwrap_or(settings.shutdown_grace_ms),
            ),
        })
    }

    fn readiness(
        &self,
        name: &str,
        ready: &ReadySpec,
        ctx: &SubstitutionContext,
    ) -> Result<ReadinessProbe, ManifestError> {
        let interval =
            Duration::from_millis(ready.interval_ms.unwrap_or(super::DEFAULT_PROBE_INTERVAL_MS));

        if let Some(command) = &ready.command {
            let command = command.to_argv(ctx).map_err(|e| ManifestError::Substitution {
                context: format!("service '{}' ready command", name),
                source: e,
            })?;
            return Ok(ReadinessProbe::Command { command, interval });
        }
        if let Some(address) = &ready.tcp {
            let address = subst(ctx, address, || format!("service '{}' ready tcp", name))?;
            return Ok(ReadinessProbe::Tcp { address, interval });
        }
        Ok(ReadinessProbe::Grace(Duration::from_millis(
            ready.grace_ms.unwrap_or(self.settings.ready_grace_ms),
        )))
    }

    fn volume_binding(
        &self,
        service: &str,
        entry: &str,
        paths: &ManifestPaths,
    ) -> Result<VolumeBinding, ManifestError> {
        let invalid = |reason: &str| ManifestError::Volume {
            service: service.to_string(),
            entry: entry.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = entry.split(':').collect();
        let (source, target, read_only) = match parts.as_slice() {
            [source, target] => (*source, *target, false),
            [source, target, "ro"] => (*source, *target, true),
            [source, target, "rw"] => (*source, *target, false),
            [_, _, mode] => return Err(invalid(&format!("unknown mode '{}'", mode))),
            _ => return Err(invalid("expected source:target[:ro]")),
        };
        if source.is_empty() || target.is_empty() {
            return Err(invalid("empty source or target"));
        }

        let binding = if source.starts_with(['.', '/', '~']) {
            VolumeBinding::new(source, resolve_host_path(source, &paths.base_dir), target)
        } else {
            let spec = self
                .volumes
                .get(source)
                .ok_or_else(|| invalid(&format!("volume '{}' is not declared", source)))?;
            let host = match spec.as_ref().and_then(|s| s.path.as_deref()) {
                Some(path) => resolve_host_path(path, &paths.base_dir),
                None => paths.state_dir.join("volumes").join(source),
            };
            VolumeBinding::new(source, host, target)
        };

        Ok(if read_only { binding.read_only() } else { binding })
    }

    /// Unique image references, for display
    pub fn images(&self) -> Vec<String> {
        let mut images: Vec<String> = self
            .services
            .keys()
            .filter_map(|name| self.effective_spec(name).ok())
            .filter_map(|spec| spec.image)
            .collect();
        images.sort();
        images.dedup();
        images
    }
}

fn subst(
    ctx: &SubstitutionContext,
    input: &str,
    context: impl FnOnce() -> String,
) -> Result<String, ManifestError> {
    ctx.substitute(input).map_err(|e| ManifestError::Substitution {
        context: context(),
        source: e,
    })
}

/// Expand `~` and anchor relative paths at `base_dir`
pub fn resolve_host_path(path: &str, base_dir: &Path) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    let path = PathBuf::from(path);
    if path.is_absolute() {
        path
    } else {
        base_dir.join(path)
    }
}

/// Errors that can occur when loading a manifest
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("Failed to read manifest '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse manifest: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown argument: {0}")]
    UnknownArgument(String),

    #[error("Service '{service}' extends unknown template '{template}'")]
    UnknownTemplate { service: String, template: String },

    #[error("Service '{service}': template '{template}' extends itself")]
    TemplateCycle { service: String, template: String },

    #[error("Service '{service}' depends on disabled service '{dependency}'")]
    DisabledDependency { service: String, dependency: String },

    #[error("Substitution failed in {context}: {source}")]
    Substitution {
        context: String,
        #[source]
        source: SubstitutionError,
    },

    #[error("Service '{service}': invalid volume '{entry}': {reason}")]
    Volume {
        service: String,
        entry: String,
        reason: String,
    },
}
