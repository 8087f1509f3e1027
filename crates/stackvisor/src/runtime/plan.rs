//! Launch plan - everything `up` needs, validated before any side effect

use crate::config::{
    ConfigLoadError, ConfigLoader, Manifest, ManifestError, ManifestPaths, Settings,
};
use crate::runtime::graph::{GraphError, ServiceGraph};
use crate::runtime::supervisor::PreparedService;
use crate::service::ServiceDefinition;
use std::collections::HashMap;

/// Services in start order with their resolved configuration
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub services: Vec<PreparedService>,
    pub settings: Settings,
    /// Arguments after overrides, for display
    pub args: HashMap<String, String>,
}

impl LaunchPlan {
    /// Order the definitions and resolve every service's configuration.
    ///
    /// Graph errors are reported before any configuration file is read.
    pub fn build(
        definitions: Vec<ServiceDefinition>,
        loader: &ConfigLoader,
        settings: Settings,
    ) -> Result<Self, PlanError> {
        let graph = ServiceGraph::from_definitions(definitions)?;
        let ordered = graph.ordered()?;

        let mut services = Vec::with_capacity(ordered.len());
        for definition in ordered {
            let config = loader.resolve(&definition)?;
            services.push(PreparedService { definition, config });
        }

        Ok(Self {
            services,
            settings,
            args: HashMap::new(),
        })
    }

    /// Load, order and resolve a whole manifest
    pub fn from_manifest(
        manifest: &Manifest,
        overrides: &HashMap<String, String>,
        paths: &ManifestPaths,
    ) -> Result<Self, PlanError> {
        let ctx = manifest.substitution_context(overrides)?;
        let definitions = manifest.definitions(&ctx, paths)?;
        let loader = ConfigLoader::new(&paths.base_dir);

        let mut plan = Self::build(definitions, &loader, manifest.settings.clone())?;
        plan.args = ctx.args;
        Ok(plan)
    }

    /// Service names in start order
    pub fn order(&self) -> Vec<&str> {
        self.services
            .iter()
            .map(|s| s.definition.name.as_str())
            .collect()
    }
}

impl std::fmt::Display for LaunchPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Launch Plan")?;
        writeln!(f, "===========")?;
        writeln!(f)?;

        if !self.args.is_empty() {
            let mut args: Vec<_> = self.args.iter().collect();
            args.sort();
            writeln!(f, "Arguments:")?;
            for (key, value) in args {
                writeln!(f, "  {}: {}", key, value)?;
            }
            writeln!(f)?;
        }

        writeln!(f, "Services (in start order):")?;
        for (i, service) in self.services.iter().enumerate() {
            let def = &service.definition;
            writeln!(f)?;
            writeln!(
                f,
                "  {}. {} {}",
                i + 1,
                def.name,
                def.image
                    .as_ref()
                    .map(|image| format!("[{}]", image))
                    .unwrap_or_default()
            )?;
            writeln!(f, "     Command: {}", def.command_line())?;

            if !def.depends_on.is_empty() {
                writeln!(f, "     Depends on: {}", def.depends_on.join(", "))?;
            }
            writeln!(f, "     Restart: {:?} (max {})", def.restart, def.max_restarts)?;
            writeln!(f, "     Ready: {}", def.readiness.describe())?;

            for volume in &def.volumes {
                writeln!(
                    f,
                    "     Volume: {} -> {}{}",
                    volume.host_path.display(),
                    volume.container_path,
                    if volume.read_only { " (ro)" } else { "" }
                )?;
            }

            if !service.config.is_empty() {
                writeln!(f, "     Environment:")?;
                for (key, value) in service.config.iter() {
                    writeln!(f, "       {}={}", key, value)?;
                }
            }
        }

        Ok(())
    }
}

/// Errors that stop a stack from being brought up
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Config(#[from] ConfigLoadError),
}

impl PlanError {
    /// Process exit code for this failure
    pub fn exit_code(&self) -> u8 {
        match self {
            PlanError::Graph(GraphError::Cycle(_)) => 3,
            _ => 2,
        }
    }
}
