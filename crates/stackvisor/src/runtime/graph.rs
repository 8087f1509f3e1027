//! Service dependency graph and start ordering

use crate::service::ServiceDefinition;
use indexmap::IndexMap;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

/// Services and their `depends_on` edges, in declaration order
#[derive(Debug, Default, Clone)]
pub struct ServiceGraph {
    services: IndexMap<String, Arc<ServiceDefinition>>,
}

impl ServiceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from definitions in declaration order
    pub fn from_definitions(
        definitions: impl IntoIterator<Item = ServiceDefinition>,
    ) -> Result<Self, GraphError> {
        let mut graph = Self::new();
        for def in definitions {
            graph.add_service(def)?;
        }
        Ok(graph)
    }

    pub fn add_service(&mut self, def: ServiceDefinition) -> Result<(), GraphError> {
        if self.services.contains_key(&def.name) {
            return Err(GraphError::DuplicateService(def.name));
        }
        self.services.insert(def.name.clone(), Arc::new(def));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ServiceDefinition>> {
        self.services.get(name)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Definitions in declaration order
    pub fn services(&self) -> impl Iterator<Item = &Arc<ServiceDefinition>> {
        self.services.values()
    }

    /// Start order: every service after all of its dependencies.
    ///
    /// Kahn's algorithm; among services that are ready at the same time the
    /// one declared first goes first.
    pub fn validate(&self) -> Result<Vec<String>, GraphError> {
        for def in self.services.values() {
            for dep in &def.depends_on {
                if !self.services.contains_key(dep) {
                    return Err(GraphError::UnknownDependency {
                        service: def.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let n = self.services.len();
        let mut in_degree = vec![0usize; n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];

        for (idx, def) in self.services.values().enumerate() {
            // a repeated entry in depends_on is a single edge
            let deps: HashSet<&String> = def.depends_on.iter().collect();
            for dep in deps {
                if let Some(dep_idx) = self.services.get_index_of(dep) {
                    in_degree[idx] += 1;
                    dependents[dep_idx].push(idx);
                }
            }
        }

        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);

        while let Some(idx) = ready.pop_first() {
            order.push(idx);
            for &dependent in &dependents[idx] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() != n {
            let participants = self.cycle_participants(&in_degree);
            return Err(GraphError::Cycle(CycleError { participants }));
        }

        Ok(order
            .into_iter()
            .filter_map(|i| self.services.get_index(i).map(|(name, _)| name.clone()))
            .collect())
    }

    /// Of the services Kahn could not order, drop the ones that merely sit
    /// downstream of a cycle.
    fn cycle_participants(&self, in_degree: &[usize]) -> Vec<String> {
        let mut remaining: Vec<bool> = in_degree.iter().map(|&d| d > 0).collect();

        loop {
            let mut pruned = false;
            for idx in 0..remaining.len() {
                if !remaining[idx] {
                    continue;
                }
                let name = match self.services.get_index(idx) {
                    Some((name, _)) => name,
                    None => continue,
                };
                let needed = self.services.values().enumerate().any(|(other, def)| {
                    remaining[other] && def.depends_on.iter().any(|d| d == name)
                });
                if !needed {
                    remaining[idx] = false;
                    pruned = true;
                }
            }
            if !pruned {
                break;
            }
        }

        self.services
            .keys()
            .enumerate()
            .filter(|(idx, _)| remaining[*idx])
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Ordered definitions, ready to hand to the supervisor
    pub fn ordered(&self) -> Result<Vec<Arc<ServiceDefinition>>, GraphError> {
        Ok(self
            .validate()?
            .iter()
            .filter_map(|name| self.services.get(name).cloned())
            .collect())
    }
}

/// A dependency cycle, fatal at load time
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Cyclic dependency detected involving services: {}", .participants.join(", "))]
pub struct CycleError {
    /// Services on a cycle, in declaration order
    pub participants: Vec<String>,
}

/// Errors that can occur when building or ordering the graph
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("Service '{0}' is declared more than once")]
    DuplicateService(String),

    #[error("Service '{service}' depends on unknown service '{dependency}'")]
    UnknownDependency { service: String, dependency: String },

    #[error(transparent)]
    Cycle(#[from] CycleError),
}
