//! Configuration layers and their merge into a per-service snapshot

use crate::service::ServiceDefinition;
use indexmap::IndexMap;
use std::path::PathBuf;

/// Reference to one configuration layer of a service
#[derive(Debug, Clone, PartialEq)]
pub enum LayerRef {
    /// Values declared directly in the manifest
    Inline {
        name: String,
        values: IndexMap<String, String>,
    },
    /// An env file, relative to the manifest directory unless absolute
    File(PathBuf),
}

impl LayerRef {
    pub fn inline(name: impl Into<String>, values: IndexMap<String, String>) -> Self {
        LayerRef::Inline {
            name: name.into(),
            values,
        }
    }

    pub fn name(&self) -> String {
        match self {
            LayerRef::Inline { name, .. } => name.clone(),
            LayerRef::File(path) => path.display().to_string(),
        }
    }
}

/// A named, ordered set of key/value pairs
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigLayer {
    pub name: String,
    pub values: IndexMap<String, String>,
}

impl ConfigLayer {
    /// Parse env-file content (`KEY=VALUE` per line)
    pub fn parse(name: &str, content: &str) -> Result<Self, ConfigLoadError> {
        let mut values = IndexMap::new();

        for (idx, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = line.strip_prefix("export ").unwrap_or(line);

            let parse_error = |message: &str| ConfigLoadError::Parse {
                layer: name.to_string(),
                line: idx + 1,
                message: message.to_string(),
            };

            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| parse_error("expected KEY=VALUE"))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(parse_error("empty key"));
            }
            if key.chars().any(char::is_whitespace) {
                return Err(parse_error("key contains whitespace"));
            }

            values.insert(key.to_string(), parse_value(value));
        }

        Ok(Self {
            name: name.to_string(),
            values,
        })
    }
}

fn parse_value(raw: &str) -> String {
    let value = raw.trim();
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return value[1..value.len() - 1].to_string();
        }
    }
    match value.find(" #") {
        Some(pos) => value[..pos].trim_end().to_string(),
        None => value.to_string(),
    }
}

/// The flattened environment of one service.
///
/// Built once per launch plan and never mutated; a reload builds a new one.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResolvedConfig {
    service: String,
    values: IndexMap<String, String>,
}

impl ResolvedConfig {
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Reads layer sources and merges them in declared order
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Loader resolving relative layer paths against `base_dir`
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Read a single layer
    pub fn load_layer(&self, layer: &LayerRef) -> Result<ConfigLayer, ConfigLoadError> {
        match layer {
            LayerRef::Inline { name, values } => Ok(ConfigLayer {
                name: name.clone(),
                values: values.clone(),
            }),
            LayerRef::File(path) => {
                let path = if path.is_absolute() {
                    path.clone()
                } else {
                    self.base_dir.join(path)
                };
                let content = std::fs::read_to_string(&path).map_err(|e| {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        ConfigLoadError::NotFound { path: path.clone() }
                    } else {
                        ConfigLoadError::Io {
                            path: path.clone(),
                            source: e,
                        }
                    }
                })?;
                ConfigLayer::parse(&path.display().to_string(), &content)
            }
        }
    }

    /// Merge a service's layers; later layers win on key collision
    pub fn resolve(&self, service: &ServiceDefinition) -> Result<ResolvedConfig, ConfigLoadError> {
        let mut values = IndexMap::new();

        for layer_ref in &service.layers {
            let layer = self.load_layer(layer_ref).map_err(|e| ConfigLoadError::Service {
                service: service.name.clone(),
                source: Box::new(e),
            })?;
            log::debug!(
                "[{}] Layer '{}' contributes {} keys",
                service.name,
                layer.name,
                layer.values.len()
            );
            values.extend(layer.values);
        }

        Ok(ResolvedConfig {
            service: service.name.clone(),
            values,
        })
    }
}

/// Errors raised while loading configuration layers
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("Configuration layer not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("Failed to read configuration layer '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid line {line} in layer '{layer}': {message}")]
    Parse {
        layer: String,
        line: usize,
        message: String,
    },

    #[error("Service '{service}': {source}")]
    Service {
        service: String,
        #[source]
        source: Box<ConfigLoadError>,
    },
}
