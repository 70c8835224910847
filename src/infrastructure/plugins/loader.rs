//! Plugin loader - Builds plugins from configuration descriptors

use std::sync::{Arc, Weak};
use crate::application::errors::ConfigError;
use crate::application::services::Core;
use crate::infrastructure::config::{Config, PluginDescriptor};
use crate::plugins::trait_def::{Plugin, PluginContext};
use super::keywords::coerce;
use super::registry::PluginRegistry;

/// Outcome of loading every plugin in a configuration
#[derive(Default)]
pub struct LoadReport {
    /// Successfully built plugins, in configuration order
    pub loaded: Vec<Arc<dyn Plugin>>,
    /// Type name and error for every entry that failed
    pub failed: Vec<(String, ConfigError)>,
}

/// Plugin loader
pub struct PluginLoader {
    registry: PluginRegistry,
}

impl PluginLoader {
    pub fn new(registry: PluginRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// Build a single plugin and subscribe it to its channels.
    ///
    /// Keywords are coerced before the factory runs. Channels are only
    /// subscribed once construction succeeded, so a failed load leaves
    /// nothing registered anywhere.
    pub fn load_plugin(&self, core: Weak<Core>, descriptor: PluginDescriptor) -> Result<Arc<dyn Plugin>, ConfigError> {
        let spec = self.registry.resolve(&descriptor.type_name)?;
        let keywords = coerce(spec.keywords, descriptor.keywords)?;

        let plugin = (spec.factory)(PluginContext::new(spec.type_name, core), &keywords)?;
        for channel in &descriptor.channels {
            plugin.agent().subscribe(channel);
        }

        tracing::info!("Loaded plugin: {} on {:?}", spec.type_name, descriptor.channels);
        Ok(plugin)
    }

    /// Load every plugin entry. Failures are logged and skipped.
    pub fn load_all(&self, core: Weak<Core>, config: &Config) -> LoadReport {
        let mut report = LoadReport::default();

        for (index, descriptor) in config.descriptors().into_iter().enumerate() {
            let descriptor = match descriptor {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!("Failed to parse plugin entry #{}: {}", index, e);
                    report.failed.push((format!("#{}", index), e));
                    continue;
                }
            };

            let type_name = descriptor.type_name.clone();
            match self.load_plugin(core.clone(), descriptor) {
                Ok(plugin) => report.loaded.push(plugin),
                Err(e) => {
                    tracing::warn!("Failed to load plugin {}: {}", type_name, e);
                    report.failed.push((type_name, e));
                }
            }
        }

        report
    }
}

impl Default for PluginLoader {
    fn default() -> Self {
        Self::new(PluginRegistry::builtin())
    }
}
