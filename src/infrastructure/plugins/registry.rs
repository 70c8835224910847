//! Plugin registry - Maps type names to factories

use std::sync::Arc;
use crate::application::errors::ConfigError;
use crate::plugins::trait_def::{Plugin, PluginContext};
use super::keywords::{KeywordSpec, Keywords};

/// Builds a plugin from already-coerced keywords
pub type PluginFactory = fn(PluginContext, &Keywords) -> Result<Arc<dyn Plugin>, ConfigError>;

/// Everything the loader needs to know about one plugin type
#[derive(Clone, Copy)]
pub struct PluginSpec {
    /// Dotted type name used in configuration
    pub type_name: &'static str,
    pub summary: &'static str,
    pub keywords: &'static [KeywordSpec],
    pub factory: PluginFactory,
}

impl PluginSpec {
    /// Last segment of the dotted type name
    pub fn short_name(&self) -> &'static str {
        self.type_name.rsplit('.').next().unwrap_or(self.type_name)
    }
}

impl std::fmt::Debug for PluginSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginSpec")
            .field("type_name", &self.type_name)
            .field("keywords", &self.keywords)
            .finish()
    }
}

/// Registry of known plugin types, in registration order
#[derive(Debug, Default)]
pub struct PluginRegistry {
    specs: Vec<PluginSpec>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the bundled plugins
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for spec in crate::plugins::builtin_specs() {
            if let Err(e) = registry.register(spec) {
                tracing::warn!("Skipping bundled plugin: {}", e);
            }
        }
        registry
    }

    /// Register a plugin type
    pub fn register(&mut self, spec: PluginSpec) -> Result<(), ConfigError> {
        if self.specs.iter().any(|s| s.type_name == spec.type_name) {
            return Err(ConfigError::DuplicateType(spec.type_name.to_string()));
        }
        tracing::debug!("Registering plugin type: {}", spec.type_name);
        self.specs.push(spec);
        Ok(())
    }

    /// Resolve a configured type name.
    ///
    /// Dotted names must match exactly. A bare name resolves when exactly
    /// one registered type ends in that segment.
    pub fn resolve(&self, type_name: &str) -> Result<&PluginSpec, ConfigError> {
        if let Some(spec) = self.specs.iter().find(|s| s.type_name == type_name) {
            return Ok(spec);
        }

        if !type_name.contains('.') {
            let mut candidates = self.specs.iter().filter(|s| s.short_name() == type_name);
            if let (Some(spec), None) = (candidates.next(), candidates.next()) {
                return Ok(spec);
            }
        }

        Err(ConfigError::UnknownType(type_name.to_string()))
    }

    pub fn specs(&self) -> impl Iterator<Item = &PluginSpec> {
        self.specs.iter()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::trait_def::Agent;

    struct Dummy {
        agent: Agent,
    }

    impl Plugin for Dummy {
        fn agent(&self) -> &Agent {
            &self.agent
        }
    }

    fn build(ctx: PluginContext, _kw: &Keywords) -> Result<Arc<dyn Plugin>, ConfigError> {
        Ok(Arc::new(Dummy { agent: Agent::new(&ctx) }))
    }

    fn spec(type_name: &'static str) -> PluginSpec {
        PluginSpec {
            type_name,
            summary: "",
            keywords: &[],
            factory: build,
        }
    }

    #[test]
    fn resolves_dotted_and_bare_names() {
        let mut registry = PluginRegistry::new();
        registry.register(spec("x.Y")).unwrap();
        registry.register(spec("plugins.ops.Status")).unwrap();

        assert_eq!(registry.resolve("x.Y").unwrap().type_name, "x.Y");
        assert_eq!(registry.resolve("Status").unwrap().type_name, "plugins.ops.Status");
    }

    #[test]
    fn unknown_type_is_a_configuration_error() {
        let registry = PluginRegistry::new();
        assert_eq!(
            registry.resolve("nope.Missing").unwrap_err(),
            ConfigError::UnknownType("nope.Missing".into())
        );
    }

    #[test]
    fn ambiguous_bare_name_does_not_resolve() {
        let mut registry = PluginRegistry::new();
        registry.register(spec("a.Status")).unwrap();
        registry.register(spec("b.Status")).unwrap();
        assert!(registry.resolve("Status").is_err());
        // a partial dotted path is not a suffix match
        assert!(registry.resolve("ops.Status").is_err());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = PluginRegistry::new();
        registry.register(spec("x.Y")).unwrap();
        assert_eq!(registry.register(spec("x.Y")).unwrap_err(), ConfigError::DuplicateType("x.Y".into()));
    }

    #[test]
    fn builtin_registry_contains_base_plugin() {
        let registry = PluginRegistry::builtin();
        assert!(registry.resolve("plugin.Plugin").is_ok());
        assert!(registry.resolve("plugins.coinbase.CoinPrice").is_ok());
        assert!(registry.resolve("Tracker").is_ok());
    }
}
