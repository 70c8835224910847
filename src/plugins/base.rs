//! Passive base plugin

use std::sync::Arc;
use crate::application::errors::ConfigError;
use crate::infrastructure::plugins::{Keywords, PluginSpec};
use super::trait_def::{Agent, Plugin, PluginContext};

pub const SPEC: PluginSpec = PluginSpec {
    type_name: "plugin.Plugin",
    summary: "Logs every message it sees and does nothing else",
    keywords: &[],
    factory: build,
};

/// Subscribes to its channels and logs what arrives
pub struct BasePlugin {
    agent: Agent,
}

impl BasePlugin {
    pub fn new(ctx: &PluginContext) -> Self {
        Self { agent: Agent::new(ctx) }
    }
}

impl Plugin for BasePlugin {
    fn agent(&self) -> &Agent {
        &self.agent
    }
}

fn build(ctx: PluginContext, _keywords: &Keywords) -> Result<Arc<dyn Plugin>, ConfigError> {
    Ok(Arc::new(BasePlugin::new(&ctx)))
}
