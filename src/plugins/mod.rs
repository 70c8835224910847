//! Plugin system for hesperus
//!
//! Provides the plugin traits and the plugins bundled with the bot

pub mod base;
pub mod coinbase;
pub mod trait_def;
pub mod tracker;

pub use trait_def::{Agent, Persistent, Plugin, PluginContext, PollStep, PollTask, Poller};

use crate::infrastructure::plugins::PluginSpec;

/// Every plugin type shipped with the bot, in registration order
pub fn builtin_specs() -> Vec<PluginSpec> {
    vec![base::SPEC, coinbase::SPEC, tracker::SPEC]
}
