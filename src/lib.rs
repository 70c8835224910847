//! hesperus - A plugin-driven chat bot
//!
//! Plugins are declared in a YAML configuration file, subscribed to named
//! channels and driven by a single [`Core`](application::services::Core)
//! that routes messages, runs background polls and flushes plugin state.

pub mod domain;
pub mod application;
pub mod infrastructure;
pub mod plugins;
