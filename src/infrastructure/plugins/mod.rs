//! Plugin loading for hesperus
//! 
//! Plugin types are registered by name with a static keyword table and a
//! factory. The loader resolves configured type names, coerces keywords,
//! builds the plugin and subscribes it to its channels.

pub mod keywords;
pub mod loader;
pub mod registry;

pub use keywords::{Keyword, KeywordKind, KeywordSpec, Keywords};
pub use loader::{LoadReport, PluginLoader};
pub use registry::{PluginFactory, PluginRegistry, PluginSpec};
