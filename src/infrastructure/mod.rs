//! Infrastructure layer - External concerns
//! 
//! This layer contains:
//! - Config: Configuration loading
//! - Storage: Plugin state persistence
//! - Plugins: Plugin registry and loader
//! - Adapters: Transports (console)

pub mod config;
pub mod storage;
pub mod plugins;
pub mod adapters;
