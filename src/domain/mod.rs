//! Domain layer - Core business objects and collaborator contracts
//! 
//! This layer contains:
//! - Entities: Messages flowing in and out of the core
//! - Traits: Abstractions for infrastructure (Transport)

pub mod entities;
pub mod traits;
