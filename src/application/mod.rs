//! Application layer - Runtime and business logic
//! 
//! This layer contains:
//! - Services: The core router and the poll scheduler
//! - Messaging: Command dispatch and replies
//! - Errors: Domain-specific errors

pub mod errors;
pub mod services;
pub mod messaging;
