//! Application services - The plugin host and the poll scheduler

pub mod core;
pub mod scheduler;

pub use self::core::Core;
pub use scheduler::{PollScheduler, TickReport};
