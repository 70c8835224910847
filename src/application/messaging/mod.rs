//! Message handling - Command dispatch and replies

pub mod dispatcher;
pub mod reply;

pub use dispatcher::{CommandContext, CommandHandler, CommandTable};
pub use reply::Reply;
