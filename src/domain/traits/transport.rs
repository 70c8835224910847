use async_trait::async_trait;
use tokio::sync::mpsc;
use crate::domain::entities::Incoming;
use crate::application::errors::BotError;

/// Transport trait - abstraction for chat frontends (IRC, console, ...)
///
/// The transport pushes every message it receives into `inbound`; the core
/// routes them to subscribed plugins and calls back into `send_message` for
/// everything plugins emit.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect and begin forwarding incoming messages
    async fn start(&self, inbound: mpsc::UnboundedSender<Incoming>) -> Result<(), BotError>;

    /// Send text to a channel
    async fn send_message(&self, channel: &str, text: &str) -> Result<(), BotError>;

    /// Disconnect from the frontend
    async fn disconnect(&self) -> Result<(), BotError>;

    /// Human-readable transport name for logs
    fn name(&self) -> &str;
}
