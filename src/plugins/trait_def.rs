//! Plugin trait definitions
//!
//! Every plugin embeds an [`Agent`], which owns its channel subscriptions and
//! its logging surface. Optional capabilities (polling, persistence) are
//! separate traits a plugin exposes through the accessor methods on
//! [`Plugin`]; command dispatch lives in
//! [`CommandTable`](crate::application::messaging::CommandTable).

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use crate::application::errors::{PluginError, StorageError};
use crate::application::messaging::Reply;
use crate::application::services::Core;
use crate::domain::entities::Incoming;

/// Handed to plugin factories at construction time
#[derive(Clone)]
pub struct PluginContext {
    /// Registered type name of the plugin being built
    pub type_name: &'static str,
    /// Back-reference to the owning core, never ownership
    pub core: Weak<Core>,
}

impl PluginContext {
    pub fn new(type_name: &'static str, core: Weak<Core>) -> Self {
        Self { type_name, core }
    }

    /// Context with no core attached, for plugins driven directly in tests
    pub fn detached(type_name: &'static str) -> Self {
        Self::new(type_name, Weak::new())
    }
}

/// Base concurrency unit shared by every plugin.
///
/// The channel list is the only plugin state the core guarantees is safe to
/// touch from both the routing and the scheduling context.
pub struct Agent {
    kind: &'static str,
    channels: Mutex<Vec<String>>,
    core: Weak<Core>,
}

impl Agent {
    pub fn new(ctx: &PluginContext) -> Self {
        Self {
            kind: ctx.type_name,
            channels: Mutex::new(Vec::new()),
            core: ctx.core.clone(),
        }
    }

    /// Registered type name of the owning plugin
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    fn lock_channels(&self) -> MutexGuard<'_, Vec<String>> {
        // a Vec<String> cannot be left half-updated by a panicking holder
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to a channel. Subscribing twice is a no-op.
    pub fn subscribe(&self, channel: &str) {
        let mut channels = self.lock_channels();
        if !channels.iter().any(|c| c == channel) {
            channels.push(channel.to_string());
        }
    }

    /// Unsubscribe from a channel, no error if not subscribed
    pub fn unsubscribe(&self, channel: &str) {
        self.lock_channels().retain(|c| c != channel);
    }

    pub fn unsubscribe_all(&self) {
        self.lock_channels().clear();
    }

    /// Snapshot of the subscribed channels, in subscription order
    pub fn channels(&self) -> Vec<String> {
        self.lock_channels().clone()
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.lock_channels().iter().any(|c| c == channel)
    }

    /// Owning core, if it is still alive
    pub fn core(&self) -> Option<Arc<Core>> {
        self.core.upgrade()
    }

    /// Send non-directed text to a channel
    pub fn send_outgoing(&self, channel: &str, text: &str) {
        match self.core.upgrade() {
            Some(core) => core.send_outgoing(channel, text),
            None => self.debug(format_args!("no core attached, dropping [{}] {}", channel, text)),
        }
    }

    /// Send text to every subscribed channel
    pub fn broadcast(&self, text: &str) {
        for channel in self.channels() {
            self.send_outgoing(&channel, text);
        }
    }

    pub fn debug(&self, msg: impl fmt::Display) {
        tracing::debug!(plugin = self.kind, "{}", msg);
    }

    pub fn info(&self, msg: impl fmt::Display) {
        tracing::info!(plugin = self.kind, "{}", msg);
    }

    pub fn warn(&self, msg: impl fmt::Display) {
        tracing::warn!(plugin = self.kind, "{}", msg);
    }

    pub fn error(&self, msg: impl fmt::Display) {
        tracing::error!(plugin = self.kind, "{}", msg);
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("kind", &self.kind)
            .field("channels", &self.channels())
            .finish()
    }
}

/// Core plugin trait that all plugins must implement
pub trait Plugin: Send + Sync + 'static {
    fn agent(&self) -> &Agent;

    fn name(&self) -> &str {
        self.agent().kind()
    }

    /// Handle a message routed to one of this plugin's channels.
    ///
    /// `reply` sends back to the channel the message came from. Errors are
    /// caught and logged by the core; they never reach other plugins.
    fn handle_incoming(&self, incoming: &Incoming, _reply: &Reply) -> Result<(), PluginError> {
        self.agent().debug(format_args!(
            "incoming {:?} from {} (directed: {}): {}",
            incoming.channels, incoming.author, incoming.directed, incoming.text
        ));
        Ok(())
    }

    /// Polling capability, if this plugin has one
    fn poller(self: Arc<Self>) -> Option<Arc<dyn Poller>> {
        None
    }

    /// Persistence capability, if this plugin has one
    fn persistence(&self) -> Option<&dyn Persistent> {
        None
    }
}

/// Outcome of one resumed step of a poll task
pub type PollStep = Result<(), PluginError>;

/// A resumable poll task.
///
/// Each call to `next()` runs the task up to its next cooperative yield
/// point; `None` means the task completed. An `Err` aborts the tick.
pub type PollTask = Box<dyn Iterator<Item = PollStep> + Send>;

/// Periodic background work
pub trait Poller: Send + Sync {
    /// Start a fresh poll task for one tick
    fn poll(self: Arc<Self>) -> PollTask;

    /// Delay between the end of one tick and the start of the next.
    /// Re-evaluated after every tick.
    fn poll_interval(&self) -> Duration;
}

/// JSON state tied to a file
pub trait Persistent: Send + Sync {
    /// Reload state from disk. Missing or unreadable files yield empty state.
    fn load_data(&self);

    /// Write the full state to disk
    fn save_data(&self) -> Result<(), StorageError>;
}

/// Poll task that completes immediately
pub fn idle_task() -> PollTask {
    Box::new(std::iter::empty())
}
