//! Command dispatcher - Routes message text to regex-matched handlers
//!
//! Each plugin type owns one [`CommandTable`], built once and shared by all
//! of its instances. Patterns are anchored at both ends and tested against
//! the trimmed message text in registration order; the first match wins.

use regex_lite::{Captures, Regex};
use crate::application::errors::{ConfigError, PluginError};
use crate::domain::entities::Incoming;
use super::reply::Reply;

/// What a command handler gets to see about the triggering message
pub struct CommandContext<'a> {
    /// Channels the author belongs to for this message
    pub channels: &'a [String],
    pub author: &'a str,
    pub directed: bool,
    pub reply: &'a Reply,
}

impl CommandContext<'_> {
    pub fn is_on(&self, channel: &str) -> bool {
        self.channels.iter().any(|c| c == channel)
    }
}

/// Handler function type
pub type CommandHandler<P> =
    fn(&P, &CommandContext<'_>, &Captures<'_>) -> Result<(), PluginError>;

struct Command<P> {
    pattern: String,
    regex: Regex,
    handler: CommandHandler<P>,
}

/// Ordered (pattern, handler) table for plugin type `P`
pub struct CommandTable<P> {
    commands: Vec<Command<P>>,
    invalid: Vec<ConfigError>,
}

impl<P> CommandTable<P> {
    pub fn new() -> Self {
        Self {
            commands: Vec::new(),
            invalid: Vec::new(),
        }
    }

    /// Register a command. Earlier registrations take precedence.
    ///
    /// A pattern that fails to compile is remembered and reported by
    /// [`validate`](Self::validate), so a broken table surfaces as a load
    /// error instead of a panic.
    pub fn command(mut self, pattern: &str, handler: CommandHandler<P>) -> Self {
        match Regex::new(&format!(r"^(?:{})$", pattern)) {
            Ok(regex) => self.commands.push(Command {
                pattern: pattern.to_string(),
                regex,
                handler,
            }),
            Err(e) => self.invalid.push(ConfigError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            }),
        }
        self
    }

    /// Fails with the first pattern that did not compile
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.invalid.first() {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.commands.iter().map(|c| c.pattern.as_str())
    }

    /// Index and captures of the first command matching `text`
    pub fn find<'t>(&self, text: &'t str) -> Option<(usize, Captures<'t>)> {
        let text = text.trim();
        self.commands
            .iter()
            .enumerate()
            .find_map(|(i, c)| c.regex.captures(text).map(|caps| (i, caps)))
    }

    /// Run the first matching handler. Returns whether anything matched.
    pub fn dispatch(&self, plugin: &P, incoming: &Incoming, reply: &Reply) -> Result<bool, PluginError> {
        let Some((index, caps)) = self.find(&incoming.text) else {
            return Ok(false);
        };
        let command = &self.commands[index];
        tracing::debug!("[{}] {} matched /{}/", incoming.origin(), incoming.author, command.pattern);

        let ctx = CommandContext {
            channels: &incoming.channels,
            author: &incoming.author,
            directed: incoming.directed,
            reply,
        };
        (command.handler)(plugin, &ctx, &caps)?;
        Ok(true)
    }
}

impl<P> Default for CommandTable<P> {
    fn default() -> Self {
        Self::new()
    }
}
