use chrono::{DateTime, Utc};

/// A message received from the transport, ready for routing
#[derive(Debug, Clone)]
pub struct Incoming {
    pub id: String,
    /// Channels the message arrived on. The first one is where replies go.
    pub channels: Vec<String>,
    pub author: String,
    pub text: String,
    /// True when the message was explicitly addressed to the bot
    pub directed: bool,
    pub timestamp: DateTime<Utc>,
}

impl Incoming {
    pub fn new(
        channel: impl Into<String>,
        text: impl Into<String>,
        author: impl Into<String>,
        directed: bool,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            channels: vec![channel.into()],
            author: author.into(),
            text: text.into(),
            directed,
            timestamp: Utc::now(),
        }
    }

    /// Add a further channel the author is known to belong to
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        let channel = channel.into();
        if !self.channels.contains(&channel) {
            self.channels.push(channel);
        }
        self
    }

    /// Channel the message originated from
    pub fn origin(&self) -> &str {
        self.channels.first().map(String::as_str).unwrap_or_default()
    }

    pub fn is_on(&self, channel: &str) -> bool {
        self.channels.iter().any(|c| c == channel)
    }
}

/// A message on its way out to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub channel: String,
    pub text: String,
}

impl Outgoing {
    pub fn new(channel: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            text: text.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extra_channels_are_not_duplicated() {
        let msg = Incoming::new("ops", "status", "alice", true)
            .with_channel("admin")
            .with_channel("ops");
        assert_eq!(msg.channels, vec!["ops", "admin"]);
        assert_eq!(msg.origin(), "ops");
        assert!(msg.is_on("admin"));
    }
}
