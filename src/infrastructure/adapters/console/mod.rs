//! Console adapter for development/testing

use async_trait::async_trait;
use std::sync::{Mutex, PoisonError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use crate::application::errors::BotError;
use crate::domain::entities::Incoming;
use crate::domain::traits::Transport;

/// Reads stdin lines into one channel and prints outgoing text.
///
/// Lines starting with the directed prefix (e.g. `hesperus: track 1Z`) are
/// marked as addressed to the bot, with the prefix stripped.
pub struct ConsoleTransport {
    channel: String,
    author: String,
    directed_prefix: Option<String>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ConsoleTransport {
    pub fn new(channel: impl Into<String>, directed_prefix: Option<String>) -> Self {
        Self {
            channel: channel.into(),
            author: "console".to_string(),
            directed_prefix: directed_prefix.filter(|p| !p.is_empty()),
            reader: Mutex::new(None),
        }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    /// Turn one input line into a message. Blank lines yield nothing.
    pub fn parse_line(&self, line: &str) -> Option<Incoming> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let (text, directed) = match &self.directed_prefix {
            Some(prefix) if line.len() >= prefix.len()
                && line.is_char_boundary(prefix.len())
                && line[..prefix.len()].eq_ignore_ascii_case(prefix) =>
            {
                (line[prefix.len()..].trim(), true)
            }
            _ => (line, false),
        };
        Some(Incoming::new(&self.channel, text, &self.author, directed))
    }
}

#[async_trait]
impl Transport for ConsoleTransport {
    async fn start(&self, inbound: mpsc::UnboundedSender<Incoming>) -> Result<(), BotError> {
        tracing::info!("Starting console transport on channel {}", self.channel);

        let parser = ConsoleTransport {
            channel: self.channel.clone(),
            author: self.author.clone(),
            directed_prefix: self.directed_prefix.clone(),
            reader: Mutex::new(None),
        };
        let handle = tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(incoming) = parser.parse_line(&line) {
                            if inbound.send(incoming).is_err() {
                                break;
                            }
                        }
                    }
                    Ok(None) => {
                        tracing::info!("Console input closed");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("Failed to read console input: {}", e);
                        break;
                    }
                }
            }
        });

        *self.reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    async fn send_message(&self, channel: &str, text: &str) -> Result<(), BotError> {
        println!("[{}] {}", channel, text);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BotError> {
        if let Some(handle) = self.reader.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
        tracing::info!("Console transport disconnected");
        Ok(())
    }

    fn name(&self) -> &str {
        "console"
    }
}
