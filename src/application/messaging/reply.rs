//! Reply handle - sends text back to where a message came from

use tokio::sync::mpsc;
use crate::domain::entities::Outgoing;

/// Reply callback bound to the originating channel of one message.
///
/// A handler may call [`send`](Self::send) any number of times, including
/// not at all. Each call queues one message, in call order.
#[derive(Debug, Clone)]
pub struct Reply {
    destination: String,
    outbox: mpsc::UnboundedSender<Outgoing>,
}

impl Reply {
    pub fn new(destination: impl Into<String>, outbox: mpsc::UnboundedSender<Outgoing>) -> Self {
        Self {
            destination: destination.into(),
            outbox,
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Queue a reply. Delivery is best-effort.
    pub fn send(&self, text: impl Into<String>) {
        let out = Outgoing::new(self.destination.clone(), text);
        if self.outbox.send(out).is_err() {
            tracing::warn!("[{}] Outbox closed, reply dropped", self.destination);
        }
    }
}
