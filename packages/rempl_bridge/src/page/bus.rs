use rempl_protocol::WindowMessage;
use tokio::sync::broadcast;
use tracing::trace;

use crate::config::PageConfig;

/// The page's shared message space: every context on the page sees every
/// message and filters by address.
#[derive(Clone)]
pub struct PageBus {
    tx: broadcast::Sender<WindowMessage>,
}

impl PageBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// A bus holding up to `bus_capacity` unread messages per listener.
    pub fn from_config(config: &PageConfig) -> Self {
        Self::new(config.bus_capacity)
    }

    /// Broadcast `msg`. Returns how many listeners received it.
    pub fn post(&self, msg: WindowMessage) -> usize {
        trace!(from = %msg.from, to = %msg.to, "page post");
        self.tx.send(msg).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WindowMessage> {
        self.tx.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
