//! Typed lifecycle event channel.
//!
//! Backed by a `tokio::sync::broadcast` ring: emitters never block, and a
//! subscriber that falls more than `capacity` events behind loses the oldest
//! ones (drop-oldest). Emitting with no subscribers is not an error.

use plugdock_types::PluginEvent;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

/// Fan-out bus for [`PluginEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PluginEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: PluginEvent) {
        debug!(plugin_id = %event.plugin_id, kind = %event.kind, "Event");
        // Err only means nobody is listening.
        let _ = self.tx.send(event);
    }

    /// Every event from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PluginEvent> {
        self.tx.subscribe()
    }

    /// Events for a single plugin.
    pub fn subscribe_plugin(&self, plugin_id: impl Into<String>) -> PluginSubscription {
        PluginSubscription {
            plugin_id: plugin_id.into(),
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// A subscription filtered to one plugin id.
#[derive(Debug)]
pub struct PluginSubscription {
    plugin_id: String,
    rx: broadcast::Receiver<PluginEvent>,
}

impl PluginSubscription {
    /// Next event for this plugin, or `None` once the bus is gone.
    /// Lag is logged and skipped past.
    pub async fn recv(&mut self) -> Option<PluginEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.plugin_id == self.plugin_id => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(plugin_id = %self.plugin_id, skipped, "Event subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }
}
