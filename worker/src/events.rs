// State-change event fan-out. The sync engine publishes here; delivery to
// billing/account consumers is an external concern behind the channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uplink_shared::SessionState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChangeEvent {
    pub subject_id: String,
    pub previous: SessionState,
    pub current: SessionState,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<StateChangeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1000);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChangeEvent> {
        self.sender.subscribe()
    }

    /// Publishing with no subscribers is not an error; the event is dropped.
    pub fn publish(&self, event: StateChangeEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
