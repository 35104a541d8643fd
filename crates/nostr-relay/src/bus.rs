//! The process-wide event bus: a broadcast channel that never retains a
//! reference to its subscribers beyond the broadcast itself.

use nostr::Event;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 1024;

pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _receiver) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Broadcasts a newly stored event to every live subscriber. Lag or the
    /// absence of any receivers is not an error here.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
