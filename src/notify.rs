use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for allocation changes, one channel per host.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a host's changes. Creates the channel if needed.
    pub fn subscribe(&self, host_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(host_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening; channels whose
    /// receivers have all gone are dropped.
    pub fn send(&self, host_id: Ulid, event: &Event) {
        let orphaned = match self.channels.get(&host_id) {
            Some(sender) => sender.send(event.clone()).is_err(),
            None => false,
        };
        if orphaned {
            self.channels
                .remove_if(&host_id, |_, sender| sender.receiver_count() == 0);
        }
    }
}
