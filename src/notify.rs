use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{Event, RoomTypeId};

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for ledger changes per room type.
///
/// Every committed event touching a room type's partition is published here,
/// so a cache in front of search can drop stale availability.
#[derive(Default)]
pub struct NotifyHub {
    channels: DashMap<RoomTypeId, broadcast::Sender<Event>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to changes for a room type. Creates the channel if needed.
    pub fn subscribe(&self, room_type_id: RoomTypeId) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(room_type_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, room_type_id: RoomTypeId, event: &Event) {
        if let Some(sender) = self.channels.get(&room_type_id) {
            let _ = sender.send(event.clone());
        }
    }

    pub fn subscriber_count(&self, room_type_id: RoomTypeId) -> usize {
        self.channels
            .get(&room_type_id)
            .map_or(0, |s| s.receiver_count())
    }
}
