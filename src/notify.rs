use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Signal, Write};

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for row changes (keyed by row id) and outbound signals.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Write>>,
    signals: broadcast::Sender<Signal>,
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
            signals: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to changes of one session, hold, booking or PO.
    pub fn subscribe(&self, row_id: Ulid) -> broadcast::Receiver<Write> {
        let sender = self
            .channels
            .entry(row_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, row_id: Ulid, write: &Write) {
        if let Some(sender) = self.channels.get(&row_id) {
            let _ = sender.send(write.clone());
        }
    }

    pub fn remove(&self, row_id: &Ulid) {
        self.channels.remove(row_id);
    }

    pub fn subscribe_signals(&self) -> broadcast::Receiver<Signal> {
        self.signals.subscribe()
    }

    pub fn signal(&self, signal: Signal) {
        let _ = self.signals.send(signal);
    }
}
