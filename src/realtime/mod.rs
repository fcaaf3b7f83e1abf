//! Realtime event emitter (§4.9): one bounded mpsc channel per user in a
//! `DashMap` registry, `try_send` so a slow or absent listener never blocks
//! the emitting caller. The SSE/websocket transport that actually drains
//! these channels is an external collaborator; this module only owns the
//! registry and the event shape.

use dashmap::DashMap;
use tokio::sync::mpsc::{self, Receiver, Sender};
use uuid::Uuid;

use crate::models::RealtimeEvent;

const CHANNEL_CAPACITY: usize = 256;

pub struct RealtimeEmitter {
    channels: DashMap<Uuid, Sender<RealtimeEvent>>,
}

impl Default for RealtimeEmitter {
    fn default() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }
}

impl RealtimeEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener for `user_id`, replacing any previous one (a
    /// reconnect supersedes the stale channel rather than stacking on it).
    pub fn subscribe(&self, user_id: Uuid) -> Receiver<RealtimeEvent> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.channels.insert(user_id, tx);
        rx
    }

    pub fn unsubscribe(&self, user_id: Uuid) {
        self.channels.remove(&user_id);
    }

    /// Best-effort, non-blocking. Silently drops the event if there is no
    /// listener or its channel is full — ordering per-user is preserved by
    /// the channel itself, but delivery is not guaranteed.
    pub fn push(&self, user_id: Uuid, event: RealtimeEvent) {
        if let Some(tx) = self.channels.get(&user_id) {
            if tx.try_send(event).is_err() {
                log::debug!("realtime channel for {user_id} full or closed, dropping event");
            }
        }
    }

    pub fn listener_count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RealtimeEventType;
    use serde_json::json;

    #[tokio::test]
    async fn push_without_subscriber_is_a_noop() {
        let emitter = RealtimeEmitter::new();
        emitter.push(
            Uuid::new_v4(),
            RealtimeEvent::new(RealtimeEventType::SyncStarted, json!({})),
        );
    }

    #[tokio::test]
    async fn subscriber_receives_pushed_events_in_order() {
        let emitter = RealtimeEmitter::new();
        let user = Uuid::new_v4();
        let mut rx = emitter.subscribe(user);

        emitter.push(user, RealtimeEvent::new(RealtimeEventType::SyncStarted, json!({"n": 1})));
        emitter.push(user, RealtimeEvent::new(RealtimeEventType::SyncProgress, json!({"n": 2})));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.data["n"], 1);
        assert_eq!(second.data["n"], 2);
    }

    #[tokio::test]
    async fn resubscribe_replaces_previous_channel() {
        let emitter = RealtimeEmitter::new();
        let user = Uuid::new_v4();
        let _old_rx = emitter.subscribe(user);
        let mut new_rx = emitter.subscribe(user);

        emitter.push(user, RealtimeEvent::new(RealtimeEventType::SyncStarted, json!({})));
        assert!(new_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn unsubscribe_drops_the_channel() {
        let emitter = RealtimeEmitter::new();
        let user = Uuid::new_v4();
        let _rx = emitter.subscribe(user);
        assert_eq!(emitter.listener_count(), 1);
        emitter.unsubscribe(user);
        assert_eq!(emitter.listener_count(), 0);
    }
}
