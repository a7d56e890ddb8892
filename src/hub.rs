//! Overlay subscriber fan-out.
//!
//! Each subscriber gets a bounded queue. Delivery is best-effort and in
//! order; when a queue is full, advisory events (`update`, `timer_update`)
//! are dropped for that subscriber, while a subscriber too slow to take a
//! critical event (`phase_change`, `fight_ended`, `game_reset`, ...) is
//! disconnected rather than handed a stream with holes in it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::events::ServerEvent;
use crate::state::GameSnapshot;

const SUBSCRIBER_QUEUE_DEPTH: usize = 256;

pub struct Hub {
    published: Arc<ArcSwap<GameSnapshot>>,
    inner: Mutex<HubInner>,
}

struct HubInner {
    next_id: u64,
    subscribers: HashMap<u64, mpsc::Sender<ServerEvent>>,
}

impl Hub {
    pub fn new(published: Arc<ArcSwap<GameSnapshot>>) -> Arc<Self> {
        Arc::new(Self {
            published,
            inner: Mutex::new(HubInner {
                next_id: 0,
                subscribers: HashMap::new(),
            }),
        })
    }

    /// Register a subscriber. Its first queued message is a full snapshot.
    /// Writers store the snapshot before broadcasting the matching event, and
    /// registration and broadcasts serialize on the hub lock, so the snapshot
    /// read here is at least as fresh as any event this queue has missed: a
    /// join may see a duplicate event, never a gap.
    pub fn subscribe(&self) -> (u64, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        let mut inner = self.inner.lock().expect("hub lock");
        let snapshot = self.published.load_full();
        // a fresh queue always has room for the snapshot
        let _ = tx.try_send(ServerEvent::State(snapshot.as_ref().clone()));
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.insert(id, tx);
        debug!(subscriber = id, total = inner.subscribers.len(), "subscriber joined");
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        let mut inner = self.inner.lock().expect("hub lock");
        if inner.subscribers.remove(&id).is_some() {
            debug!(subscriber = id, total = inner.subscribers.len(), "subscriber left");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().expect("hub lock").subscribers.len()
    }

    /// Fan an event out to every subscriber without ever blocking the caller.
    pub fn broadcast(&self, event: ServerEvent) {
        let mut inner = self.inner.lock().expect("hub lock");
        let mut dead = Vec::new();
        for (id, tx) in inner.subscribers.iter() {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(ev)) => {
                    if ev.is_droppable() {
                        // coalescing: the next update supersedes this one
                        continue;
                    }
                    warn!(subscriber = id, "queue full on critical event, dropping subscriber");
                    dead.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*id),
            }
        }
        for id in dead {
            inner.subscribers.remove(&id);
        }
    }

    /// Deliver an event to a single subscriber (admin replies).
    pub fn send_to(&self, id: u64, event: ServerEvent) {
        let inner = self.inner.lock().expect("hub lock");
        if let Some(tx) = inner.subscribers.get(&id) {
            let _ = tx.try_send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{GameResetPayload, TimerPayload};
    use crate::state::{GameState, Phase};

    fn new_hub() -> Arc<Hub> {
        let snapshot = GameState::new(100).snapshot(false, 0);
        Hub::new(Arc::new(ArcSwap::from_pointee(snapshot)))
    }

    #[tokio::test]
    async fn first_message_is_snapshot() {
        let hub = new_hub();
        let (_id, mut rx) = hub.subscribe();
        match rx.recv().await {
            Some(ServerEvent::State(snap)) => assert_eq!(snap.phase, Phase::Idle),
            other => panic!("expected snapshot first, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_all_subscribers() {
        let hub = new_hub();
        let (_a, mut rx_a) = hub.subscribe();
        let (_b, mut rx_b) = hub.subscribe();
        hub.broadcast(ServerEvent::ConnectionStatus { connected: true });
        let _ = rx_a.recv().await; // snapshots
        let _ = rx_b.recv().await;
        assert!(matches!(
            rx_a.recv().await,
            Some(ServerEvent::ConnectionStatus { connected: true })
        ));
        assert!(matches!(
            rx_b.recv().await,
            Some(ServerEvent::ConnectionStatus { connected: true })
        ));
    }

    #[tokio::test]
    async fn slow_subscriber_loses_timer_updates_but_not_membership() {
        let hub = new_hub();
        let (id, mut rx) = hub.subscribe();
        for i in 0..SUBSCRIBER_QUEUE_DEPTH * 2 {
            hub.broadcast(ServerEvent::TimerUpdate(TimerPayload {
                phase: Phase::Betting,
                time_remaining_ms: i as u64,
            }));
        }
        assert_eq!(hub.subscriber_count(), 1);
        // queue drains fine afterwards
        hub.unsubscribe(id);
        let _ = rx.recv().await;
    }

    #[tokio::test]
    async fn slow_subscriber_is_cut_on_critical_event() {
        let hub = new_hub();
        let (_id, _rx) = hub.subscribe();
        // fill the queue with droppable noise, then hit it with a critical event
        for _ in 0..SUBSCRIBER_QUEUE_DEPTH + 8 {
            hub.broadcast(ServerEvent::TimerUpdate(TimerPayload {
                phase: Phase::Betting,
                time_remaining_ms: 0,
            }));
        }
        hub.broadcast(ServerEvent::GameReset(GameResetPayload { round_id: 1 }));
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_removes() {
        let hub = new_hub();
        let (id, _rx) = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 1);
        hub.unsubscribe(id);
        assert_eq!(hub.subscriber_count(), 0);
    }
}
