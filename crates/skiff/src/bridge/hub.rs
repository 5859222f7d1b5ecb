//! Fan-out hub for presence and session-list subscribers.
//!
//! Deliberately thin: per-project subscriber lists and a broadcast. The
//! interesting machinery lives in the terminal bridge, not here.

use dashmap::DashMap;
use log::debug;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::session::Session;

/// Per-subscriber send buffer.
const SUBSCRIBER_BUFFER_SIZE: usize = 64;

/// Events fanned out to project subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    /// A user's presence socket joined the project.
    Joined { user_id: String },
    /// A user's presence socket left the project.
    Left { user_id: String },
    /// Current sessions of the project.
    Sessions { sessions: Vec<Session> },
}

/// Subscription handle; dropping the receiver unsubscribes lazily.
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<HubEvent>,
}

/// Hub of project subscribers.
#[derive(Default)]
pub struct Hub {
    subscribers: DashMap<String, Vec<(u64, mpsc::Sender<HubEvent>)>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber for a project's events.
    pub fn subscribe(&self, project_id: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER_SIZE);
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.subscribers
            .entry(project_id.to_string())
            .or_default()
            .push((id, tx));
        debug!("hub: subscriber {id} joined project {project_id}");
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, project_id: &str, id: u64) {
        if let Some(mut subs) = self.subscribers.get_mut(project_id) {
            subs.retain(|(sub_id, _)| *sub_id != id);
        }
        self.subscribers.retain(|_, subs| !subs.is_empty());
        debug!("hub: subscriber {id} left project {project_id}");
    }

    /// Send an event to every subscriber of a project. Closed subscribers
    /// are pruned on the way.
    pub fn broadcast(&self, project_id: &str, event: HubEvent) {
        if let Some(mut subs) = self.subscribers.get_mut(project_id) {
            subs.retain(|(_, tx)| tx.try_send(event.clone()).is_ok() || !tx.is_closed());
        }
    }

    pub fn subscriber_count(&self, project_id: &str) -> usize {
        self.subscribers
            .get(project_id)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_reaches_all_subscribers() {
        let hub = Hub::new();
        let mut a = hub.subscribe("p1");
        let mut b = hub.subscribe("p1");
        let mut other = hub.subscribe("p2");

        hub.broadcast(
            "p1",
            HubEvent::Joined {
                user_id: "alice".to_string(),
            },
        );

        assert!(matches!(a.rx.recv().await, Some(HubEvent::Joined { .. })));
        assert!(matches!(b.rx.recv().await, Some(HubEvent::Joined { .. })));
        assert!(other.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let hub = Hub::new();
        let sub = hub.subscribe("p1");
        assert_eq!(hub.subscriber_count("p1"), 1);
        hub.unsubscribe("p1", sub.id);
        assert_eq!(hub.subscriber_count("p1"), 0);
    }
}
