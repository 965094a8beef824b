//! Event fan-out hub
//!
//! A process-wide broker keyed by cluster id. A single loop owns the
//! subscriber registry and services subscribe, unsubscribe and broadcast
//! commands serially, so per-cluster delivery order equals publication
//! order. The command channel is bounded; publishers block when it fills
//! up, which back-pressures the orchestrator instead of growing memory.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::types::Event;

/// Capacity of the hub's command channel
pub const BROADCAST_BUFFER: usize = 256;

/// Per-subscriber delivery buffer; a subscriber that falls this far
/// behind is dropped rather than retained
const SUBSCRIBER_BUFFER: usize = 64;

enum HubCommand {
    Subscribe {
        cluster_id: i64,
        id: u64,
        tx: mpsc::Sender<Event>,
    },
    Unsubscribe {
        id: u64,
    },
    Broadcast {
        cluster_id: i64,
        event: Event,
    },
}

/// Handle to the hub loop; cheap to clone
#[derive(Clone)]
pub struct EventHub {
    tx: mpsc::Sender<HubCommand>,
    next_id: Arc<AtomicU64>,
}

/// A live subscription for one cluster's events.
///
/// Dropping the subscription detaches it from the hub.
pub struct Subscription {
    id: u64,
    pub rx: mpsc::Receiver<Event>,
    hub: EventHub,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.hub.tx.try_send(HubCommand::Unsubscribe { id: self.id });
    }
}

impl EventHub {
    /// Create the hub and spawn its dispatch loop. The loop runs until
    /// every handle (and subscription) has been dropped.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(BROADCAST_BUFFER);
        tokio::spawn(run_loop(rx));

        Self {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Register a new subscriber for a cluster's live events.
    pub async fn subscribe(&self, cluster_id: i64) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);

        let _ = self
            .tx
            .send(HubCommand::Subscribe { cluster_id, id, tx })
            .await;

        Subscription {
            id,
            rx,
            hub: self.clone(),
        }
    }

    /// Remove a subscriber by id.
    pub async fn unsubscribe(&self, id: u64) {
        let _ = self.tx.send(HubCommand::Unsubscribe { id }).await;
    }

    /// Deliver an event to every subscriber of `cluster_id`, in
    /// publication order. Blocks when the command channel is full.
    pub async fn broadcast(&self, cluster_id: i64, event: Event) {
        let _ = self
            .tx
            .send(HubCommand::Broadcast { cluster_id, event })
            .await;
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_loop(mut rx: mpsc::Receiver<HubCommand>) {
    let mut subscribers: HashMap<i64, Vec<(u64, mpsc::Sender<Event>)>> = HashMap::new();

    while let Some(command) = rx.recv().await {
        match command {
            HubCommand::Subscribe { cluster_id, id, tx } => {
                subscribers.entry(cluster_id).or_default().push((id, tx));
                debug!(cluster_id, subscriber = id, "subscriber registered");
            }
            HubCommand::Unsubscribe { id } => {
                for subs in subscribers.values_mut() {
                    subs.retain(|(sid, _)| *sid != id);
                }
                subscribers.retain(|_, subs| !subs.is_empty());
            }
            HubCommand::Broadcast { cluster_id, event } => {
                let Some(subs) = subscribers.get_mut(&cluster_id) else {
                    continue;
                };

                // A failed or overflowed write removes the subscriber;
                // its channel closes when the sender is dropped here.
                subs.retain(|(id, tx)| match tx.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(e) => {
                        debug!(cluster_id, subscriber = *id, "dropping subscriber: {}", e);
                        false
                    }
                });

                if subs.is_empty() {
                    subscribers.remove(&cluster_id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventLevel;

    fn event(cluster_id: i64, id: i64, message: &str) -> Event {
        Event {
            id,
            cluster_id,
            timestamp: id,
            level: EventLevel::Info,
            host: "localhost".to_string(),
            step: "prepare".to_string(),
            message: message.to_string(),
            output: None,
        }
    }

    #[tokio::test]
    async fn test_delivery_preserves_publication_order() {
        let hub = EventHub::new();
        let mut sub = hub.subscribe(1).await;

        for i in 0..20 {
            hub.broadcast(1, event(1, i, &format!("m{}", i))).await;
        }

        for i in 0..20 {
            let received = sub.rx.recv().await.unwrap();
            assert_eq!(received.id, i);
        }
    }

    #[tokio::test]
    async fn test_no_cross_cluster_delivery() {
        let hub = EventHub::new();
        let mut sub_one = hub.subscribe(1).await;
        let mut sub_two = hub.subscribe(2).await;

        hub.broadcast(1, event(1, 1, "for cluster one")).await;
        hub.broadcast(2, event(2, 2, "for cluster two")).await;

        assert_eq!(sub_one.rx.recv().await.unwrap().cluster_id, 1);
        assert_eq!(sub_two.rx.recv().await.unwrap().cluster_id, 2);
        assert!(sub_one.rx.try_recv().is_err());
        assert!(sub_two.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_multiple_subscribers_see_same_sequence() {
        let hub = EventHub::new();
        let mut first = hub.subscribe(7).await;
        let mut second = hub.subscribe(7).await;

        for i in 0..5 {
            hub.broadcast(7, event(7, i, "m")).await;
        }

        for i in 0..5 {
            assert_eq!(first.rx.recv().await.unwrap().id, i);
            assert_eq!(second.rx.recv().await.unwrap().id, i);
        }
    }

    #[tokio::test]
    async fn test_dropped_subscription_detaches() {
        let hub = EventHub::new();
        let sub = hub.subscribe(1).await;
        let id = sub.id();
        drop(sub);

        // must not wedge the hub loop
        hub.unsubscribe(id).await;
        hub.broadcast(1, event(1, 1, "after drop")).await;

        let mut fresh = hub.subscribe(1).await;
        hub.broadcast(1, event(1, 2, "still alive")).await;
        assert_eq!(fresh.rx.recv().await.unwrap().id, 2);
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_dropped_not_retained() {
        let hub = EventHub::new();
        let mut sub = hub.subscribe(1).await;

        // overflow the per-subscriber buffer without draining it
        for i in 0..(SUBSCRIBER_BUFFER as i64 + 8) {
            hub.broadcast(1, event(1, i, "flood")).await;
        }

        // drain whatever was buffered; the channel must be closed after
        let mut received = 0;
        while sub.rx.recv().await.is_some() {
            received += 1;
        }
        assert!(received <= SUBSCRIBER_BUFFER as i64 + 1);
    }
}
