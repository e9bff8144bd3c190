//! The in-process switchboard connecting memory brokers.

use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use bytes::Bytes;
use courier_broker::message::{Headers, Message};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

/// Reply slot shared by every delivery of one request. The first reply
/// takes the sender; later replies are dropped.
pub(crate) type ReplySlot = Arc<Mutex<Option<oneshot::Sender<Message>>>>;

/// Identifier of one registered subscription target.
pub(crate) type TargetId = u64;

/// One message as handed to a subscription's delivery channel.
#[derive(Debug)]
pub(crate) struct Inbound {
    pub headers: Headers,
    pub payload: Bytes,
    pub reply: Option<ReplySlot>,
}

#[derive(Debug)]
struct Target {
    id: TargetId,
    queue: Option<String>,
    sender: mpsc::Sender<Inbound>,
}

#[derive(Debug, Default)]
struct TopicState {
    targets: Vec<Target>,
    /// Round-robin cursor per queue group.
    cursors: HashMap<String, usize>,
}

#[derive(Default)]
struct HubInner {
    topics: Mutex<HashMap<String, TopicState>>,
    next_id: AtomicU64,
    attached: AtomicUsize,
}

/// In-process message switchboard.
///
/// Brokers attached to the same hub exchange messages; separate hubs are
/// fully isolated, so parallel tests never share state. Cloning a hub
/// clones a handle to the same switchboard.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl Debug for MemoryHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryHub")
            .field("topics", &self.inner.topics.lock().len())
            .field("attached", &self.inner.attached.load(Ordering::SeqCst))
            .finish()
    }
}

impl MemoryHub {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of brokers currently attached.
    #[must_use]
    pub fn attached(&self) -> usize {
        self.inner.attached.load(Ordering::SeqCst)
    }

    /// Number of live subscriptions on `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .lock()
            .get(topic)
            .map_or(0, |state| state.targets.len())
    }

    pub(crate) fn attach(&self) {
        self.inner.attached.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn detach(&self) {
        self.inner.attached.fetch_sub(1, Ordering::SeqCst);
    }

    /// Registers a delivery channel for `topic` and returns its identifier
    /// and receiving end. Capacities below one are raised to one.
    pub(crate) fn subscribe(
        &self,
        topic: &str,
        queue: Option<String>,
        capacity: usize,
    ) -> (TargetId, mpsc::Receiver<Inbound>) {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        // mpsc::channel panics when capacity is zero.
        let (sender, receiver) = mpsc::channel(capacity.max(1));

        let mut topics = self.inner.topics.lock();
        topics
            .entry(topic.to_string())
            .or_default()
            .targets
            .push(Target { id, queue, sender });

        (id, receiver)
    }

    /// Drops the delivery channel registered under `id`.
    pub(crate) fn unsubscribe(&self, topic: &str, id: TargetId) {
        let mut topics = self.inner.topics.lock();
        if let Some(state) = topics.get_mut(topic) {
            state.targets.retain(|target| target.id != id);
            if state.targets.is_empty() {
                topics.remove(topic);
            }
        }
    }

    /// Routes one message to `topic`, returning the number of deliveries.
    ///
    /// Every ungrouped subscription receives a copy; each queue group
    /// receives exactly one copy, rotated round-robin across its members.
    /// Senders are collected under the lock and used after it is released.
    pub(crate) fn publish(
        &self,
        topic: &str,
        headers: &Headers,
        payload: &Bytes,
        reply: Option<&ReplySlot>,
    ) -> usize {
        let selected: Vec<mpsc::Sender<Inbound>> = {
            let mut topics = self.inner.topics.lock();
            let Some(state) = topics.get_mut(topic) else {
                return 0;
            };

            state.targets.retain(|target| !target.sender.is_closed());
            if state.targets.is_empty() {
                topics.remove(topic);
                return 0;
            }

            let mut selected = Vec::new();
            let mut groups: HashMap<&str, Vec<&Target>> = HashMap::new();
            for target in &state.targets {
                match &target.queue {
                    Some(group) => groups.entry(group.as_str()).or_default().push(target),
                    None => selected.push(target.sender.clone()),
                }
            }

            let mut cursor_updates = Vec::new();
            for (group, members) in groups {
                let cursor = state.cursors.get(group).copied().unwrap_or_default();
                selected.push(members[cursor % members.len()].sender.clone());
                cursor_updates.push((group.to_string(), cursor.wrapping_add(1)));
            }
            for (group, cursor) in cursor_updates {
                state.cursors.insert(group, cursor);
            }

            selected
        };

        let mut delivered = 0;
        for sender in selected {
            let inbound = Inbound {
                headers: headers.clone(),
                payload: payload.clone(),
                reply: reply.cloned(),
            };
            match sender.try_send(inbound) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(topic, "dropping delivery; subscription channel is full");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }

        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_to_unknown_topic_delivers_nothing() {
        let hub = MemoryHub::new();

        let delivered = hub.publish("nowhere", &Headers::new(), &Bytes::from_static(b"x"), None);

        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn ungrouped_targets_each_receive_a_copy() {
        let hub = MemoryHub::new();
        let (_, mut first) = hub.subscribe("orders", None, 8);
        let (_, mut second) = hub.subscribe("orders", None, 8);

        let delivered = hub.publish("orders", &Headers::new(), &Bytes::from_static(b"x"), None);

        assert_eq!(delivered, 2);
        assert!(first.try_recv().is_ok());
        assert!(second.try_recv().is_ok());
    }

    #[tokio::test]
    async fn queue_group_rotates_round_robin() {
        let hub = MemoryHub::new();
        let (_, mut first) = hub.subscribe("orders", Some("workers".to_string()), 8);
        let (_, mut second) = hub.subscribe("orders", Some("workers".to_string()), 8);

        for _ in 0..4 {
            hub.publish("orders", &Headers::new(), &Bytes::from_static(b"x"), None);
        }

        let mut first_count = 0;
        while first.try_recv().is_ok() {
            first_count += 1;
        }
        let mut second_count = 0;
        while second.try_recv().is_ok() {
            second_count += 1;
        }

        assert_eq!(first_count, 2);
        assert_eq!(second_count, 2);
    }

    #[tokio::test]
    async fn grouped_and_ungrouped_targets_each_get_their_share() {
        let hub = MemoryHub::new();
        let (_, mut solo) = hub.subscribe("orders", None, 16);
        let (_, mut first) = hub.subscribe("orders", Some("workers".to_string()), 16);
        let (_, mut second) = hub.subscribe("orders", Some("workers".to_string()), 16);

        for _ in 0..10 {
            let delivered =
                hub.publish("orders", &Headers::new(), &Bytes::from_static(b"x"), None);
            assert_eq!(delivered, 2);
        }

        let mut solo_count = 0;
        while solo.try_recv().is_ok() {
            solo_count += 1;
        }
        let mut first_count = 0;
        while first.try_recv().is_ok() {
            first_count += 1;
        }
        let mut second_count = 0;
        while second.try_recv().is_ok() {
            second_count += 1;
        }

        assert_eq!(solo_count, 10);
        assert_eq!(first_count, 5);
        assert_eq!(second_count, 5);
    }

    #[tokio::test]
    async fn zero_capacity_subscriptions_still_receive() {
        let hub = MemoryHub::new();
        let (_, mut receiver) = hub.subscribe("orders", None, 0);

        let delivered = hub.publish("orders", &Headers::new(), &Bytes::from_static(b"x"), None);

        assert_eq!(delivered, 1);
        assert!(receiver.try_recv().is_ok());
    }

    #[tokio::test]
    async fn unsubscribe_removes_the_target_and_empty_topics() {
        let hub = MemoryHub::new();
        let (id, receiver) = hub.subscribe("orders", None, 8);
        drop(receiver);

        hub.unsubscribe("orders", id);

        assert_eq!(hub.subscriber_count("orders"), 0);
        assert_eq!(
            hub.publish("orders", &Headers::new(), &Bytes::from_static(b"x"), None),
            0
        );
    }

    #[tokio::test]
    async fn closed_receivers_are_pruned_on_publish() {
        let hub = MemoryHub::new();
        let (_, receiver) = hub.subscribe("orders", None, 8);
        drop(receiver);

        let delivered = hub.publish("orders", &Headers::new(), &Bytes::from_static(b"x"), None);

        assert_eq!(delivered, 0);
        assert_eq!(hub.subscriber_count("orders"), 0);
    }
}
