//! Concurrency-safe bookkeeping of active subscriptions.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::warn;

use crate::broker::Subscriber;

/// Map of topic to active subscription handle, one per broker.
///
/// The internal lock is never held across a backend call: `clear` drains
/// the map first and closes the drained handles afterwards, so a handler
/// unsubscribing itself concurrently with a disconnect cannot deadlock.
#[derive(Debug)]
pub struct SubscriberRegistry<S> {
    inner: Arc<Mutex<HashMap<String, S>>>,
}

impl<S> Clone for SubscriberRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> Default for SubscriberRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> SubscriberRegistry<S> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Inserts `subscriber` under `topic`, returning any displaced handle.
    ///
    /// Re-subscribing to a topic is last-write-wins; the caller owns
    /// closing the displaced subscriber.
    pub fn add(&self, topic: impl Into<String>, subscriber: S) -> Option<S> {
        self.inner.lock().insert(topic.into(), subscriber)
    }

    /// Removes the handle for `topic` without closing it.
    ///
    /// Used by subscribers deregistering themselves after their own
    /// teardown, where closing again would re-enter the backend.
    pub fn remove_only(&self, topic: &str) -> Option<S> {
        self.inner.lock().remove(topic)
    }

    /// Returns `true` when `topic` has a registered subscriber.
    #[must_use]
    pub fn contains(&self, topic: &str) -> bool {
        self.inner.lock().contains_key(topic)
    }

    /// Number of active registrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Returns `true` when no subscriptions are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Snapshot of the registered topics, in arbitrary order.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        self.inner.lock().keys().cloned().collect()
    }

    /// A weak reference for subscriber self-removal that does not extend
    /// the broker's lifetime.
    #[must_use]
    pub fn downgrade(&self) -> RegistryHandle<S> {
        RegistryHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl<S: Subscriber> SubscriberRegistry<S> {
    /// Closes every subscriber and empties the registry.
    ///
    /// Close failures are logged and do not stop the drain.
    pub async fn clear(&self) {
        let drained: Vec<(String, S)> = self.inner.lock().drain().collect();

        for (topic, subscriber) in drained {
            if let Err(error) = subscriber.close().await {
                warn!(%topic, %error, "failed to close subscriber");
            }
        }
    }
}

/// Weak reference to a registry, held by subscribers for self-removal.
pub struct RegistryHandle<S> {
    inner: Weak<Mutex<HashMap<String, S>>>,
}

impl<S> std::fmt::Debug for RegistryHandle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RegistryHandle")
    }
}

impl<S> Clone for RegistryHandle<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<S> RegistryHandle<S> {
    /// Removes the handle for `topic` if the registry is still alive.
    pub fn remove_only(&self, topic: &str) -> Option<S> {
        self.inner
            .upgrade()
            .and_then(|map| map.lock().remove(topic))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use thiserror::Error;
    use tokio::time::timeout;

    use crate::broker::BrokerError;

    #[derive(Debug, Error)]
    #[error("fake subscriber error")]
    struct FakeError;

    impl BrokerError for FakeError {}

    #[derive(Clone, Debug)]
    struct FakeSubscriber {
        topic: String,
        closed: Arc<AtomicBool>,
    }

    impl FakeSubscriber {
        fn new(topic: &str) -> Self {
            Self {
                topic: topic.to_string(),
                closed: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait]
    impl Subscriber for FakeSubscriber {
        type Error = FakeError;

        fn topic(&self) -> &str {
            &self.topic
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        async fn unsubscribe(&self) -> Result<(), Self::Error> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self) -> Result<(), Self::Error> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn add_displaces_the_previous_handle() {
        let registry = SubscriberRegistry::new();
        let first = FakeSubscriber::new("orders");
        let second = FakeSubscriber::new("orders");

        assert!(registry.add("orders", first.clone()).is_none());
        let displaced = registry.add("orders", second).unwrap();

        assert!(Arc::ptr_eq(&displaced.closed, &first.closed));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_only_leaves_the_subscriber_running() {
        let registry = SubscriberRegistry::new();
        registry.add("orders", FakeSubscriber::new("orders"));

        let removed = registry.remove_only("orders").unwrap();

        assert!(!removed.is_closed());
        assert!(!registry.contains("orders"));
        assert!(registry.remove_only("orders").is_none());
    }

    #[tokio::test]
    async fn clear_closes_every_subscriber() {
        let registry = SubscriberRegistry::new();
        let subscribers: Vec<_> = (0..4)
            .map(|i| {
                let subscriber = FakeSubscriber::new(&format!("topic.{i}"));
                registry.add(format!("topic.{i}"), subscriber.clone());
                subscriber
            })
            .collect();

        registry.clear().await;

        assert!(registry.is_empty());
        assert!(subscribers.iter().all(FakeSubscriber::is_closed));
    }

    #[test]
    fn weak_handle_outlives_the_registry() {
        let registry = SubscriberRegistry::new();
        registry.add("orders", FakeSubscriber::new("orders"));
        let handle = registry.downgrade();

        assert!(handle.remove_only("orders").is_some());

        drop(registry);
        assert!(handle.remove_only("orders").is_none());
    }

    #[tokio::test]
    async fn concurrent_adds_and_clears_do_not_deadlock() {
        let registry = SubscriberRegistry::new();

        let adder = {
            let registry = registry.clone();
            tokio::spawn(async move {
                for i in 0..100 {
                    let topic = format!("topic.{}", i % 10);
                    registry.add(topic.clone(), FakeSubscriber::new(&topic));
                    tokio::task::yield_now().await;
                }
            })
        };

        let clearer = {
            let registry = registry.clone();
            tokio::spawn(async move {
                for _ in 0..20 {
                    registry.clear().await;
                    tokio::task::yield_now().await;
                }
            })
        };

        timeout(Duration::from_secs(5), async {
            adder.await.unwrap();
            clearer.await.unwrap();
        })
        .await
        .expect("registry operations deadlocked");

        registry.clear().await;
        assert!(registry.is_empty());
    }
}
