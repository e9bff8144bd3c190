//! Subscription handles for the memory backend.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use courier_broker::broker::Subscriber;
use courier_broker::message::{Acker, BoxError, Message, Replier};
use courier_broker::registry::RegistryHandle;
use tracing::debug;

use crate::error::Error;
use crate::hub::{MemoryHub, ReplySlot, TargetId};

/// Handle to one active memory subscription.
#[derive(Clone, Debug)]
pub struct MemorySubscriber {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    topic: String,
    id: TargetId,
    hub: MemoryHub,
    closed: AtomicBool,
    acks: Arc<AtomicUsize>,
    registry: RegistryHandle<MemorySubscriber>,
}

impl MemorySubscriber {
    pub(crate) fn new(
        topic: &str,
        id: TargetId,
        hub: MemoryHub,
        registry: RegistryHandle<MemorySubscriber>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                topic: topic.to_string(),
                id,
                hub,
                closed: AtomicBool::new(false),
                acks: Arc::new(AtomicUsize::new(0)),
                registry,
            }),
        }
    }

    pub(crate) fn acks_handle(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.inner.acks)
    }

    /// Number of deliveries acknowledged so far.
    ///
    /// The memory backend records acknowledgements instead of discarding
    /// them, so delivery bookkeeping stays observable in tests.
    #[must_use]
    pub fn acks(&self) -> usize {
        self.inner.acks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Subscriber for MemorySubscriber {
    type Error = Error;

    fn topic(&self) -> &str {
        &self.inner.topic
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    async fn unsubscribe(&self) -> Result<(), Self::Error> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.inner.hub.unsubscribe(&self.inner.topic, self.inner.id);
        self.inner.registry.remove_only(&self.inner.topic);
        debug!(topic = %self.inner.topic, "unsubscribed");
        Ok(())
    }

    async fn close(&self) -> Result<(), Self::Error> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.inner.hub.unsubscribe(&self.inner.topic, self.inner.id);
        debug!(topic = %self.inner.topic, "subscription closed");
        Ok(())
    }
}

/// Records acknowledgements on the owning subscription.
#[derive(Debug)]
pub(crate) struct MemoryAcker {
    acks: Arc<AtomicUsize>,
}

impl MemoryAcker {
    pub(crate) const fn new(acks: Arc<AtomicUsize>) -> Self {
        Self { acks }
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), BoxError> {
        self.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Sends the first reply back to the requester; later replies are ignored,
/// matching first-reply-wins request semantics.
#[derive(Debug)]
pub(crate) struct MemoryReplier {
    slot: ReplySlot,
}

impl MemoryReplier {
    pub(crate) const fn new(slot: ReplySlot) -> Self {
        Self { slot }
    }
}

#[async_trait]
impl Replier for MemoryReplier {
    async fn reply(&self, reply: Message) -> Result<(), BoxError> {
        let Some(sender) = self.slot.lock().take() else {
            debug!("reply ignored; request already answered");
            return Ok(());
        };

        if sender.send(reply).is_err() {
            debug!("reply ignored; requester gave up waiting");
        }
        Ok(())
    }
}
