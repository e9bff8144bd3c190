//! Subscription handles for the NATS backend.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_nats::{Client, Subject};
use async_trait::async_trait;
use courier_broker::broker::Subscriber;
use courier_broker::message::{Acker, BoxError, Message, Replier};
use courier_broker::registry::RegistryHandle;
use tokio::sync::watch;
use tracing::debug;

use crate::error::Error;
use crate::to_nats_headers;

/// Handle to one active NATS subscription.
///
/// Stopping the handle cancels the delivery loop, which drops the native
/// subscriber and lets the client send the server-side unsubscribe.
#[derive(Clone, Debug)]
pub struct NatsSubscriber {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    topic: String,
    stop: watch::Sender<()>,
    closed: AtomicBool,
    registry: RegistryHandle<NatsSubscriber>,
}

impl NatsSubscriber {
    pub(crate) fn new(
        topic: &str,
        stop: watch::Sender<()>,
        registry: RegistryHandle<NatsSubscriber>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                topic: topic.to_string(),
                stop,
                closed: AtomicBool::new(false),
                registry,
            }),
        }
    }
}

#[async_trait]
impl Subscriber for NatsSubscriber {
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

        let _ = self.inner.stop.send(());
        self.inner.registry.remove_only(&self.inner.topic);
        debug!(topic = %self.inner.topic, "unsubscribed");
        Ok(())
    }

    async fn close(&self) -> Result<(), Self::Error> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let _ = self.inner.stop.send(());
        debug!(topic = %self.inner.topic, "subscription closed");
        Ok(())
    }
}

/// Core NATS delivery is at-most-once, so acknowledgement is a no-op kept
/// for contract uniformity.
#[derive(Debug)]
pub(crate) struct NatsAcker;

#[async_trait]
impl Acker for NatsAcker {
    async fn ack(&self) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Publishes replies to the requester's inbox subject.
#[derive(Debug)]
pub(crate) struct NatsReplier {
    client: Client,
    subject: Subject,
}

impl NatsReplier {
    pub(crate) const fn new(client: Client, subject: Subject) -> Self {
        Self { client, subject }
    }
}

#[async_trait]
impl Replier for NatsReplier {
    async fn reply(&self, reply: Message) -> Result<(), BoxError> {
        if reply.headers.is_empty() {
            self.client
                .publish(self.subject.clone(), reply.payload)
                .await?;
        } else {
            self.client
                .publish_with_headers(
                    self.subject.clone(),
                    to_nats_headers(&reply.headers),
                    reply.payload,
                )
                .await?;
        }
        Ok(())
    }
}
