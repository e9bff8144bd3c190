//! In-memory broker for tests and single-process wiring.
//!
//! Brokers attach to a [`MemoryHub`]; brokers sharing a hub exchange
//! messages and separate hubs are fully isolated. The hub is passed in as
//! a connection option, so there is no process-global state.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod hub;
mod subscriber;

pub use error::Error;
pub use hub::MemoryHub;
pub use subscriber::MemorySubscriber;

use std::error::Error as StdError;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use courier_broker::broker::{Broker, ConnectionEvent, Subscriber};
use courier_broker::codec::Codec;
use courier_broker::dispatch::Dispatcher;
use courier_broker::handler::Handler;
use courier_broker::message::{Acker, Message, Replier};
use courier_broker::options::{
    BrokerOption, BrokerOptions, PublishOption, PublishOptions, RequestOption, RequestOptions,
    SubscribeOption, SubscribeOptions, normalize_addrs, with_broker_extension,
};
use courier_broker::registry::SubscriberRegistry;
use courier_broker::trace::OperationTracer;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{broadcast, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::hub::ReplySlot;
use crate::subscriber::{MemoryAcker, MemoryReplier};

const DEFAULT_ADDR: &str = "memory://local";

/// Memory-specific connection settings.
#[derive(Clone, Debug)]
pub struct MemoryConnectExtension {
    /// Hub to attach to. `None` gives the broker a private hub, isolating
    /// it completely.
    pub hub: Option<MemoryHub>,

    /// Capacity of each subscription's delivery channel; deliveries beyond
    /// it are dropped with a warning. Values below one are raised to one.
    pub channel_capacity: usize,
}

impl Default for MemoryConnectExtension {
    fn default() -> Self {
        Self {
            hub: None,
            channel_capacity: 128,
        }
    }
}

/// Attaches the broker to `hub` instead of a private one.
#[must_use]
pub fn with_hub(hub: MemoryHub) -> BrokerOption<MemoryConnectExtension> {
    with_broker_extension(move |extension: &mut MemoryConnectExtension| {
        extension.hub = Some(hub);
    })
}

/// Overrides the per-subscription delivery channel capacity.
///
/// Capacities below one are raised to one.
#[must_use]
pub fn with_channel_capacity(capacity: usize) -> BrokerOption<MemoryConnectExtension> {
    with_broker_extension(move |extension: &mut MemoryConnectExtension| {
        extension.channel_capacity = capacity;
    })
}

/// In-process broker backed by a [`MemoryHub`].
#[derive(Debug)]
pub struct MemoryBroker {
    options: Mutex<BrokerOptions<MemoryConnectExtension>>,
    private_hub: MemoryHub,
    conn: tokio::sync::Mutex<Option<MemoryHub>>,
    subscribers: SubscriberRegistry<MemorySubscriber>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl MemoryBroker {
    /// Creates a broker from construction-time options. The broker is not
    /// connected until [`Broker::connect`] is called.
    #[must_use]
    pub fn new(opts: Vec<BrokerOption<MemoryConnectExtension>>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            options: Mutex::new(BrokerOptions::from_options(opts)),
            private_hub: MemoryHub::new(),
            conn: tokio::sync::Mutex::new(None),
            subscribers: SubscriberRegistry::new(),
            events,
        }
    }

    fn tracer(&self) -> OperationTracer {
        OperationTracer::new("memory", self.options.lock().tracer.clone())
    }

    fn codec(&self) -> Codec {
        self.options.lock().codec
    }

    fn channel_capacity(&self) -> usize {
        self.options.lock().extension.channel_capacity
    }

    async fn connected_hub(&self) -> Result<MemoryHub, Error> {
        self.conn.lock().await.clone().ok_or(Error::NotConnected)
    }

    async fn publish_message(
        &self,
        topic: &str,
        options: PublishOptions<()>,
        payload: Bytes,
    ) -> Result<(), Error> {
        let hub = self.connected_hub().await?;
        let mut headers = options.headers;

        let span = self.tracer().start_producer(topic, &mut headers);
        let delivered = hub.publish(topic, &headers, &payload, None);
        span.finish(None);

        debug!(topic, delivered, "published");
        Ok(())
    }

    async fn request_message(
        &self,
        topic: &str,
        options: RequestOptions<()>,
        payload: Bytes,
    ) -> Result<Message, Error> {
        let hub = self.connected_hub().await?;
        let mut headers = options.headers;

        let span = self.tracer().start_producer(topic, &mut headers);

        let (sender, receiver) = oneshot::channel();
        let slot: ReplySlot = Arc::new(Mutex::new(Some(sender)));
        let delivered = hub.publish(topic, &headers, &payload, Some(&slot));
        debug!(topic, delivered, "request delivered");

        let result = match timeout(options.timeout, receiver).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) | Err(_) => Err(Error::RequestTimeout(options.timeout)),
        };
        // The slot stays alive until here so an unanswered request waits
        // out the full window instead of failing fast.
        drop(slot);

        span.finish(
            result
                .as_ref()
                .err()
                .map(|error| error as &(dyn StdError + 'static)),
        );
        result
    }

    async fn start_subscription<T, H>(
        &self,
        topic: &str,
        queue: Option<String>,
        dispatcher: Dispatcher<T, H>,
    ) -> Result<MemorySubscriber, Error>
    where
        T: Send + 'static,
        H: Handler<T>,
    {
        let hub = self.connected_hub().await?;
        let (id, mut inbox) = hub.subscribe(topic, queue, self.channel_capacity());
        let subscriber = MemorySubscriber::new(topic, id, hub, self.subscribers.downgrade());

        let acks = subscriber.acks_handle();
        tokio::spawn(async move {
            while let Some(inbound) = inbox.recv().await {
                let acker: Arc<dyn Acker> = Arc::new(MemoryAcker::new(Arc::clone(&acks)));
                let replier = inbound
                    .reply
                    .map(|slot| Arc::new(MemoryReplier::new(slot)) as Arc<dyn Replier>);
                dispatcher
                    .dispatch(inbound.headers, inbound.payload, Some(acker), replier)
                    .await;
            }
            debug!(topic = %dispatcher.topic(), "delivery loop stopped");
        });

        if let Some(displaced) = self.subscribers.add(topic, subscriber.clone()) {
            if let Err(error) = displaced.close().await {
                warn!(topic, %error, "failed to close displaced subscriber");
            }
        }

        debug!(topic, "subscribed");
        Ok(subscriber)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    type Error = Error;
    type ConnectExtension = MemoryConnectExtension;
    type PublishExtension = ();
    type SubscribeExtension = ();
    type RequestExtension = ();
    type Subscriber = MemorySubscriber;

    fn name(&self) -> &'static str {
        "memory"
    }

    fn address(&self) -> String {
        let options = self.options.lock();
        normalize_addrs(&options.addrs, "memory", DEFAULT_ADDR).remove(0)
    }

    fn options(&self) -> BrokerOptions<MemoryConnectExtension> {
        self.options.lock().clone()
    }

    async fn init(
        &self,
        opts: Vec<BrokerOption<MemoryConnectExtension>>,
    ) -> Result<(), Self::Error> {
        self.options.lock().apply(opts);
        Ok(())
    }

    async fn connect(&self) -> Result<(), Self::Error> {
        let mut conn = self.conn.lock().await;
        if conn.is_some() {
            return Ok(());
        }

        let hub = self
            .options
            .lock()
            .extension
            .hub
            .clone()
            .unwrap_or_else(|| self.private_hub.clone());
        hub.attach();
        *conn = Some(hub);

        let _ = self.events.send(ConnectionEvent::Connected);
        info!(address = %self.address(), "memory broker connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Self::Error> {
        let mut conn = self.conn.lock().await;
        let Some(hub) = conn.take() else {
            return Ok(());
        };

        self.subscribers.clear().await;
        hub.detach();

        let _ = self.events.send(ConnectionEvent::Disconnected);
        info!("memory broker disconnected");
        Ok(())
    }

    async fn publish<T>(
        &self,
        topic: &str,
        msg: &T,
        opts: Vec<PublishOption<()>>,
    ) -> Result<(), Self::Error>
    where
        T: Serialize + Sync,
    {
        let payload = self.codec().marshal(msg)?;
        self.publish_message(topic, PublishOptions::from_options(opts), payload)
            .await
    }

    async fn publish_raw(
        &self,
        topic: &str,
        payload: Bytes,
        opts: Vec<PublishOption<()>>,
    ) -> Result<(), Self::Error> {
        self.publish_message(topic, PublishOptions::from_options(opts), payload)
            .await
    }

    async fn subscribe<T, H>(
        &self,
        topic: &str,
        handler: H,
        opts: Vec<SubscribeOption<()>>,
    ) -> Result<Self::Subscriber, Self::Error>
    where
        T: DeserializeOwned + Send + 'static,
        H: Handler<T>,
    {
        let options = SubscribeOptions::from_options(opts);
        let dispatcher = Dispatcher::typed(
            topic,
            self.codec(),
            handler,
            options.auto_ack,
            options.error_handler.clone(),
            self.tracer(),
        );
        self.start_subscription(topic, options.queue, dispatcher)
            .await
    }

    async fn subscribe_raw<H>(
        &self,
        topic: &str,
        handler: H,
        opts: Vec<SubscribeOption<()>>,
    ) -> Result<Self::Subscriber, Self::Error>
    where
        H: Handler<Bytes>,
    {
        let options = SubscribeOptions::from_options(opts);
        let dispatcher = Dispatcher::raw(
            topic,
            handler,
            options.auto_ack,
            options.error_handler.clone(),
            self.tracer(),
        );
        self.start_subscription(topic, options.queue, dispatcher)
            .await
    }

    async fn request<T>(
        &self,
        topic: &str,
        msg: &T,
        opts: Vec<RequestOption<()>>,
    ) -> Result<Message, Self::Error>
    where
        T: Serialize + Sync,
    {
        let payload = self.codec().marshal(msg)?;
        self.request_message(topic, RequestOptions::from_options(opts), payload)
            .await
    }

    async fn request_raw(
        &self,
        topic: &str,
        payload: Bytes,
        opts: Vec<RequestOption<()>>,
    ) -> Result<Message, Self::Error> {
        self.request_message(topic, RequestOptions::from_options(opts), payload)
            .await
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }
}
