//! NATS implementation of the broker contract, on core NATS subjects.
//!
//! Queue groups map to NATS queue subscriptions, requests ride the
//! client's inbox plumbing, and connection events are forwarded from the
//! client's event callback. Core NATS delivery is at-most-once, so
//! acknowledgement is a no-op kept for contract uniformity.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod subscriber;

pub use error::Error;
pub use subscriber::NatsSubscriber;

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use async_nats::{Client, ConnectOptions, RequestErrorKind};
use async_trait::async_trait;
use bytes::Bytes;
use courier_broker::broker::{Broker, ConnectionEvent, Subscriber};
use courier_broker::codec::Codec;
use courier_broker::dispatch::Dispatcher;
use courier_broker::handler::Handler;
use courier_broker::message::{Acker, Headers, Message, Replier};
use courier_broker::options::{
    BrokerOption, BrokerOptions, PublishOption, PublishOptions, RequestOption, RequestOptions,
    SubscribeOption, SubscribeOptions, normalize_addrs, with_broker_extension,
    with_publish_extension,
};
use courier_broker::registry::SubscriberRegistry;
use courier_broker::trace::OperationTracer;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{broadcast, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::subscriber::{NatsAcker, NatsReplier};

const DEFAULT_ADDR: &str = "nats://127.0.0.1:4222";

/// NATS-specific connection settings.
#[derive(Clone, Debug, Default)]
pub struct NatsConnectExtension {
    /// Connection name reported to the server.
    pub connection_name: Option<String>,

    /// Username for user/password authentication.
    pub user: Option<String>,

    /// Password for user/password authentication.
    pub password: Option<String>,

    /// Authentication token.
    pub token: Option<String>,

    /// Refuse to connect without TLS.
    pub require_tls: bool,

    /// Interval between client pings.
    pub ping_interval: Option<Duration>,

    /// Cap on reconnect attempts; `None` keeps the client retrying
    /// forever.
    pub max_reconnects: Option<usize>,

    /// Drain subscriptions and buffered messages before closing on
    /// disconnect.
    pub drain_on_disconnect: bool,
}

/// NATS-specific publish settings.
#[derive(Clone, Copy, Debug)]
pub struct NatsPublishExtension {
    /// Flush after publishing so the call blocks until the server has the
    /// bytes. Disable for fire-and-forget batching.
    pub flush: bool,
}

impl Default for NatsPublishExtension {
    fn default() -> Self {
        Self { flush: true }
    }
}

/// Sets user/password authentication.
#[must_use]
pub fn with_credentials(
    user: impl Into<String>,
    password: impl Into<String>,
) -> BrokerOption<NatsConnectExtension> {
    let (user, password) = (user.into(), password.into());
    with_broker_extension(move |extension: &mut NatsConnectExtension| {
        extension.user = Some(user);
        extension.password = Some(password);
    })
}

/// Sets token authentication.
#[must_use]
pub fn with_token(token: impl Into<String>) -> BrokerOption<NatsConnectExtension> {
    let token = token.into();
    with_broker_extension(move |extension: &mut NatsConnectExtension| {
        extension.token = Some(token);
    })
}

/// Refuses to connect without TLS.
#[must_use]
pub fn with_required_tls() -> BrokerOption<NatsConnectExtension> {
    with_broker_extension(|extension: &mut NatsConnectExtension| extension.require_tls = true)
}

/// Drains in-flight messages before closing on disconnect.
#[must_use]
pub fn with_drain() -> BrokerOption<NatsConnectExtension> {
    with_broker_extension(|extension: &mut NatsConnectExtension| {
        extension.drain_on_disconnect = true;
    })
}

/// Enables or disables the per-publish flush.
#[must_use]
pub fn with_flush(flush: bool) -> PublishOption<NatsPublishExtension> {
    with_publish_extension(move |extension: &mut NatsPublishExtension| extension.flush = flush)
}

pub(crate) fn to_nats_headers(headers: &Headers) -> async_nats::HeaderMap {
    let mut map = async_nats::HeaderMap::new();
    for (key, value) in headers.iter() {
        map.insert(key, value);
    }
    map
}

pub(crate) fn from_nats_headers(map: &async_nats::HeaderMap) -> Headers {
    map.iter()
        .map(|(key, values)| {
            let value = values.first().map(ToString::to_string).unwrap_or_default();
            (key.to_string(), value)
        })
        .collect()
}

/// Broker backed by core NATS subjects.
#[derive(Debug)]
pub struct NatsBroker {
    options: Mutex<BrokerOptions<NatsConnectExtension>>,
    conn: tokio::sync::Mutex<Option<Client>>,
    subscribers: SubscriberRegistry<NatsSubscriber>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl NatsBroker {
    /// Creates a broker from construction-time options. The broker is not
    /// connected until [`Broker::connect`] is called.
    #[must_use]
    pub fn new(opts: Vec<BrokerOption<NatsConnectExtension>>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            options: Mutex::new(BrokerOptions::from_options(opts)),
            conn: tokio::sync::Mutex::new(None),
            subscribers: SubscriberRegistry::new(),
            events,
        }
    }

    fn tracer(&self) -> OperationTracer {
        OperationTracer::new("nats", self.options.lock().tracer.clone())
    }

    fn codec(&self) -> Codec {
        self.options.lock().codec
    }

    async fn connected_client(&self) -> Result<Client, Error> {
        self.conn.lock().await.clone().ok_or(Error::NotConnected)
    }

    fn connection_config(&self) -> (Vec<String>, ConnectOptions) {
        let options = self.options.lock().clone();
        let addrs = normalize_addrs(&options.addrs, "nats", DEFAULT_ADDR);
        let extension = options.extension;

        let mut connect_options = ConnectOptions::new();
        if let Some(name) = extension.connection_name {
            connect_options = connect_options.name(name);
        }
        if let (Some(user), Some(password)) = (extension.user, extension.password) {
            connect_options = connect_options.user_and_password(user, password);
        }
        if let Some(token) = extension.token {
            connect_options = connect_options.token(token);
        }
        if extension.require_tls {
            connect_options = connect_options.require_tls(true);
        }
        if let Some(interval) = extension.ping_interval {
            connect_options = connect_options.ping_interval(interval);
        }
        if let Some(max) = extension.max_reconnects {
            connect_options = connect_options.max_reconnects(max);
        }

        let events = self.events.clone();
        connect_options = connect_options.event_callback(move |event| {
            let events = events.clone();
            async move {
                let mapped = match event {
                    async_nats::Event::Connected => ConnectionEvent::Connected,
                    async_nats::Event::Disconnected => ConnectionEvent::Disconnected,
                    other => ConnectionEvent::Error(other.to_string()),
                };
                match &mapped {
                    ConnectionEvent::Error(error) => error!(%error, "nats client event"),
                    state => debug!(?state, "nats client event"),
                }
                let _ = events.send(mapped);
            }
        });

        (addrs, connect_options)
    }

    async fn publish_message(
        &self,
        topic: &str,
        options: PublishOptions<NatsPublishExtension>,
        payload: Bytes,
    ) -> Result<(), Error> {
        let client = self.connected_client().await?;
        let mut headers = options.headers;

        let span = self.tracer().start_producer(topic, &mut headers);
        let result =
            Self::send_publish(&client, topic, &headers, payload, options.extension.flush).await;
        span.finish(
            result
                .as_ref()
                .err()
                .map(|error| error as &(dyn StdError + 'static)),
        );

        if result.is_ok() {
            debug!(topic, "published");
        }
        result
    }

    async fn send_publish(
        client: &Client,
        topic: &str,
        headers: &Headers,
        payload: Bytes,
        flush: bool,
    ) -> Result<(), Error> {
        if headers.is_empty() {
            client.publish(topic.to_string(), payload).await?;
        } else {
            client
                .publish_with_headers(topic.to_string(), to_nats_headers(headers), payload)
                .await?;
        }

        if flush {
            client.flush().await?;
        }
        Ok(())
    }

    async fn request_message(
        &self,
        topic: &str,
        options: RequestOptions<()>,
        payload: Bytes,
    ) -> Result<Message, Error> {
        let client = self.connected_client().await?;
        let mut headers = options.headers;

        let span = self.tracer().start_producer(topic, &mut headers);
        let result = Self::send_request(&client, topic, &headers, payload, options.timeout).await;
        span.finish(
            result
                .as_ref()
                .err()
                .map(|error| error as &(dyn StdError + 'static)),
        );
        result
    }

    async fn send_request(
        client: &Client,
        topic: &str,
        headers: &Headers,
        payload: Bytes,
        window: Duration,
    ) -> Result<Message, Error> {
        let outcome = if headers.is_empty() {
            timeout(window, client.request(topic.to_string(), payload)).await
        } else {
            timeout(
                window,
                client.request_with_headers(topic.to_string(), to_nats_headers(headers), payload),
            )
            .await
        };

        match outcome {
            Ok(Ok(reply)) => Ok(Message {
                headers: reply.headers.as_ref().map(from_nats_headers).unwrap_or_default(),
                payload: reply.payload,
            }),
            Ok(Err(error)) => match error.kind() {
                RequestErrorKind::NoResponders => Err(Error::NoResponders),
                RequestErrorKind::TimedOut => Err(Error::RequestTimeout(window)),
                RequestErrorKind::Other => Err(Error::Request(error)),
            },
            Err(_) => Err(Error::RequestTimeout(window)),
        }
    }

    async fn start_subscription<T, H>(
        &self,
        topic: &str,
        queue: Option<String>,
        dispatcher: Dispatcher<T, H>,
    ) -> Result<NatsSubscriber, Error>
    where
        T: Send + 'static,
        H: Handler<T>,
    {
        let client = self.connected_client().await?;
        let native = match queue {
            Some(group) => client.queue_subscribe(topic.to_string(), group).await?,
            None => client.subscribe(topic.to_string()).await?,
        };

        let (stop_sender, stop_receiver) = watch::channel(());
        let subscriber = NatsSubscriber::new(topic, stop_sender, self.subscribers.downgrade());
        Self::spawn_delivery_loop(client, native, dispatcher, stop_receiver);

        if let Some(displaced) = self.subscribers.add(topic, subscriber.clone()) {
            if let Err(error) = displaced.close().await {
                warn!(topic, %error, "failed to close displaced subscriber");
            }
        }

        debug!(topic, "subscribed");
        Ok(subscriber)
    }

    fn spawn_delivery_loop<T, H>(
        client: Client,
        mut native: async_nats::Subscriber,
        dispatcher: Dispatcher<T, H>,
        mut stop: watch::Receiver<()>,
    ) where
        T: Send + 'static,
        H: Handler<T>,
    {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    message = native.next() => {
                        let Some(message) = message else { break };

                        let headers = message
                            .headers
                            .as_ref()
                            .map(from_nats_headers)
                            .unwrap_or_default();
                        let acker: Arc<dyn Acker> = Arc::new(NatsAcker);
                        let replier = message.reply.clone().map(|subject| {
                            Arc::new(NatsReplier::new(client.clone(), subject)) as Arc<dyn Replier>
                        });

                        dispatcher
                            .dispatch(headers, message.payload.clone(), Some(acker), replier)
                            .await;
                    }
                }
            }
            debug!(topic = %dispatcher.topic(), "delivery loop stopped");
        });
    }
}

#[async_trait]
impl Broker for NatsBroker {
    type Error = Error;
    type ConnectExtension = NatsConnectExtension;
    type PublishExtension = NatsPublishExtension;
    type SubscribeExtension = ();
    type RequestExtension = ();
    type Subscriber = NatsSubscriber;

    fn name(&self) -> &'static str {
        "nats"
    }

    fn address(&self) -> String {
        let options = self.options.lock();
        normalize_addrs(&options.addrs, "nats", DEFAULT_ADDR).remove(0)
    }

    fn options(&self) -> BrokerOptions<NatsConnectExtension> {
        self.options.lock().clone()
    }

    async fn init(&self, opts: Vec<BrokerOption<NatsConnectExtension>>) -> Result<(), Self::Error> {
        self.options.lock().apply(opts);
        Ok(())
    }

    async fn connect(&self) -> Result<(), Self::Error> {
        let mut conn = self.conn.lock().await;
        if let Some(client) = conn.as_ref() {
            // The client reconnects on its own; a live handle in any state
            // counts as connected.
            debug!(state = ?client.connection_state(), "connect on a live client is a no-op");
            return Ok(());
        }

        let (addrs, connect_options) = self.connection_config();
        let client = async_nats::connect_with_options(addrs.join(","), connect_options).await?;
        *conn = Some(client);

        let _ = self.events.send(ConnectionEvent::Connected);
        info!(address = %addrs[0], "nats broker connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Self::Error> {
        let mut conn = self.conn.lock().await;
        let Some(client) = conn.take() else {
            return Ok(());
        };

        let result = if self.options.lock().extension.drain_on_disconnect {
            client
                .drain()
                .await
                .map_err(|error| Error::Drain(error.to_string()))
        } else {
            client.flush().await.map_err(Error::from)
        };

        // The registry is cleared even when the drain fails.
        self.subscribers.clear().await;

        let _ = self.events.send(ConnectionEvent::Disconnected);
        info!("nats broker disconnected");
        result
    }

    async fn publish<T>(
        &self,
        topic: &str,
        msg: &T,
        opts: Vec<PublishOption<NatsPublishExtension>>,
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
        opts: Vec<PublishOption<NatsPublishExtension>>,
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

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use courier_broker::handler::HandlerError;
    use courier_broker::message::Event;
    use courier_broker::options::{
        with_addrs, with_codec, with_queue, with_request_header, with_request_timeout,
    };
    use serde::Deserialize;
    use serial_test::serial;
    use thiserror::Error as ThisError;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    #[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
    struct TestMessage {
        value: String,
    }

    impl TestMessage {
        fn new(value: &str) -> Self {
            Self {
                value: value.to_string(),
            }
        }
    }

    #[derive(Debug, ThisError)]
    #[error("test handler failed")]
    struct TestError;

    impl HandlerError for TestError {}

    #[derive(Debug)]
    struct TestHandler {
        sender: mpsc::Sender<Event<TestMessage>>,
    }

    #[async_trait]
    impl Handler<TestMessage> for TestHandler {
        type Error = TestError;

        async fn handle(&self, event: Event<TestMessage>) -> Result<(), Self::Error> {
            self.sender.send(event).await.map_err(|_| TestError)
        }
    }

    #[derive(Debug)]
    struct EchoHandler;

    #[async_trait]
    impl Handler<TestMessage> for EchoHandler {
        type Error = TestError;

        async fn handle(&self, event: Event<TestMessage>) -> Result<(), Self::Error> {
            let payload = Codec::Json
                .marshal(&TestMessage::new("pong"))
                .map_err(|_| TestError)?;
            event
                .reply(Message::new(payload))
                .await
                .map_err(|_| TestError)
        }
    }

    #[derive(Debug)]
    struct HeaderEchoHandler;

    #[async_trait]
    impl Handler<TestMessage> for HeaderEchoHandler {
        type Error = TestError;

        async fn handle(&self, event: Event<TestMessage>) -> Result<(), Self::Error> {
            let tenant = event.headers().get("tenant").unwrap_or("missing").to_string();
            let payload = Codec::Json
                .marshal(&TestMessage::new(&tenant))
                .map_err(|_| TestError)?;
            event
                .reply(Message::new(payload))
                .await
                .map_err(|_| TestError)
        }
    }

    fn nats_url() -> String {
        std::env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string())
    }

    fn unique_topic(prefix: &str) -> String {
        format!("{prefix}.{}", Uuid::new_v4().as_simple())
    }

    async fn connected_broker() -> NatsBroker {
        let broker = NatsBroker::new(vec![with_addrs([nats_url()])]);
        broker
            .connect()
            .await
            .expect("failed to connect to NATS for tests");
        broker
    }

    fn capture_channel() -> (TestHandler, mpsc::Receiver<Event<TestMessage>>) {
        let (sender, receiver) = mpsc::channel(16);
        (TestHandler { sender }, receiver)
    }

    async fn recv_event(receiver: &mut mpsc::Receiver<Event<TestMessage>>) -> Event<TestMessage> {
        timeout(Duration::from_secs(2), receiver.recv())
            .await
            .expect("timed out waiting for delivery")
            .expect("delivery channel closed")
    }

    #[test]
    fn publish_extension_defaults_to_flush() {
        assert!(NatsPublishExtension::default().flush);
        assert!(!NatsConnectExtension::default().drain_on_disconnect);
    }

    #[test]
    fn flush_option_reaches_the_extension() {
        let options: PublishOptions<NatsPublishExtension> =
            PublishOptions::from_options(vec![with_flush(false)]);

        assert!(!options.extension.flush);
    }

    #[test]
    fn credentials_option_fills_both_fields() {
        let options: BrokerOptions<NatsConnectExtension> =
            BrokerOptions::from_options(vec![with_credentials("svc", "secret")]);

        assert_eq!(options.extension.user.as_deref(), Some("svc"));
        assert_eq!(options.extension.password.as_deref(), Some("secret"));
    }

    #[test]
    fn header_conversion_round_trips() {
        let headers: Headers = [("traceparent", "00-aa-bb-01"), ("tenant", "acme")]
            .into_iter()
            .collect();

        let converted = from_nats_headers(&to_nats_headers(&headers));

        assert_eq!(converted, headers);
    }

    #[test]
    fn address_is_normalized_with_the_nats_scheme() {
        let broker = NatsBroker::new(vec![with_addrs(["localhost:4222"])]);

        assert_eq!(broker.name(), "nats");
        assert_eq!(broker.address(), "nats://localhost:4222");
        assert_eq!(NatsBroker::new(vec![]).address(), "nats://127.0.0.1:4222");
    }

    #[tokio::test]
    async fn operations_fail_before_connect() {
        let broker = NatsBroker::new(vec![]);

        let err = broker
            .publish("orders", &TestMessage::new("x"), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected));

        let err = broker
            .request_raw("orders", Bytes::new(), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected));

        let (handler, _receiver) = capture_channel();
        let err = broker
            .subscribe("orders", handler, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected));
    }

    #[tokio::test]
    async fn init_options_compose_with_construction() {
        let broker = NatsBroker::new(vec![with_codec(Codec::Json)]);

        broker.init(vec![with_codec(Codec::Cbor)]).await.unwrap();

        assert_eq!(broker.options().codec, Codec::Cbor);
    }

    #[tokio::test]
    async fn disconnect_before_connect_is_a_noop() {
        let broker = NatsBroker::new(vec![]);

        broker.disconnect().await.unwrap();
        broker.disconnect().await.unwrap();
    }

    #[tokio::test]
    #[serial]
    #[ignore = "requires a running NATS server"]
    async fn publish_reaches_a_typed_subscriber() {
        let broker = connected_broker().await;
        let topic = unique_topic("orders");
        let (handler, mut receiver) = capture_channel();
        broker.subscribe(&topic, handler, vec![]).await.unwrap();

        broker
            .publish(&topic, &TestMessage::new("hello"), vec![])
            .await
            .unwrap();

        let event = recv_event(&mut receiver).await;
        assert_eq!(event.topic(), topic);
        assert_eq!(*event.body(), TestMessage::new("hello"));

        broker.disconnect().await.unwrap();
    }

    #[tokio::test]
    #[serial]
    #[ignore = "requires a running NATS server"]
    async fn ten_messages_arrive_decoded_and_in_order() {
        let broker = connected_broker().await;
        let topic = unique_topic("test_topic");
        let (handler, mut receiver) = capture_channel();
        broker.subscribe(&topic, handler, vec![]).await.unwrap();

        for i in 0..10 {
            broker
                .publish(&topic, &TestMessage::new(&format!("msg-{i}")), vec![])
                .await
                .unwrap();
        }

        for i in 0..10 {
            let event = recv_event(&mut receiver).await;
            assert_eq!(*event.body(), TestMessage::new(&format!("msg-{i}")));
        }

        broker.disconnect().await.unwrap();
    }

    #[tokio::test]
    #[serial]
    #[ignore = "requires a running NATS server"]
    async fn connect_is_idempotent() {
        let broker = connected_broker().await;

        broker.connect().await.unwrap();
        broker.connect().await.unwrap();

        broker.disconnect().await.unwrap();
        broker.disconnect().await.unwrap();
    }

    #[tokio::test]
    #[serial]
    #[ignore = "requires a running NATS server"]
    async fn publish_headers_reach_the_consumer() {
        let broker = connected_broker().await;
        let topic = unique_topic("orders");
        let (handler, mut receiver) = capture_channel();
        broker.subscribe(&topic, handler, vec![]).await.unwrap();

        broker
            .publish(
                &topic,
                &TestMessage::new("with-headers"),
                vec![courier_broker::options::with_publish_header("tenant", "acme")],
            )
            .await
            .unwrap();

        let event = recv_event(&mut receiver).await;
        assert_eq!(event.headers().get("tenant"), Some("acme"));

        broker.disconnect().await.unwrap();
    }

    #[tokio::test]
    #[serial]
    #[ignore = "requires a running NATS server"]
    async fn request_reply_round_trips() {
        let broker = connected_broker().await;
        let topic = unique_topic("greeter");
        broker.subscribe(&topic, EchoHandler, vec![]).await.unwrap();

        let reply = broker
            .request(&topic, &TestMessage::new("ping"), vec![])
            .await
            .unwrap();

        let body: TestMessage = Codec::Json.unmarshal(&reply.payload).unwrap();
        assert_eq!(body, TestMessage::new("pong"));

        broker.disconnect().await.unwrap();
    }

    #[tokio::test]
    #[serial]
    #[ignore = "requires a running NATS server"]
    async fn request_headers_reach_the_responder() {
        let broker = connected_broker().await;
        let topic = unique_topic("tenants");
        broker
            .subscribe(&topic, HeaderEchoHandler, vec![])
            .await
            .unwrap();

        let reply = broker
            .request(
                &topic,
                &TestMessage::new("ping"),
                vec![with_request_header("tenant", "acme")],
            )
            .await
            .unwrap();

        let body: TestMessage = Codec::Json.unmarshal(&reply.payload).unwrap();
        assert_eq!(body, TestMessage::new("acme"));

        broker.disconnect().await.unwrap();
    }

    #[tokio::test]
    #[serial]
    #[ignore = "requires a running NATS server"]
    async fn request_without_responders_fails_fast() {
        let broker = connected_broker().await;
        let topic = unique_topic("silence");

        let err = broker
            .request(
                &topic,
                &TestMessage::new("anyone?"),
                vec![with_request_timeout(Duration::from_millis(500))],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::NoResponders));

        broker.disconnect().await.unwrap();
    }

    #[tokio::test]
    #[serial]
    #[ignore = "requires a running NATS server"]
    async fn queue_group_members_split_the_traffic() {
        let first_broker = connected_broker().await;
        let second_broker = connected_broker().await;
        let topic = unique_topic("jobs");

        let (first_handler, mut first_rx) = capture_channel();
        let (second_handler, mut second_rx) = capture_channel();
        first_broker
            .subscribe(&topic, first_handler, vec![with_queue("workers")])
            .await
            .unwrap();
        second_broker
            .subscribe(&topic, second_handler, vec![with_queue("workers")])
            .await
            .unwrap();

        let total = 20;
        for i in 0..total {
            first_broker
                .publish(&topic, &TestMessage::new(&format!("job-{i}")), vec![])
                .await
                .unwrap();
        }

        let mut first_count = 0;
        let mut second_count = 0;
        timeout(Duration::from_secs(5), async {
            for _ in 0..total {
                tokio::select! {
                    Some(_) = first_rx.recv() => first_count += 1,
                    Some(_) = second_rx.recv() => second_count += 1,
                }
            }
        })
        .await
        .expect("queue group deliveries missing");

        assert_eq!(first_count + second_count, total);
        assert!(first_count > 0, "first member starved");
        assert!(second_count > 0, "second member starved");

        first_broker.disconnect().await.unwrap();
        second_broker.disconnect().await.unwrap();
    }

    #[tokio::test]
    #[serial]
    #[ignore = "requires a running NATS server"]
    async fn unsubscribe_stops_delivery() {
        let broker = connected_broker().await;
        let topic = unique_topic("orders");
        let (handler, mut receiver) = capture_channel();
        let subscriber = broker.subscribe(&topic, handler, vec![]).await.unwrap();

        subscriber.unsubscribe().await.unwrap();
        subscriber.unsubscribe().await.unwrap();
        assert!(subscriber.is_closed());

        broker
            .publish(&topic, &TestMessage::new("ignored"), vec![])
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(receiver.try_recv().is_err());

        broker.disconnect().await.unwrap();
    }

    #[tokio::test]
    #[serial]
    #[ignore = "requires a running NATS server"]
    async fn drain_disconnect_closes_subscriptions() {
        let broker = NatsBroker::new(vec![with_addrs([nats_url()]), with_drain()]);
        broker.connect().await.unwrap();
        let topic = unique_topic("orders");
        let (handler, _receiver) = capture_channel();
        let subscriber = broker.subscribe(&topic, handler, vec![]).await.unwrap();

        broker.disconnect().await.unwrap();

        assert!(subscriber.is_closed());
    }
}
