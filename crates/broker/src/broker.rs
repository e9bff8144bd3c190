//! The backend-agnostic broker contract.

use std::error::Error;
use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;

use crate::handler::Handler;
use crate::message::Message;
use crate::options::{
    BrokerOption, BrokerOptions, PublishOption, RequestOption, SubscribeOption,
};

/// Marker trait for broker errors.
pub trait BrokerError: Error + Send + Sync + 'static {}

/// Connection lifecycle notifications delivered on the opt-in event
/// stream.
///
/// These carry failures with no owning call, such as a connection dropped
/// between operations. Per-operation failures are returned from the
/// operation itself, never duplicated here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The backend established or re-established its connection.
    Connected,

    /// The backend lost its connection.
    Disconnected,

    /// An asynchronous backend error.
    Error(String),
}

/// Handle to one active subscription.
#[async_trait]
pub trait Subscriber
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// The error type for the subscriber.
    type Error: BrokerError;

    /// The topic this subscription consumes.
    fn topic(&self) -> &str;

    /// Returns `true` once delivery has stopped.
    fn is_closed(&self) -> bool;

    /// Stops delivery and removes this subscription from its broker's
    /// registry. Unsubscribing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the backend's teardown error.
    async fn unsubscribe(&self) -> Result<(), Self::Error>;

    /// Stops delivery without touching the registry.
    ///
    /// Called by the registry while it drains itself during disconnect;
    /// applications should call [`unsubscribe`](Self::unsubscribe)
    /// instead.
    ///
    /// # Errors
    ///
    /// Returns the backend's teardown error.
    async fn close(&self) -> Result<(), Self::Error>;
}

/// The uniform publish/subscribe contract implemented by every backend.
///
/// Lifecycle: construct, [`init`](Self::init), [`connect`](Self::connect),
/// then publish/subscribe/request, then [`disconnect`](Self::disconnect).
/// `connect` and `disconnect` are idempotent, and a disconnected broker may
/// connect again.
#[async_trait]
pub trait Broker
where
    Self: Debug + Send + Sync + 'static,
{
    /// The error type for the backend.
    type Error: BrokerError;

    /// Backend-specific connection settings.
    type ConnectExtension: Clone + Debug + Default + Send + Sync + 'static;

    /// Backend-specific publish settings.
    type PublishExtension: Clone + Debug + Default + Send + Sync + 'static;

    /// Backend-specific subscribe settings.
    type SubscribeExtension: Clone + Debug + Default + Send + Sync + 'static;

    /// Backend-specific request settings.
    type RequestExtension: Clone + Debug + Default + Send + Sync + 'static;

    /// The subscription handle type.
    type Subscriber: Subscriber;

    /// The backend identifier, e.g. `"nats"`.
    fn name(&self) -> &'static str;

    /// The first configured endpoint, normalized to carry the backend's
    /// URL scheme.
    fn address(&self) -> String;

    /// A snapshot of the current broker options.
    fn options(&self) -> BrokerOptions<Self::ConnectExtension>;

    /// Applies `opts` on top of the options given at construction; the two
    /// lists compose. Idempotent and callable before or after `connect`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when an option is invalid for the
    /// backend.
    async fn init(&self, opts: Vec<BrokerOption<Self::ConnectExtension>>)
    -> Result<(), Self::Error>;

    /// Establishes the backend connection.
    ///
    /// Succeeds immediately when already connected or while the backend is
    /// reconnecting on its own.
    ///
    /// # Errors
    ///
    /// Returns a connectivity error when the backend is unreachable.
    async fn connect(&self) -> Result<(), Self::Error>;

    /// Drains in-flight work if so configured, closes every subscription
    /// and tears down the connection. Idempotent once disconnected.
    ///
    /// # Errors
    ///
    /// Returns the backend's teardown error; the registry is cleared even
    /// on failure.
    async fn disconnect(&self) -> Result<(), Self::Error>;

    /// Serializes `msg` with the configured codec and publishes it to
    /// `topic`, blocking until the backend accepted the message.
    ///
    /// # Errors
    ///
    /// Fails when the broker is not connected, serialization fails or the
    /// backend rejects the send.
    async fn publish<T>(
        &self,
        topic: &str,
        msg: &T,
        opts: Vec<PublishOption<Self::PublishExtension>>,
    ) -> Result<(), Self::Error>
    where
        T: Serialize + Sync;

    /// Publishes a pre-encoded payload, bypassing the codec.
    ///
    /// # Errors
    ///
    /// Fails when the broker is not connected or the backend rejects the
    /// send.
    async fn publish_raw(
        &self,
        topic: &str,
        payload: Bytes,
        opts: Vec<PublishOption<Self::PublishExtension>>,
    ) -> Result<(), Self::Error>;

    /// Registers `handler` for `topic`, decoding inbound bodies into `T`
    /// with the configured codec.
    ///
    /// # Errors
    ///
    /// Fails when the broker is not connected or the backend rejects the
    /// subscription.
    async fn subscribe<T, H>(
        &self,
        topic: &str,
        handler: H,
        opts: Vec<SubscribeOption<Self::SubscribeExtension>>,
    ) -> Result<Self::Subscriber, Self::Error>
    where
        T: DeserializeOwned + Send + 'static,
        H: Handler<T>;

    /// Registers `handler` for `topic` with raw `Bytes` bodies, bypassing
    /// the codec.
    ///
    /// # Errors
    ///
    /// Fails when the broker is not connected or the backend rejects the
    /// subscription.
    async fn subscribe_raw<H>(
        &self,
        topic: &str,
        handler: H,
        opts: Vec<SubscribeOption<Self::SubscribeExtension>>,
    ) -> Result<Self::Subscriber, Self::Error>
    where
        H: Handler<Bytes>;

    /// Serializes `msg`, sends it to `topic` and waits for a single reply.
    ///
    /// # Errors
    ///
    /// Fails when the broker is not connected, serialization fails, no
    /// subscriber is listening or no reply arrives within the configured
    /// window.
    async fn request<T>(
        &self,
        topic: &str,
        msg: &T,
        opts: Vec<RequestOption<Self::RequestExtension>>,
    ) -> Result<Message, Self::Error>
    where
        T: Serialize + Sync;

    /// Sends a pre-encoded request payload and waits for a single reply.
    ///
    /// # Errors
    ///
    /// Fails when the broker is not connected, no subscriber is listening
    /// or no reply arrives within the configured window.
    async fn request_raw(
        &self,
        topic: &str,
        payload: Bytes,
        opts: Vec<RequestOption<Self::RequestExtension>>,
    ) -> Result<Message, Self::Error>;

    /// Subscribes to asynchronous connection events.
    ///
    /// Events are broadcast; each receiver sees its own copy and slow
    /// receivers may observe lag rather than block the broker.
    fn events(&self) -> broadcast::Receiver<ConnectionEvent>;
}
