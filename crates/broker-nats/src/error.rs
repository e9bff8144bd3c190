//! Error types for the NATS broker.

use std::time::Duration;

use courier_broker::broker::BrokerError;
use courier_broker::codec::CodecError;
use thiserror::Error;

/// Errors that can occur in this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Operation attempted on a broker that is not connected.
    #[error("nats broker is not connected")]
    NotConnected,

    /// Establishing the connection failed.
    #[error("nats connect failed: {0}")]
    Connect(#[from] async_nats::ConnectError),

    /// Message body transformation failed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The server rejected or dropped a publish.
    #[error("nats publish failed: {0}")]
    Publish(#[from] async_nats::PublishError),

    /// Flushing buffered writes to the server failed.
    #[error("nats flush failed: {0}")]
    Flush(#[from] async_nats::client::FlushError),

    /// Creating the subscription failed.
    #[error("nats subscribe failed: {0}")]
    Subscribe(#[from] async_nats::SubscribeError),

    /// The request failed at the server.
    #[error("nats request failed: {0}")]
    Request(async_nats::RequestError),

    /// No subscriber was listening on the request topic.
    #[error("no responders on request topic")]
    NoResponders,

    /// No reply arrived within the request window.
    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// Graceful drain failed during disconnect.
    #[error("nats drain failed: {0}")]
    Drain(String),
}

impl BrokerError for Error {}
