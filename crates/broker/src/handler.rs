//! Subscription callback traits.

use std::error::Error;
use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;

use crate::message::{BoxError, Event, FailedDelivery};

/// Marker trait for handler errors.
pub trait HandlerError: Error + Send + Sync + 'static {}

/// A subscription's message callback.
///
/// Invoked once per inbound message with the decoded event. Returning an
/// error routes the delivery to the subscription's error handler and
/// suppresses automatic acknowledgement.
#[async_trait]
pub trait Handler<T = Bytes>
where
    Self: Send + Sync + 'static,
    T: Send + 'static,
{
    /// The error type for the handler.
    type Error: HandlerError;

    /// Processes one decoded event.
    async fn handle(&self, event: Event<T>) -> Result<(), Self::Error>;
}

/// Receives deliveries that failed to decode or whose handler errored.
///
/// The failed message is never acknowledged. A subscription without an
/// error handler only logs failures, so registering one is the integration
/// point for dead-letter routing or alerting.
#[async_trait]
pub trait ErrorHandler: Debug + Send + Sync + 'static {
    /// Processes one failed delivery.
    ///
    /// # Errors
    ///
    /// Errors returned here are logged and otherwise ignored; the delivery
    /// is already lost.
    async fn handle_error(&self, failure: FailedDelivery) -> Result<(), BoxError>;
}
