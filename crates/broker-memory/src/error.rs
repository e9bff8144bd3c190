//! Error types for the memory broker.

use std::time::Duration;

use courier_broker::broker::BrokerError;
use courier_broker::codec::CodecError;
use thiserror::Error;

/// Errors that can occur in this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Operation attempted on a broker that is not connected.
    #[error("memory broker is not connected")]
    NotConnected,

    /// Message body transformation failed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// No reply arrived within the request window.
    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),
}

impl BrokerError for Error {}
