//! Message envelopes shared by every backend.
//!
//! A [`Message`] is the wire-level pair of headers and opaque payload. An
//! [`Event`] is what a subscription handler sees: the decoded body together
//! with the originating topic and the backend capabilities for
//! acknowledgement and request replies.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Boxed error used by backend-attached capabilities and error handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// String key/value metadata carried alongside every message payload.
///
/// Backends translate their native header maps to and from this type, and
/// the tracing layer reads and writes it for context propagation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Headers(HashMap<String, String>);

impl Headers {
    /// Creates an empty header map.
    #[must_use]
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    /// Returns the value stored under `key`, if any.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Sets `key` to `value`, replacing any previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Removes `key`, returning the previous value if one was set.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    /// Copies every entry of `other` into `self`, overwriting duplicates.
    pub fn merge(&mut self, other: &Self) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` when the map holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over entries in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K, V> FromIterator<(K, V)> for Headers
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl IntoIterator for Headers {
    type Item = (String, String);
    type IntoIter = std::collections::hash_map::IntoIter<String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// A wire-level message: headers plus an opaque payload.
///
/// This is what the raw publish operations send and what requests return.
/// Decoded bodies only exist inside [`Event`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    /// Metadata delivered with the payload.
    pub headers: Headers,

    /// The serialized body.
    pub payload: Bytes,
}

impl Message {
    /// Creates a message with empty headers.
    #[must_use]
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            headers: Headers::new(),
            payload: payload.into(),
        }
    }

    /// Creates a message with the given headers.
    #[must_use]
    pub fn with_headers(headers: Headers, payload: impl Into<Bytes>) -> Self {
        Self {
            headers,
            payload: payload.into(),
        }
    }
}

/// Backend acknowledgement capability attached to inbound events.
#[async_trait]
pub trait Acker: Debug + Send + Sync {
    /// Acknowledges the message with the backend.
    async fn ack(&self) -> Result<(), BoxError>;
}

/// Reply capability attached to events that arrived with a reply address.
#[async_trait]
pub trait Replier: Debug + Send + Sync {
    /// Sends `reply` back to the requester.
    async fn reply(&self, reply: Message) -> Result<(), BoxError>;
}

/// Error returned when replying to an event without a reply address.
#[derive(Debug, Error)]
#[error("event has no reply address")]
pub struct NoReplyAddress;

/// A decoded inbound message as seen by a subscription handler.
///
/// Carries the originating topic, the translated headers, the decoded body
/// and the capabilities the backend attached at delivery time.
#[derive(Clone, Debug)]
pub struct Event<T = Bytes> {
    topic: String,
    headers: Headers,
    body: T,
    acker: Option<Arc<dyn Acker>>,
    replier: Option<Arc<dyn Replier>>,
}

impl<T> Event<T> {
    /// Assembles an event from its parts.
    ///
    /// Backends call this from their delivery loops; applications normally
    /// only construct events directly in tests.
    #[must_use]
    pub fn new(topic: impl Into<String>, headers: Headers, body: T) -> Self {
        Self {
            topic: topic.into(),
            headers,
            body,
            acker: None,
            replier: None,
        }
    }

    /// Attaches an acknowledgement capability.
    #[must_use]
    pub fn with_acker(mut self, acker: Arc<dyn Acker>) -> Self {
        self.acker = Some(acker);
        self
    }

    /// Attaches a reply capability.
    #[must_use]
    pub fn with_replier(mut self, replier: Arc<dyn Replier>) -> Self {
        self.replier = Some(replier);
        self
    }

    /// The topic this message arrived on.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Headers delivered with the message.
    #[must_use]
    pub const fn headers(&self) -> &Headers {
        &self.headers
    }

    /// The decoded body.
    #[must_use]
    pub const fn body(&self) -> &T {
        &self.body
    }

    /// Consumes the event, returning the decoded body.
    #[must_use]
    pub fn into_body(self) -> T {
        self.body
    }

    /// Acknowledges the message with the backend.
    ///
    /// A no-op when the backend attached no acknowledgement capability.
    ///
    /// # Errors
    ///
    /// Returns the backend's acknowledgement error.
    pub async fn ack(&self) -> Result<(), BoxError> {
        match &self.acker {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }

    /// Returns `true` when this event arrived with a reply address.
    #[must_use]
    pub const fn can_reply(&self) -> bool {
        self.replier.is_some()
    }

    /// Sends `reply` back to the requester.
    ///
    /// # Errors
    ///
    /// Returns [`NoReplyAddress`] when the event carries no reply address,
    /// or the backend's send error.
    pub async fn reply(&self, reply: Message) -> Result<(), BoxError> {
        match &self.replier {
            Some(replier) => replier.reply(reply).await,
            None => Err(Box::new(NoReplyAddress)),
        }
    }
}

/// A delivery that failed to decode or whose handler returned an error.
///
/// Handed to the subscription's error handler with the raw payload exactly
/// as received; a decode failure means no typed body ever existed. The
/// message is never acknowledged on this path.
#[derive(Debug)]
pub struct FailedDelivery {
    /// The topic the message arrived on.
    pub topic: String,

    /// Headers delivered with the message.
    pub headers: Headers,

    /// The raw payload as received.
    pub payload: Bytes,

    /// What went wrong.
    pub error: BoxError,
}
