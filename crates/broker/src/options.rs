//! Layered configuration for each operation scope.
//!
//! Every scope (broker, publish, subscribe, request) is a plain struct of
//! defaults mutated by an ordered list of boxed option functions. Lists are
//! folded left to right, so applying the same option twice is
//! last-write-wins, and broker-level lists compose across construction and
//! `init`. Backend-specific settings live in the typed `extension` field
//! rather than a stringly-typed bag, so unrelated backends cannot collide.

use std::sync::Arc;
use std::time::Duration;

use crate::codec::{Codec, CodecError};
use crate::handler::ErrorHandler;
use crate::message::Headers;
use crate::trace::Tracer;

/// Reply window applied when no request option overrides it.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// A single mutation of [`BrokerOptions`].
pub type BrokerOption<E> = Box<dyn FnOnce(&mut BrokerOptions<E>) + Send>;

/// A single mutation of [`PublishOptions`].
pub type PublishOption<E> = Box<dyn FnOnce(&mut PublishOptions<E>) + Send>;

/// A single mutation of [`SubscribeOptions`].
pub type SubscribeOption<E> = Box<dyn FnOnce(&mut SubscribeOptions<E>) + Send>;

/// A single mutation of [`RequestOptions`].
pub type RequestOption<E> = Box<dyn FnOnce(&mut RequestOptions<E>) + Send>;

/// Connection-scoped configuration shared by every backend.
#[derive(Clone, Debug, Default)]
pub struct BrokerOptions<E> {
    /// Backend endpoints. Normalized by the backend to carry its URL
    /// scheme; empty means the backend's canonical local endpoint.
    pub addrs: Vec<String>,

    /// Codec applied by the typed publish, subscribe and request
    /// operations.
    pub codec: Codec,

    /// Tracing capability wrapped around every produce and consume
    /// operation. `None` disables span creation entirely.
    pub tracer: Option<Arc<dyn Tracer>>,

    /// Backend-specific connection settings.
    pub extension: E,
}

impl<E> BrokerOptions<E> {
    /// Folds `opts` over the defaults.
    #[must_use]
    pub fn from_options(opts: Vec<BrokerOption<E>>) -> Self
    where
        E: Default,
    {
        let mut options = Self::default();
        options.apply(opts);
        options
    }

    /// Applies `opts` in order on top of the current values.
    ///
    /// Called again at `init` time so construction-time and init-time lists
    /// compose instead of overwriting each other.
    pub fn apply(&mut self, opts: Vec<BrokerOption<E>>) {
        for opt in opts {
            opt(self);
        }
    }
}

/// Sets the backend endpoints.
#[must_use]
pub fn with_addrs<E, I, S>(addrs: I) -> BrokerOption<E>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let addrs: Vec<String> = addrs.into_iter().map(Into::into).collect();
    Box::new(move |options| options.addrs = addrs)
}

/// Selects the codec for the typed operations.
#[must_use]
pub fn with_codec<E>(codec: Codec) -> BrokerOption<E> {
    Box::new(move |options| options.codec = codec)
}

/// Selects the codec by its configuration name.
///
/// # Errors
///
/// Returns [`CodecError::UnknownName`] for unregistered names, so a
/// misconfigured codec surfaces before the broker is built.
pub fn with_codec_name<E>(name: &str) -> Result<BrokerOption<E>, CodecError> {
    Codec::from_name(name).map(with_codec)
}

/// Injects the tracing capability wrapped around every operation.
#[must_use]
pub fn with_tracer<E>(tracer: Arc<dyn Tracer>) -> BrokerOption<E> {
    Box::new(move |options| options.tracer = Some(tracer))
}

/// Mutates the backend-specific connection settings.
#[must_use]
pub fn with_broker_extension<E, F>(f: F) -> BrokerOption<E>
where
    F: FnOnce(&mut E) + Send + 'static,
{
    Box::new(move |options| f(&mut options.extension))
}

/// Publish-scoped configuration.
#[derive(Clone, Debug, Default)]
pub struct PublishOptions<E> {
    /// Headers merged into the outbound message before send.
    pub headers: Headers,

    /// Backend-specific publish settings.
    pub extension: E,
}

impl<E> PublishOptions<E> {
    /// Folds `opts` over the defaults.
    #[must_use]
    pub fn from_options(opts: Vec<PublishOption<E>>) -> Self
    where
        E: Default,
    {
        let mut options = Self::default();
        for opt in opts {
            opt(&mut options);
        }
        options
    }
}

/// Adds one header to the outbound message.
#[must_use]
pub fn with_publish_header<E>(key: impl Into<String>, value: impl Into<String>) -> PublishOption<E> {
    let (key, value) = (key.into(), value.into());
    Box::new(move |options| options.headers.insert(key, value))
}

/// Merges `headers` into the outbound message, overwriting duplicates.
#[must_use]
pub fn with_publish_headers<E>(headers: Headers) -> PublishOption<E> {
    Box::new(move |options| options.headers.merge(&headers))
}

/// Mutates the backend-specific publish settings.
#[must_use]
pub fn with_publish_extension<E, F>(f: F) -> PublishOption<E>
where
    F: FnOnce(&mut E) + Send + 'static,
{
    Box::new(move |options| f(&mut options.extension))
}

/// Subscribe-scoped configuration.
#[derive(Clone, Debug)]
pub struct SubscribeOptions<E> {
    /// Queue group. Subscribers sharing a group split the topic's traffic;
    /// ungrouped subscribers each receive every message.
    pub queue: Option<String>,

    /// Acknowledge automatically after the handler succeeds. On by
    /// default.
    pub auto_ack: bool,

    /// Receives failed deliveries. Without one, failures are only logged.
    pub error_handler: Option<Arc<dyn ErrorHandler>>,

    /// Backend-specific subscribe settings.
    pub extension: E,
}

impl<E: Default> Default for SubscribeOptions<E> {
    fn default() -> Self {
        Self {
            queue: None,
            auto_ack: true,
            error_handler: None,
            extension: E::default(),
        }
    }
}

impl<E> SubscribeOptions<E> {
    /// Folds `opts` over the defaults.
    #[must_use]
    pub fn from_options(opts: Vec<SubscribeOption<E>>) -> Self
    where
        E: Default,
    {
        let mut options = Self::default();
        for opt in opts {
            opt(&mut options);
        }
        options
    }
}

/// Joins the subscription to a queue group.
#[must_use]
pub fn with_queue<E>(group: impl Into<String>) -> SubscribeOption<E> {
    let group = group.into();
    Box::new(move |options| options.queue = Some(group))
}

/// Enables or disables automatic acknowledgement after handler success.
#[must_use]
pub fn with_auto_ack<E>(auto_ack: bool) -> SubscribeOption<E> {
    Box::new(move |options| options.auto_ack = auto_ack)
}

/// Registers the callback for failed deliveries.
#[must_use]
pub fn with_error_handler<E>(handler: Arc<dyn ErrorHandler>) -> SubscribeOption<E> {
    Box::new(move |options| options.error_handler = Some(handler))
}

/// Mutates the backend-specific subscribe settings.
#[must_use]
pub fn with_subscribe_extension<E, F>(f: F) -> SubscribeOption<E>
where
    F: FnOnce(&mut E) + Send + 'static,
{
    Box::new(move |options| f(&mut options.extension))
}

/// Request-scoped configuration.
#[derive(Clone, Debug)]
pub struct RequestOptions<E> {
    /// Headers merged into the outbound request.
    pub headers: Headers,

    /// How long to wait for a reply before giving up.
    pub timeout: Duration,

    /// Backend-specific request settings.
    pub extension: E,
}

impl<E: Default> Default for RequestOptions<E> {
    fn default() -> Self {
        Self {
            headers: Headers::new(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            extension: E::default(),
        }
    }
}

impl<E> RequestOptions<E> {
    /// Folds `opts` over the defaults.
    #[must_use]
    pub fn from_options(opts: Vec<RequestOption<E>>) -> Self
    where
        E: Default,
    {
        let mut options = Self::default();
        for opt in opts {
            opt(&mut options);
        }
        options
    }
}

/// Adds one header to the outbound request.
#[must_use]
pub fn with_request_header<E>(key: impl Into<String>, value: impl Into<String>) -> RequestOption<E> {
    let (key, value) = (key.into(), value.into());
    Box::new(move |options| options.headers.insert(key, value))
}

/// Merges `headers` into the outbound request, overwriting duplicates.
#[must_use]
pub fn with_request_headers<E>(headers: Headers) -> RequestOption<E> {
    Box::new(move |options| options.headers.merge(&headers))
}

/// Overrides the reply window.
#[must_use]
pub fn with_request_timeout<E>(timeout: Duration) -> RequestOption<E> {
    Box::new(move |options| options.timeout = timeout)
}

/// Mutates the backend-specific request settings.
#[must_use]
pub fn with_request_extension<E, F>(f: F) -> RequestOption<E>
where
    F: FnOnce(&mut E) + Send + 'static,
{
    Box::new(move |options| f(&mut options.extension))
}

/// Normalizes `addrs` so every entry carries a URL scheme, falling back to
/// `default_addr` when the list is empty.
#[must_use]
pub fn normalize_addrs(addrs: &[String], scheme: &str, default_addr: &str) -> Vec<String> {
    if addrs.is_empty() {
        return vec![default_addr.to_string()];
    }

    addrs
        .iter()
        .map(|addr| {
            if addr.contains("://") {
                addr.clone()
            } else {
                format!("{scheme}://{addr}")
            }
        })
        .collect()
}
