//! Abstract interface for pluggable publish/subscribe brokers.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Brokers expose one uniform publish/subscribe contract per backend.
pub mod broker;

/// Codecs serialize message bodies, selected by name.
pub mod codec;

/// The consume pipeline shared by every backend's delivery loop.
pub mod dispatch;

/// Handlers process decoded events; error handlers receive failed
/// deliveries.
pub mod handler;

/// Message envelopes, headers and delivery capabilities.
pub mod message;

/// Layered functional options for the broker, publish, subscribe and
/// request scopes.
pub mod options;

/// Bookkeeping of active subscriptions per broker.
pub mod registry;

/// Span lifecycle around every produce and consume operation.
pub mod trace;
