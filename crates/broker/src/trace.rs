//! Span lifecycle around every produce and consume operation.
//!
//! Tracing is an injected capability: a [`Tracer`] starts one span per
//! operation and the broker ends it through a [`SpanGuard`], which consumes
//! itself on finish so a span cannot be ended twice. Producer spans inject
//! a `traceparent` header into the outbound message; consumer spans extract
//! the remote parent from the inbound one.

use std::error::Error;
use std::fmt::{self, Debug};
use std::sync::Arc;

use uuid::Uuid;

use crate::message::Headers;

/// Propagation header injected into outbound messages, in W3C
/// `traceparent` format.
pub const TRACEPARENT_HEADER: &str = "traceparent";

/// Whether a span wraps a produce or a consume operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpanKind {
    /// An outbound publish or request.
    Producer,

    /// An inbound delivery.
    Consumer,
}

/// Key/value view over message metadata used for context propagation.
pub trait Carrier {
    /// Reads the value stored under `key`.
    fn get(&self, key: &str) -> Option<&str>;

    /// Writes `value` under `key`.
    fn set(&mut self, key: &str, value: String);
}

impl Carrier for Headers {
    fn get(&self, key: &str) -> Option<&str> {
        Self::get(self, key)
    }

    fn set(&mut self, key: &str, value: String) {
        self.insert(key, value);
    }
}

/// One started span, ended exactly once via [`ActiveSpan::end`].
pub trait ActiveSpan: Send {
    /// Ends the span, recording `error` when the operation failed.
    fn end(self: Box<Self>, error: Option<&(dyn Error + 'static)>);
}

/// The injected tracing capability.
pub trait Tracer: Debug + Send + Sync + 'static {
    /// Starts a span around one operation on `topic`.
    ///
    /// Producer starts may inject propagation headers into `carrier`;
    /// consumer starts may extract the remote parent from it. `system`
    /// names the backend, e.g. `"nats"`.
    fn start(
        &self,
        kind: SpanKind,
        system: &str,
        topic: &str,
        carrier: &mut dyn Carrier,
    ) -> Box<dyn ActiveSpan>;
}

/// Completion token for one started span.
///
/// `finish` consumes the guard so the span ends exactly once. Dropping an
/// unfinished guard ends the span without an error, so an early return
/// cannot leak one.
pub struct SpanGuard {
    span: Option<Box<dyn ActiveSpan>>,
}

impl SpanGuard {
    /// A guard that does nothing, used when tracing is disabled.
    #[must_use]
    pub const fn noop() -> Self {
        Self { span: None }
    }

    pub(crate) fn active(span: Box<dyn ActiveSpan>) -> Self {
        Self { span: Some(span) }
    }

    /// Ends the span with the operation's outcome.
    pub fn finish(mut self, error: Option<&(dyn Error + 'static)>) {
        if let Some(span) = self.span.take() {
            span.end(error);
        }
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        if let Some(span) = self.span.take() {
            span.end(None);
        }
    }
}

impl Debug for SpanGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpanGuard")
            .field("active", &self.span.is_some())
            .finish()
    }
}

/// Span helper owned by a broker.
///
/// Wraps the injected [`Tracer`] with the backend's system name, or hands
/// out no-op guards when tracing is disabled.
#[derive(Clone, Debug)]
pub struct OperationTracer {
    system: &'static str,
    inner: Option<Arc<dyn Tracer>>,
}

impl OperationTracer {
    /// Wraps `tracer` for the backend named `system`.
    #[must_use]
    pub const fn new(system: &'static str, tracer: Option<Arc<dyn Tracer>>) -> Self {
        Self {
            system,
            inner: tracer,
        }
    }

    /// A tracer whose guards are all no-ops.
    #[must_use]
    pub const fn disabled(system: &'static str) -> Self {
        Self {
            system,
            inner: None,
        }
    }

    /// Starts the span for an outbound message, injecting propagation
    /// headers into `headers`.
    #[must_use]
    pub fn start_producer(&self, topic: &str, headers: &mut Headers) -> SpanGuard {
        self.start(SpanKind::Producer, topic, headers)
    }

    /// Starts the span for an inbound message, extracting the remote
    /// parent from `headers`.
    #[must_use]
    pub fn start_consumer(&self, topic: &str, headers: &mut Headers) -> SpanGuard {
        self.start(SpanKind::Consumer, topic, headers)
    }

    fn start(&self, kind: SpanKind, topic: &str, headers: &mut Headers) -> SpanGuard {
        match &self.inner {
            Some(tracer) => SpanGuard::active(tracer.start(kind, self.system, topic, headers)),
            None => SpanGuard::noop(),
        }
    }
}

/// Parsed W3C `traceparent` value: `00-{trace_id}-{span_id}-{flags}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TraceContext {
    /// 128-bit trace identifier shared by every span in the trace.
    pub trace_id: u128,

    /// 64-bit identifier of the current span.
    pub span_id: u64,
}

impl TraceContext {
    /// Creates a fresh root context with random identifiers.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            trace_id: Uuid::new_v4().as_u128(),
            span_id: Uuid::new_v4().as_u64_pair().0,
        }
    }

    /// Derives a child context: same trace, fresh span identifier.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: Uuid::new_v4().as_u64_pair().0,
        }
    }

    /// Parses a `traceparent` header value.
    ///
    /// Returns `None` for malformed values, unknown versions and the
    /// all-zero identifiers the W3C format reserves as invalid.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.split('-');
        let version = parts.next()?;
        let trace_field = parts.next()?;
        let span_field = parts.next()?;
        let _flags = parts.next()?;

        if version != "00" || trace_field.len() != 32 || span_field.len() != 16 {
            return None;
        }

        let trace_id = u128::from_str_radix(trace_field, 16).ok()?;
        let span_id = u64::from_str_radix(span_field, 16).ok()?;
        if trace_id == 0 || span_id == 0 {
            return None;
        }

        Some(Self { trace_id, span_id })
    }

    /// Formats the context as a `traceparent` header value with the
    /// sampled flag set.
    #[must_use]
    pub fn to_traceparent(&self) -> String {
        format!("00-{:032x}-{:016x}-01", self.trace_id, self.span_id)
    }
}

/// [`Tracer`] backed by the `tracing` crate.
///
/// Emits one span per operation carrying the messaging system, topic and
/// trace identifiers as fields. Producer spans always stamp a fresh
/// `traceparent` header onto the outbound message, as a child of any
/// parent the message already carries; consumer spans continue the trace
/// the inbound header describes. Errors are recorded inside the span when
/// it ends.
#[derive(Clone, Copy, Debug, Default)]
pub struct SpanTracer;

impl Tracer for SpanTracer {
    fn start(
        &self,
        kind: SpanKind,
        system: &str,
        topic: &str,
        carrier: &mut dyn Carrier,
    ) -> Box<dyn ActiveSpan> {
        let remote = carrier
            .get(TRACEPARENT_HEADER)
            .and_then(TraceContext::parse);
        let context = remote.map_or_else(TraceContext::generate, |parent| parent.child());

        if kind == SpanKind::Producer {
            carrier.set(TRACEPARENT_HEADER, context.to_traceparent());
        }

        let trace_id = format!("{:032x}", context.trace_id);
        let span_id = format!("{:016x}", context.span_id);
        let span = match kind {
            SpanKind::Producer => tracing::info_span!(
                "message_publish",
                messaging.system = %system,
                messaging.destination = %topic,
                trace_id = %trace_id,
                span_id = %span_id,
            ),
            SpanKind::Consumer => tracing::info_span!(
                "message_receive",
                messaging.system = %system,
                messaging.destination = %topic,
                trace_id = %trace_id,
                span_id = %span_id,
            ),
        };

        Box::new(TracingSpan { span })
    }
}

struct TracingSpan {
    span: tracing::Span,
}

impl ActiveSpan for TracingSpan {
    fn end(self: Box<Self>, error: Option<&(dyn Error + 'static)>) {
        if let Some(error) = error {
            let _entered = self.span.enter();
            tracing::warn!(error = %error, "operation failed");
        }
    }
}
