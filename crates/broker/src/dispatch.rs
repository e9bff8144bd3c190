//! The consume pipeline shared by every backend's delivery loop.

use std::error::Error;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::codec::{Codec, CodecError};
use crate::handler::{ErrorHandler, Handler};
use crate::message::{Acker, Event, FailedDelivery, Headers, Replier};
use crate::trace::OperationTracer;

type DecodeFn<T> = Box<dyn Fn(&Bytes) -> Result<T, CodecError> + Send + Sync>;

/// Per-subscription consume pipeline.
///
/// Backends build one of these at subscribe time and call
/// [`dispatch`](Self::dispatch) once per inbound message. The sequence is
/// fixed: start the consumer span with the propagated parent, decode the
/// body, invoke the handler, acknowledge on success when auto-ack is on,
/// route failures to the error handler, and end the span exactly once with
/// the terminal error. Failed deliveries are never acknowledged.
pub struct Dispatcher<T, H> {
    topic: String,
    decode: DecodeFn<T>,
    handler: H,
    auto_ack: bool,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    tracer: OperationTracer,
}

impl<T, H> Dispatcher<T, H>
where
    T: Send + 'static,
    H: Handler<T>,
{
    /// Pipeline decoding bodies into `T` with `codec`.
    pub fn typed(
        topic: impl Into<String>,
        codec: Codec,
        handler: H,
        auto_ack: bool,
        error_handler: Option<Arc<dyn ErrorHandler>>,
        tracer: OperationTracer,
    ) -> Self
    where
        T: DeserializeOwned,
    {
        Self {
            topic: topic.into(),
            decode: Box::new(move |payload| codec.unmarshal(payload)),
            handler,
            auto_ack,
            error_handler,
            tracer,
        }
    }

    /// The topic this pipeline consumes.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Processes one inbound message end to end.
    pub async fn dispatch(
        &self,
        mut headers: Headers,
        payload: Bytes,
        acker: Option<Arc<dyn Acker>>,
        replier: Option<Arc<dyn Replier>>,
    ) {
        let span = self.tracer.start_consumer(&self.topic, &mut headers);

        let body = match (self.decode)(&payload) {
            Ok(body) => body,
            Err(error) => {
                span.finish(Some(&error));
                self.fail(headers, payload, Box::new(error)).await;
                return;
            }
        };

        let mut event = Event::new(self.topic.clone(), headers.clone(), body);
        if let Some(acker) = &acker {
            event = event.with_acker(Arc::clone(acker));
        }
        if let Some(replier) = &replier {
            event = event.with_replier(Arc::clone(replier));
        }

        match self.handler.handle(event).await {
            Ok(()) => {
                if self.auto_ack {
                    if let Some(acker) = &acker {
                        if let Err(error) = acker.ack().await {
                            warn!(topic = %self.topic, %error, "acknowledgement failed");
                        }
                    }
                }
                span.finish(None);
            }
            Err(error) => {
                span.finish(Some(&error));
                self.fail(headers, payload, Box::new(error)).await;
            }
        }
    }

    async fn fail(
        &self,
        headers: Headers,
        payload: Bytes,
        error: Box<dyn Error + Send + Sync>,
    ) {
        match &self.error_handler {
            Some(handler) => {
                let failure = FailedDelivery {
                    topic: self.topic.clone(),
                    headers,
                    payload,
                    error,
                };
                if let Err(error) = handler.handle_error(failure).await {
                    warn!(topic = %self.topic, %error, "error handler failed");
                }
            }
            None => {
                warn!(topic = %self.topic, %error, "dropping failed delivery; no error handler registered");
            }
        }
    }
}

impl<H> Dispatcher<Bytes, H>
where
    H: Handler<Bytes>,
{
    /// Pipeline passing raw payloads through untouched.
    pub fn raw(
        topic: impl Into<String>,
        handler: H,
        auto_ack: bool,
        error_handler: Option<Arc<dyn ErrorHandler>>,
        tracer: OperationTracer,
    ) -> Self {
        Self {
            topic: topic.into(),
            decode: Box::new(|payload| Ok(payload.clone())),
            handler,
            auto_ack,
            error_handler,
            tracer,
        }
    }
}
