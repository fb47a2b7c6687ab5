//! Application handlers for inbound messages and requests.
//!
//! Frames are dispatched by `handle` name. A handler that does not want a
//! frame returns it in [`Outcome::Declined`]; the fallback handler, if any,
//! gets it next. A frame nobody takes is reported as not handled, and an
//! unanswered request is answered with a `message_nothandled` error.

use crate::reply::Responder;
use async_trait::async_trait;
use parking_lot::RwLock;
use ricochet_protocol::Frame;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// An inbound message or request, with its body already opened.
pub struct Incoming {
    pub frame: Frame,
    /// Present for requests only.
    pub responder: Option<Responder>,
}

impl Incoming {
    pub fn handle(&self) -> &str {
        &self.frame.headers.handle
    }

    /// Sender channel.
    pub fn from(&self) -> &str {
        &self.frame.headers.from
    }

    pub fn body(&self) -> &Value {
        &self.frame.body
    }

    pub fn is_request(&self) -> bool {
        self.frame.is_request()
    }

    pub fn take_responder(&mut self) -> Option<Responder> {
        self.responder.take()
    }
}

/// Result of offering a frame to a handler.
pub enum Outcome {
    Handled,
    Declined(Incoming),
}

/// Handles frames for one or more handle names.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, incoming: Incoming) -> Outcome;
}

/// Adapts an async closure into a [`Handler`].
pub struct HandlerFn<F>(F);

/// Wraps `f` as a handler.
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Incoming) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Outcome> + Send + 'static,
{
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Incoming) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Outcome> + Send + 'static,
{
    async fn call(&self, incoming: Incoming) -> Outcome {
        (self.0)(incoming).await
    }
}

#[derive(Default)]
pub(crate) struct Handlers {
    named: RwLock<HashMap<String, Arc<dyn Handler>>>,
    fallback: RwLock<Option<Arc<dyn Handler>>>,
}

impl Handlers {
    pub fn insert(&self, name: String, handler: Arc<dyn Handler>) -> bool {
        self.named.write().insert(name, handler).is_some()
    }

    pub fn remove(&self, name: &str) -> bool {
        self.named.write().remove(name).is_some()
    }

    pub fn set_fallback(&self, handler: Option<Arc<dyn Handler>>) {
        *self.fallback.write() = handler;
    }

    pub fn clear(&self) {
        self.named.write().clear();
        *self.fallback.write() = None;
    }

    pub fn len(&self) -> usize {
        self.named.read().len()
    }

    /// Offers the frame to its named handler, then to the fallback.
    pub async fn dispatch(&self, incoming: Incoming) -> Outcome {
        let named = self.named.read().get(incoming.handle()).cloned();
        let incoming = match named {
            Some(handler) => match handler.call(incoming).await {
                Outcome::Handled => return Outcome::Handled,
                Outcome::Declined(incoming) => incoming,
            },
            None => incoming,
        };

        let fallback = self.fallback.read().clone();
        match fallback {
            Some(handler) => handler.call(incoming).await,
            None => Outcome::Declined(incoming),
        }
    }
}
