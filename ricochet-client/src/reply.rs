//! Both ends of a request.
//!
//! The requester holds a [`PendingReply`] that yields [`RequestEvent`]s until
//! the request ends. The handler answering the request holds a
//! [`Responder`]. Each responder action writes exactly one reply frame, and
//! every action except `update` retires the responder.

use crate::connection::Outgoing;
use crate::error::ClientError;
use parking_lot::Mutex;
use ricochet_protocol::{DeliveryQueue, ErrorCode, Frame, Headers, ReplyStatus, WireError};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Lifecycle event of a request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestEvent {
    /// Progress from the responder. The request stays pending.
    Update(Value),
    /// Final answer: `Ok(data)` or the responder's `Err(error)`.
    Response(Result<Value, Value>),
    /// The deadline passed, on this side (`local`) or on the responder.
    TimedOut { local: bool },
    /// The server or the responder reported an error.
    Error(WireError),
}

impl RequestEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestEvent::Update(_))
    }

    pub(crate) fn from_reply(status: ReplyStatus, body: Value) -> Self {
        match status {
            ReplyStatus::Update => RequestEvent::Update(body),
            ReplyStatus::Response => RequestEvent::Response(split_response(body)),
            ReplyStatus::Timeout => RequestEvent::TimedOut { local: false },
            ReplyStatus::Error => RequestEvent::Error(reported_error(body)),
        }
    }
}

/// Splits a `{error, data}` response body.
fn split_response(body: Value) -> Result<Value, Value> {
    match body {
        Value::Object(mut fields) => {
            let error = fields.remove("error").unwrap_or(Value::Null);
            if error.is_null() {
                Ok(fields.remove("data").unwrap_or(Value::Null))
            } else {
                Err(error)
            }
        }
        _ => Ok(Value::Null),
    }
}

fn reported_error(body: Value) -> WireError {
    match serde_json::from_value::<WireError>(body.clone()) {
        Ok(error) => error,
        Err(_) => WireError::new(ErrorCode::MessageMalformed).with_detail("body", body),
    }
}

/// Receiving end of a request.
///
/// Dropping it abandons the request; the registry forgets it on the next
/// reply.
#[derive(Debug)]
pub struct PendingReply {
    id: String,
    rx: mpsc::UnboundedReceiver<RequestEvent>,
}

impl PendingReply {
    pub(crate) fn new(id: String, rx: mpsc::UnboundedReceiver<RequestEvent>) -> Self {
        Self { id, rx }
    }

    /// Frame id of the request.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Waits for the next event. Returns `None` after the terminal event, or
    /// when the connection reset.
    pub async fn next(&mut self) -> Option<RequestEvent> {
        self.rx.recv().await
    }

    /// Waits for the outcome, skipping updates.
    pub async fn response(mut self) -> Result<Value, ClientError> {
        while let Some(event) = self.rx.recv().await {
            match event {
                RequestEvent::Update(_) => continue,
                RequestEvent::Response(Ok(data)) => return Ok(data),
                RequestEvent::Response(Err(error)) => return Err(ClientError::Rejected(error)),
                RequestEvent::TimedOut { local } => return Err(ClientError::Timeout { local }),
                RequestEvent::Error(error) => return Err(ClientError::Remote(error)),
            }
        }
        Err(ClientError::ConnectionClosed)
    }
}

/// Answers one inbound request.
pub struct Responder {
    state: Arc<ResponderState>,
}

struct ResponderState {
    request: Frame,
    outbound: DeliveryQueue<Outgoing>,
    retired: AtomicBool,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Responder {
    /// Creates the responder for `request`.
    ///
    /// A request declaring a timeout is answered with a `timeout` reply once
    /// it elapses, unless the responder retired or sent an update first.
    pub(crate) fn new(request: &Frame, outbound: DeliveryQueue<Outgoing>) -> Self {
        let state = Arc::new(ResponderState {
            request: Frame::new(request.headers.clone(), Value::Null),
            outbound,
            retired: AtomicBool::new(false),
            timer: Mutex::new(None),
        });

        if let Some(ms) = request.headers.timeout.filter(|ms| *ms > 0) {
            let timed = state.clone();
            let task = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                if timed.retire() {
                    debug!("Request {} expired before a response", timed.request.headers.id);
                    let _ = timed
                        .send(ReplyStatus::Timeout, json!({ "local": false }))
                        .await;
                }
            });
            *state.timer.lock() = Some(task);
        }

        Self { state }
    }

    /// Headers of the request being answered.
    pub fn request(&self) -> &Headers {
        &self.state.request.headers
    }

    /// Sends the final answer: `{error: null, data}` or `{error, data: null}`.
    pub async fn respond(self, result: Result<Value, Value>) -> Result<(), ClientError> {
        let body = match result {
            Ok(data) => json!({ "error": null, "data": data }),
            Err(error) => json!({ "error": error, "data": null }),
        };
        self.state.finish(ReplyStatus::Response, body).await
    }

    /// Sends progress and stops the declared deadline.
    pub async fn update(&self, data: Value) -> Result<(), ClientError> {
        if self.is_retired() {
            return Ok(());
        }
        self.state.cancel_timer();
        self.state.send(ReplyStatus::Update, data).await
    }

    /// Ends the request with an error reply.
    pub async fn error(self, error: WireError) -> Result<(), ClientError> {
        self.state.finish(ReplyStatus::Error, error.to_body()).await
    }

    pub fn is_retired(&self) -> bool {
        self.state.retired.load(Ordering::Acquire)
    }
}

impl ResponderState {
    /// Marks the responder retired. Returns false if it already was.
    fn retire(&self) -> bool {
        !self.retired.swap(true, Ordering::AcqRel)
    }

    fn cancel_timer(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
    }

    async fn finish(&self, status: ReplyStatus, body: Value) -> Result<(), ClientError> {
        if !self.retire() {
            return Ok(());
        }
        self.cancel_timer();
        self.send(status, body).await
    }

    async fn send(&self, status: ReplyStatus, body: Value) -> Result<(), ClientError> {
        let reply = self.request.reply(status, body);
        self.outbound
            .push(Outgoing::Frame(reply))
            .await
            .map_err(|_| ClientError::ConnectionClosed)
    }
}
