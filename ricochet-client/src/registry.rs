//! In-flight request registry.
//!
//! Every request sent with an observer gets an entry keyed by its frame id.
//! The entry lives until a terminal reply arrives, its deadline passes, the
//! send fails, or the socket resets. Once removed, later replies carrying the
//! same id are reported as not found.

use crate::reply::{PendingReply, RequestEvent};
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use ricochet_protocol::{ErrorCode, ReplyStatus, WireError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Length of generated frame ids.
pub const ID_LENGTH: usize = 32;

/// Generates a random alphanumeric frame id.
pub fn generate_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ID_LENGTH)
        .map(char::from)
        .collect()
}

struct Pending {
    tx: mpsc::UnboundedSender<RequestEvent>,
    timer: Option<JoinHandle<()>>,
}

impl Pending {
    fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Requests awaiting replies.
pub struct PendingRegistry {
    entries: Mutex<HashMap<String, Pending>>,
    latency_buffer: Duration,
}

impl PendingRegistry {
    /// Creates a registry whose deadlines are extended by `latency_buffer`.
    pub fn new(latency_buffer: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            latency_buffer,
        }
    }

    /// Registers a request under a fresh unique id.
    ///
    /// With a `timeout`, the request expires locally after
    /// `timeout + latency_buffer` unless an update or terminal reply arrives
    /// first.
    pub fn register(self: &Arc<Self>, timeout: Option<Duration>) -> PendingReply {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut entries = self.entries.lock();

        let mut id = generate_id();
        while entries.contains_key(&id) {
            id = generate_id();
        }

        let timer = timeout.map(|timeout| {
            let registry = Arc::downgrade(self);
            let deadline = timeout + self.latency_buffer;
            let id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                if let Some(registry) = registry.upgrade() {
                    registry.expire(&id);
                }
            })
        });

        entries.insert(id.clone(), Pending { tx, timer });
        PendingReply::new(id, rx)
    }

    /// Routes a reply to its request.
    ///
    /// Updates stop the local deadline and keep the request pending. Any
    /// other status ends it.
    pub fn dispatch(
        &self,
        id: &str,
        status: Option<ReplyStatus>,
        body: Value,
    ) -> Result<(), ErrorCode> {
        let mut entries = self.entries.lock();
        if !entries.contains_key(id) {
            return Err(ErrorCode::MessageNotFound);
        }
        let status = status.ok_or(ErrorCode::MessageMalformed)?;
        let event = RequestEvent::from_reply(status, body);

        if status.is_terminal() {
            if let Some(mut pending) = entries.remove(id) {
                pending.stop_timer();
                let _ = pending.tx.send(event);
            }
            return Ok(());
        }

        let abandoned = match entries.get_mut(id) {
            Some(pending) => {
                pending.stop_timer();
                pending.tx.send(event).is_err()
            }
            None => false,
        };
        if abandoned {
            debug!("Request {} abandoned by caller", id);
            entries.remove(id);
        }
        Ok(())
    }

    fn expire(&self, id: &str) {
        // The timer task is the caller; dropping its handle detaches it.
        if let Some(pending) = self.entries.lock().remove(id) {
            debug!("Request {} timed out locally", id);
            let _ = pending.tx.send(RequestEvent::TimedOut { local: true });
        }
    }

    /// Ends a request with an error. Returns whether it was pending.
    pub fn cancel(&self, id: &str, error: WireError) -> bool {
        match self.entries.lock().remove(id) {
            Some(mut pending) => {
                pending.stop_timer();
                let _ = pending.tx.send(RequestEvent::Error(error));
                true
            }
            None => false,
        }
    }

    /// Forgets a request without notifying its caller.
    pub fn remove(&self, id: &str) -> bool {
        match self.entries.lock().remove(id) {
            Some(mut pending) => {
                pending.stop_timer();
                true
            }
            None => false,
        }
    }

    /// Drops every pending request. Callers observe a closed connection.
    pub fn reset(&self) -> usize {
        let drained: Vec<Pending> = self.entries.lock().drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for mut pending in drained {
            pending.stop_timer();
        }
        if count > 0 {
            debug!("Dropped {} pending requests", count);
        }
        count
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
