use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, MutexGuard},
};

use {
    serde_json::Value,
    switchboard_protocol::{ERROR_TYPE, ErrorShape, RPC_PROGRESS_TYPE},
    tokio::sync::oneshot,
};

use crate::error::ClientError;

pub(crate) type ProgressHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// One outstanding request. `in_flight` flips when the frame actually goes
/// out; queued entries survive a disconnect, in-flight ones do not.
pub(crate) struct PendingEntry {
    pub response_type: String,
    pub on_progress: Option<ProgressHandler>,
    pub settle: oneshot::Sender<Result<Value, ClientError>>,
    pub in_flight: bool,
}

// ── Reply classification ─────────────────────────────────────────────────────

/// The four-way dispatch of a correlated frame, as a pure decision.
#[derive(Debug)]
pub(crate) enum ReplyDisposition {
    Resolve(Value),
    ServerError(ErrorShape),
    Progress(Value),
    TypeMismatch { expected: String, got: String },
    Malformed(String),
}

pub(crate) fn classify_reply(frame: &Value, response_type: &str) -> ReplyDisposition {
    let Some(message_type) = frame.get("type").and_then(Value::as_str) else {
        return ReplyDisposition::Malformed("frame has no type".into());
    };
    if message_type == ERROR_TYPE {
        let payload = frame.get("payload").cloned().unwrap_or(Value::Null);
        return match serde_json::from_value::<ErrorShape>(payload) {
            Ok(shape) => ReplyDisposition::ServerError(shape),
            Err(err) => ReplyDisposition::Malformed(format!("malformed ERROR payload: {err}")),
        };
    }
    if message_type == RPC_PROGRESS_TYPE {
        return ReplyDisposition::Progress(frame.get("payload").cloned().unwrap_or(Value::Null));
    }
    if message_type == response_type {
        return ReplyDisposition::Resolve(frame.clone());
    }
    ReplyDisposition::TypeMismatch {
        expected: response_type.to_string(),
        got: message_type.to_string(),
    }
}

// ── Pending map ──────────────────────────────────────────────────────────────

/// Correlation id → pending entry, with admission-time capacity enforcement.
/// Every terminal path (reply, timeout, abort, close) funnels through
/// [`PendingMap::settle`], which removes the entry exactly once; later frames
/// with the same id find nothing and are dropped.
pub(crate) struct PendingMap {
    entries: StdMutex<HashMap<String, PendingEntry>>,
    limit: usize,
}

impl PendingMap {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: StdMutex::new(HashMap::new()),
            limit,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Admission is synchronous: the n+1th entry is rejected immediately.
    pub fn insert(&self, correlation_id: String, entry: PendingEntry) -> Result<(), ClientError> {
        let mut entries = self.lock();
        if entries.len() >= self.limit {
            return Err(ClientError::state("Pending request limit exceeded"));
        }
        entries.insert(correlation_id, entry);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.lock().contains_key(correlation_id)
    }

    /// Remove without settling (caller already has a verdict to report).
    pub fn remove(&self, correlation_id: &str) {
        self.lock().remove(correlation_id);
    }

    /// Settle and remove; false if the entry was already gone.
    pub fn settle(&self, correlation_id: &str, result: Result<Value, ClientError>) -> bool {
        let Some(entry) = self.lock().remove(correlation_id) else {
            return false;
        };
        let _ = entry.settle.send(result);
        true
    }

    pub fn mark_in_flight(&self, correlation_id: &str) {
        if let Some(entry) = self.lock().get_mut(correlation_id) {
            entry.in_flight = true;
        }
    }

    /// Dispatch one correlated frame. Returns false for a late frame.
    pub fn dispatch(&self, correlation_id: &str, frame: &Value) -> bool {
        let disposition = {
            let entries = self.lock();
            let Some(entry) = entries.get(correlation_id) else {
                return false;
            };
            classify_reply(frame, &entry.response_type)
        };
        match disposition {
            ReplyDisposition::Progress(payload) => {
                let handler = self
                    .lock()
                    .get(correlation_id)
                    .and_then(|entry| entry.on_progress.clone());
                if let Some(handler) = handler {
                    handler(payload);
                }
            },
            ReplyDisposition::Resolve(frame) => {
                self.settle(correlation_id, Ok(frame));
            },
            ReplyDisposition::ServerError(shape) => {
                self.settle(
                    correlation_id,
                    Err(ClientError::Server {
                        code: shape.code,
                        message: shape.message,
                        context: shape.context,
                        retryable: shape.retryable,
                        retry_after_ms: shape.retry_after_ms,
                    }),
                );
            },
            ReplyDisposition::TypeMismatch { expected, got } => {
                self.settle(
                    correlation_id,
                    Err(ClientError::validation(
                        format!("Expected type {expected}, got {got}"),
                        Vec::new(),
                    )),
                );
            },
            ReplyDisposition::Malformed(message) => {
                self.settle(
                    correlation_id,
                    Err(ClientError::validation(message, Vec::new())),
                );
            },
        }
        true
    }

    /// Reject every in-flight entry (the server has no memory of them);
    /// queued entries survive for the next connection.
    pub fn reject_in_flight(&self) {
        let in_flight: Vec<(String, PendingEntry)> = {
            let mut entries = self.lock();
            let ids: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| entry.in_flight)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|entry| (id, entry)))
                .collect()
        };
        for (_, entry) in in_flight {
            let _ = entry.settle.send(Err(ClientError::ConnectionClosed));
        }
    }

    /// Reject everything (manual close).
    pub fn reject_all(&self, make_error: impl Fn() -> ClientError) {
        let entries: Vec<PendingEntry> = {
            let mut map = self.lock();
            map.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            let _ = entry.settle.send(Err(make_error()));
        }
    }
}
