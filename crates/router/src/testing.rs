//! Shared fakes for this crate's tests.
#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::{
    collections::{BTreeSet, HashSet},
    sync::{
        Mutex as StdMutex,
        atomic::{AtomicBool, Ordering},
    },
};

use {async_trait::async_trait, futures::FutureExt, serde_json::Value, tokio::sync::oneshot};

use crate::{
    adapter::{ServerSocket, Settlement, SocketError, SocketState, TopicAdapter, settled},
    error::AdapterError,
};

// ── Recording socket ─────────────────────────────────────────────────────────

#[derive(Default)]
pub(crate) struct TestSocket {
    frames: StdMutex<Vec<String>>,
    closed: AtomicBool,
    fail_sends: AtomicBool,
}

impl TestSocket {
    pub fn frames(&self) -> Vec<String> {
        self.frames.lock().expect("lock").clone()
    }

    pub fn json_frames(&self) -> Vec<Value> {
        self.frames()
            .iter()
            .map(|frame| serde_json::from_str(frame).expect("frame is json"))
            .collect()
    }

    pub fn last_json(&self) -> Option<Value> {
        self.json_frames().pop()
    }

    pub fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ServerSocket for TestSocket {
    fn ready_state(&self) -> SocketState {
        if self.closed.load(Ordering::SeqCst) {
            SocketState::Closed
        } else {
            SocketState::Open
        }
    }

    async fn send_text(&self, frame: &str) -> Result<(), SocketError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(SocketError::new("injected write failure"));
        }
        self.frames.lock().expect("lock").push(frame.to_string());
        Ok(())
    }

    fn close(&self, _code: Option<u16>, _reason: Option<&str>) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ── Flaky adapter ────────────────────────────────────────────────────────────

/// Records every issued call, applies them to a live subscription view, and
/// fails the calls it was told to fail.
#[derive(Default)]
pub(crate) struct FlakyAdapter {
    log: StdMutex<Vec<String>>,
    fail_on: StdMutex<HashSet<String>>,
    pub members: StdMutex<BTreeSet<String>>,
}

impl FlakyAdapter {
    pub fn fail_subscribe(&self, topic: &str) {
        self.fail_on.lock().expect("lock").insert(format!("subscribe:{topic}"));
    }

    pub fn fail_unsubscribe(&self, topic: &str) {
        self.fail_on.lock().expect("lock").insert(format!("unsubscribe:{topic}"));
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().expect("lock").clone()
    }

    pub fn view(&self) -> BTreeSet<String> {
        self.members.lock().expect("lock").clone()
    }

    fn call(&self, op: &str, topic: &str) -> Result<Settlement, AdapterError> {
        let key = format!("{op}:{topic}");
        self.log.lock().expect("lock").push(key.clone());
        if self.fail_on.lock().expect("lock").contains(&key) {
            return Err(AdapterError::new(format!("injected failure on {key}")));
        }
        let mut members = self.members.lock().expect("lock");
        if op == "subscribe" {
            members.insert(topic.to_string());
        } else {
            members.remove(topic);
        }
        Ok(settled())
    }
}

impl TopicAdapter for FlakyAdapter {
    fn subscribe(&self, _client_id: &str, topic: &str) -> Result<Settlement, AdapterError> {
        self.call("subscribe", topic)
    }

    fn unsubscribe(&self, _client_id: &str, topic: &str) -> Result<Settlement, AdapterError> {
        self.call("unsubscribe", topic)
    }
}

// ── Manual-acknowledgment adapter ────────────────────────────────────────────

/// Issues instantly but acknowledges only when the test resolves the
/// settlement, for exercising settled mode and per-topic serialization.
#[derive(Default)]
pub(crate) struct ManualAdapter {
    pub log: StdMutex<Vec<String>>,
    pending: StdMutex<Vec<(String, oneshot::Sender<Result<(), AdapterError>>)>>,
}

impl ManualAdapter {
    pub fn log(&self) -> Vec<String> {
        self.log.lock().expect("lock").clone()
    }

    /// Resolve the oldest pending settlement for `key` ("subscribe:t").
    pub fn resolve(&self, key: &str, result: Result<(), AdapterError>) {
        let mut pending = self.pending.lock().expect("lock");
        let index = pending
            .iter()
            .position(|(k, _)| k == key)
            .expect("pending settlement exists");
        let (_, tx) = pending.remove(index);
        let _ = tx.send(result);
    }

    fn call(&self, op: &str, topic: &str) -> Result<Settlement, AdapterError> {
        let key = format!("{op}:{topic}");
        self.log.lock().expect("lock").push(key.clone());
        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("lock").push((key, tx));
        Ok(async move { rx.await.unwrap_or(Ok(())) }.boxed().shared())
    }
}

impl TopicAdapter for ManualAdapter {
    fn subscribe(&self, _client_id: &str, topic: &str) -> Result<Settlement, AdapterError> {
        self.call("subscribe", topic)
    }

    fn unsubscribe(&self, _client_id: &str, topic: &str) -> Result<Settlement, AdapterError> {
        self.call("unsubscribe", topic)
    }
}
