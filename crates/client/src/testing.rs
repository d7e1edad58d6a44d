//! In-memory transport for driving the client state machine in tests.
#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex as StdMutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use {async_trait::async_trait, tokio::sync::mpsc};

use crate::transport::{Transport, TransportConnection, TransportError};

/// The "server" side of one mock connection.
pub(crate) struct ServerHandle {
    pub from_client: mpsc::UnboundedReceiver<String>,
    pub to_client: mpsc::UnboundedSender<Result<String, TransportError>>,
}

impl ServerHandle {
    /// Next frame the client wrote, with a test-friendly timeout.
    pub async fn next_frame(&mut self) -> serde_json::Value {
        let text = tokio::time::timeout(Duration::from_secs(2), self.from_client.recv())
            .await
            .expect("timed out waiting for client frame")
            .expect("client connection ended");
        serde_json::from_str(&text).expect("client frame is json")
    }

    pub fn push(&self, frame: serde_json::Value) {
        self.to_client
            .send(Ok(frame.to_string()))
            .expect("client connection alive");
    }
}

/// Transport whose connections are channel pairs; tests accept them via
/// [`MockTransport::accept`] and then speak raw frames.
#[derive(Default)]
pub(crate) struct MockTransport {
    handles: StdMutex<VecDeque<ServerHandle>>,
    connect_count: AtomicUsize,
    fail_connects: AtomicUsize,
    pub last_url: StdMutex<Option<String>>,
    pub last_protocols: StdMutex<Vec<String>>,
}

impl MockTransport {
    pub fn connects(&self) -> usize {
        self.connect_count.load(Ordering::SeqCst)
    }

    /// Make the next `n` connect calls fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Wait for the client's next connection attempt to land.
    pub async fn accept(&self) -> ServerHandle {
        for _ in 0..200 {
            if let Some(handle) = self.handles.lock().expect("lock").pop_front() {
                return handle;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("client never connected");
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &self,
        url: &str,
        protocols: &[String],
    ) -> Result<Box<dyn TransportConnection>, TransportError> {
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        *self.last_url.lock().expect("lock") = Some(url.to_string());
        *self.last_protocols.lock().expect("lock") = protocols.to_vec();

        let remaining = self.fail_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_connects.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::new("injected connect failure"));
        }

        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();
        self.handles.lock().expect("lock").push_back(ServerHandle {
            from_client: server_rx,
            to_client: server_tx,
        });
        Ok(Box::new(MockConnection {
            tx: client_tx,
            rx: client_rx,
        }))
    }
}

struct MockConnection {
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<Result<String, TransportError>>,
}

#[async_trait]
impl TransportConnection for MockConnection {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.tx
            .send(text)
            .map_err(|_| TransportError::new("server side gone"))
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        self.rx.recv().await
    }

    async fn close(&mut self) {
        self.rx.close();
    }
}
