use std::sync::{
    Arc, Mutex as StdMutex,
    atomic::{AtomicUsize, Ordering},
};

use crate::{
    ConnectionData,
    adapter::{ServerSocket, SocketError},
    topics::Topics,
};

/// One accepted socket: stable identity, app data, and subscription state.
/// Created by `RouterService::accept`, destroyed by `disconnect`.
pub struct Connection<D: ConnectionData> {
    client_id: String,
    remote_ip: Option<String>,
    socket: Arc<dyn ServerSocket>,
    data: StdMutex<D>,
    topics: Topics,
    pending_incoming: AtomicUsize,
}

impl<D: ConnectionData> Connection<D> {
    pub(crate) fn new(
        client_id: String,
        remote_ip: Option<String>,
        socket: Arc<dyn ServerSocket>,
        topics: Topics,
        data: D,
    ) -> Self {
        Self {
            client_id,
            remote_ip,
            socket,
            data: StdMutex::new(data),
            topics,
            pending_incoming: AtomicUsize::new(0),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn remote_ip(&self) -> Option<&str> {
        self.remote_ip.as_deref()
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    /// A copy of the per-connection app data.
    pub fn data(&self) -> D {
        self.lock_data().clone()
    }

    /// Mutate the per-connection app data in place.
    pub fn update_data(&self, f: impl FnOnce(&mut D)) {
        f(&mut self.lock_data());
    }

    pub(crate) fn socket(&self) -> &Arc<dyn ServerSocket> {
        &self.socket
    }

    pub(crate) async fn send_frame(&self, frame: &str) -> Result<(), SocketError> {
        self.socket.send_text(frame).await
    }

    pub(crate) fn pending_incoming(&self) -> usize {
        self.pending_incoming.load(Ordering::SeqCst)
    }

    pub(crate) fn begin_frame(&self) {
        self.pending_incoming.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn end_frame(&self) {
        self.pending_incoming.fetch_sub(1, Ordering::SeqCst);
    }

    fn lock_data(&self) -> std::sync::MutexGuard<'_, D> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
