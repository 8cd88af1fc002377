use std::{
    borrow::Cow,
    collections::HashMap,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use axum::extract::ws::{close_code, CloseFrame, Message};
use futures_util::{Sink, SinkExt};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::timeout;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::debug;
use uuid::Uuid;

pub type ClientId = Uuid;

/// Outbound half of a client connection.
pub type ClientSink = Pin<Box<dyn Sink<Message, Error = axum::Error> + Send>>;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("connection already closed")]
    Detached,
    #[error("write timed out after {0:?}")]
    TimedOut(Duration),
    #[error("transport error: {0}")]
    Transport(#[from] axum::Error),
}

impl SendError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            SendError::Detached => "detached",
            SendError::TimedOut(_) => "timeout",
            SendError::Transport(_) => "transport",
        }
    }
}

/// One connected client.
///
/// Writes to the connection are serialized by the handle's own lock, never by
/// the registry lock. Once the sink is taken out by [`ClientHandle::close`]
/// it stays detached for good.
pub struct ClientHandle {
    id: ClientId,
    user_id: Option<String>,
    connection: tokio::sync::Mutex<Option<ClientSink>>,
    write_timeout: Duration,
    last_activity: AtomicU64,
    closed: CancellationToken,
}

impl ClientHandle {
    fn new(
        id: ClientId,
        user_id: Option<String>,
        sink: Option<ClientSink>,
        write_timeout: Duration,
    ) -> Self {
        Self {
            id,
            user_id,
            connection: tokio::sync::Mutex::new(sink),
            write_timeout,
            last_activity: AtomicU64::new(now_millis()),
            closed: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn is_anonymous(&self) -> bool {
        self.user_id.is_none()
    }

    /// Sends one frame, bounded by the write timeout.
    pub async fn send(&self, message: Message) -> Result<(), SendError> {
        let mut guard = self.connection.lock().await;
        let sink = guard.as_mut().ok_or(SendError::Detached)?;
        match timeout(self.write_timeout, sink.send(message)).await {
            Ok(result) => result.map_err(SendError::from),
            Err(_) => Err(SendError::TimedOut(self.write_timeout)),
        }
    }

    pub async fn ping(&self) -> Result<(), SendError> {
        self.send(Message::Ping(Vec::new())).await
    }

    pub async fn is_attached(&self) -> bool {
        self.connection.lock().await.is_some()
    }

    /// Records inbound traffic for idle detection.
    pub fn touch(&self) {
        self.last_activity.store(now_millis(), Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = self.last_activity.load(Ordering::Relaxed);
        Duration::from_millis(now_millis().saturating_sub(last))
    }

    /// Resolves once the client has been removed from the registry.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    async fn close(&self) {
        self.closed.cancel();
        let sink = self.connection.lock().await.take();
        let Some(mut sink) = sink else {
            return;
        };
        let frame = Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: Cow::Borrowed("closing"),
        }));
        // the peer may already be gone; closing is best effort
        let _ = timeout(self.write_timeout, sink.send(frame)).await;
        let _ = timeout(self.write_timeout, sink.close()).await;
    }
}

/// All currently connected clients, keyed by connection id.
#[derive(Clone)]
pub struct ClientRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    clients: Mutex<HashMap<ClientId, Arc<ClientHandle>>>,
    write_timeout: Duration,
}

impl ClientRegistry {
    pub fn new(write_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                clients: Mutex::new(HashMap::new()),
                write_timeout,
            }),
        }
    }

    pub fn register(&self, sink: ClientSink, user_id: Option<String>) -> Arc<ClientHandle> {
        self.insert(Some(sink), user_id)
    }

    fn insert(&self, sink: Option<ClientSink>, user_id: Option<String>) -> Arc<ClientHandle> {
        let handle = Arc::new(ClientHandle::new(
            Uuid::new_v4(),
            user_id,
            sink,
            self.inner.write_timeout,
        ));
        let active = {
            let mut clients = self.inner.clients.lock();
            clients.insert(handle.id, Arc::clone(&handle));
            clients.len()
        };
        counter!("pixel_wall_connections_total", 1);
        gauge!("pixel_wall_clients_active", active as f64);
        handle
    }

    /// Removes the client and closes its connection.
    ///
    /// Safe to call any number of times; only the call that actually takes the
    /// entry out of the map closes the connection. Returns whether this call
    /// did the removal.
    pub async fn remove(&self, id: ClientId) -> bool {
        let Some(handle) = self.detach(id) else {
            return false;
        };
        handle.close().await;
        debug!(client_id = %id, "client removed");
        true
    }

    /// Takes the entry out of the map without touching the connection.
    pub fn detach(&self, id: ClientId) -> Option<Arc<ClientHandle>> {
        let (handle, active) = {
            let mut clients = self.inner.clients.lock();
            let handle = clients.remove(&id)?;
            (handle, clients.len())
        };
        gauge!("pixel_wall_clients_active", active as f64);
        Some(handle)
    }

    /// Copies out the current handles. The registry lock is released before
    /// this returns, so callers may do I/O on the result freely.
    pub fn snapshot(&self) -> Vec<Arc<ClientHandle>> {
        self.inner.clients.lock().values().cloned().collect()
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.inner.clients.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.clients.lock().is_empty()
    }
}

#[cfg(test)]
impl ClientRegistry {
    pub(crate) fn register_detached(&self, user_id: Option<String>) -> Arc<ClientHandle> {
        self.insert(None, user_id)
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{channel_sink, failing_sink, stalled_sink};
    use test_timeout::tokio_timeout_test;

    fn registry() -> ClientRegistry {
        ClientRegistry::new(Duration::from_millis(200))
    }

    #[tokio_timeout_test(5)]
    async fn register_assigns_unique_ids() {
        let registry = registry();
        let (sink_a, _rx_a) = channel_sink();
        let (sink_b, _rx_b) = channel_sink();
        let a = registry.register(sink_a, Some("u1".into()));
        let b = registry.register(sink_b, None);

        assert_ne!(a.id(), b.id());
        assert_eq!(registry.len(), 2);
        assert_eq!(a.user_id(), Some("u1"));
        assert!(b.is_anonymous());
    }

    #[tokio_timeout_test(5)]
    async fn remove_is_idempotent_and_closes_once() {
        let registry = registry();
        let (sink, mut rx) = channel_sink();
        let handle = registry.register(sink, None);

        assert!(registry.remove(handle.id()).await);
        assert!(!registry.remove(handle.id()).await);
        assert!(!registry.contains(handle.id()));
        assert!(handle.is_closed());
        assert!(!handle.is_attached().await);

        let mut closes = 0;
        while let Ok(message) = rx.try_recv() {
            if matches!(message, Message::Close(_)) {
                closes += 1;
            }
        }
        assert_eq!(closes, 1);
    }

    #[tokio_timeout_test(5)]
    async fn removing_unknown_id_is_noop() {
        let registry = registry();
        assert!(!registry.remove(Uuid::new_v4()).await);
        assert!(registry.is_empty());
    }

    #[tokio_timeout_test(5)]
    async fn snapshot_is_independent_of_later_changes() {
        let registry = registry();
        let (sink, _rx) = channel_sink();
        let handle = registry.register(sink, None);

        let snapshot = registry.snapshot();
        registry.remove(handle.id()).await;

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id(), handle.id());
        assert!(registry.snapshot().is_empty());
    }

    #[tokio_timeout_test(5)]
    async fn send_after_close_reports_detached() {
        let registry = registry();
        let (sink, _rx) = channel_sink();
        let handle = registry.register(sink, None);
        registry.remove(handle.id()).await;

        assert!(matches!(handle.ping().await, Err(SendError::Detached)));
    }

    #[tokio_timeout_test(5)]
    async fn failing_transport_surfaces_error() {
        let registry = registry();
        let handle = registry.register(failing_sink(), None);
        assert!(matches!(handle.ping().await, Err(SendError::Transport(_))));
    }

    #[tokio_timeout_test(5)]
    async fn stalled_write_times_out() {
        let registry = registry();
        let handle = registry.register(stalled_sink(), None);
        assert!(matches!(handle.ping().await, Err(SendError::TimedOut(_))));
    }

    #[tokio_timeout_test(5)]
    async fn close_wakes_waiters() {
        let registry = registry();
        let (sink, _rx) = channel_sink();
        let handle = registry.register(sink, None);

        let waiter = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move { handle.closed().await })
        };
        registry.remove(handle.id()).await;
        waiter.await.unwrap();
    }
}
