//! Live connection handle and its drop-on-full outbound queue.

use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::trace;

use crate::UserId;

/// Outbound queue capacity used by [`Connection::new`].
pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 128;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a connection. Equality is identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Result of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    /// Queue at capacity; the payload was discarded.
    Dropped,
    /// Queue already closed; the payload was discarded.
    Closed,
}

pub(crate) struct ConnectionInner {
    id: ConnectionId,
    user_id: UserId,
    /// `None` once the queue has been closed. Taking the only sender out is
    /// what lets the write pump observe end-of-stream after draining.
    sender: Mutex<Option<mpsc::Sender<Bytes>>>,
}

impl ConnectionInner {
    fn sender(&self) -> MutexGuard<'_, Option<mpsc::Sender<Bytes>>> {
        self.sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Handle to one live client connection.
///
/// Cloning is cheap and every clone refers to the same queue. The receiving
/// half of the queue is handed out once at construction and belongs to the
/// connection's write pump.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Create a connection with the default queue capacity.
    pub fn new(user_id: UserId) -> (Self, mpsc::Receiver<Bytes>) {
        Self::with_capacity(user_id, DEFAULT_SEND_QUEUE_CAPACITY)
    }

    pub fn with_capacity(user_id: UserId, capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let conn = Self {
            inner: Arc::new(ConnectionInner {
                id: ConnectionId::next(),
                user_id,
                sender: Mutex::new(Some(tx)),
            }),
        };
        (conn, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn user_id(&self) -> UserId {
        self.inner.user_id
    }

    /// Enqueue a payload without waiting. A full or closed queue discards it.
    pub fn send(&self, payload: Bytes) -> SendOutcome {
        let guard = self.inner.sender();
        let Some(tx) = guard.as_ref() else {
            return SendOutcome::Closed;
        };
        match tx.try_send(payload) {
            Ok(()) => SendOutcome::Queued,
            Err(TrySendError::Full(_)) => {
                trace!(conn_id = %self.inner.id, "outbound queue full, dropping payload");
                SendOutcome::Dropped
            }
            Err(TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    /// Close the outbound queue. Returns `true` only for the call that
    /// actually closed it; later calls are no-ops.
    pub fn close_send(&self) -> bool {
        self.inner.sender().take().is_some()
    }

    pub fn is_closed(&self) -> bool {
        match self.inner.sender().as_ref() {
            Some(tx) => tx.is_closed(),
            None => true,
        }
    }

    pub(crate) fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            user_id: self.inner.user_id,
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("user_id", &self.inner.user_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Non-owning reference kept in the hub's room index.
#[derive(Clone)]
pub(crate) struct WeakConnection {
    user_id: UserId,
    inner: Weak<ConnectionInner>,
}

impl WeakConnection {
    pub(crate) fn user_id(&self) -> UserId {
        self.user_id
    }

    pub(crate) fn upgrade(&self) -> Option<Connection> {
        self.inner.upgrade().map(|inner| Connection { inner })
    }
}
