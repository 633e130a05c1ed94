//! Connection bookkeeping.
//!
//! Every accepted socket is registered in a side table owned by the
//! [`ConnectionManager`], keyed by a [`ConnectionHandle`]. The table holds
//! the connection's identity and a kill switch; the task serving the socket
//! holds the matching [`ConnectionGuard`] and stops serving (dropping the
//! socket) as soon as the switch fires. Dropping the guard is the close
//! event.
//!
//! ```text
//! accept ─► register ─► ConnectionGuard ──────── task ends ──► close
//!                 │                                              ▲
//!                 └─ Record { identity, kill } ── destroy ───────┘
//!                                                 shutdown (all)
//! ```
//!
//! Nothing here is graceful: destroying a connection drops it on the spot,
//! whatever requests are in flight on it.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info};

/// Stable key of a tracked connection. Never reused within one manager.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ConnectionHandle(u64);

impl std::fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Identity of a connection: `remote-local`, each as `ip:port`.
pub fn identity(remote: SocketAddr, local: SocketAddr) -> String {
    format!("{remote}-{local}")
}

struct Record {
    identity: String,
    kill: oneshot::Sender<()>,
}

#[derive(Default)]
struct Registry {
    records: HashMap<ConnectionHandle, Record>,
    next: u64,
    shut_down: bool,
}

/// Tracks open connections. Clones share the same table.
#[derive(Clone, Default)]
pub struct ConnectionManager {
    registry: Arc<Mutex<Registry>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts tracking a connection. Returns `None` once the manager has been
    /// shut down; the caller should drop the socket.
    pub fn register(&self, remote: SocketAddr, local: SocketAddr) -> Option<ConnectionGuard> {
        let mut registry = self.lock();
        if registry.shut_down {
            return None;
        }
        registry.next += 1;
        let handle = ConnectionHandle(registry.next);
        let identity = identity(remote, local);
        let (kill, killed) = oneshot::channel();
        registry.records.insert(handle, Record { identity: identity.clone(), kill });
        debug!(conn = %identity, active = registry.records.len(), "connection opened");

        Some(ConnectionGuard { handle, identity, killed, manager: self.clone() })
    }

    /// Forgets a connection that ended on its own. Returns whether it was
    /// still tracked.
    pub fn close(&self, handle: ConnectionHandle) -> bool {
        let mut registry = self.lock();
        let Some(record) = registry.records.remove(&handle) else {
            return false;
        };
        debug!(conn = %record.identity, active = registry.records.len(), "connection closed");
        true
    }

    /// Forcibly ends one connection. Returns whether it was still tracked.
    pub fn destroy(&self, handle: ConnectionHandle) -> bool {
        let mut registry = self.lock();
        let Some(record) = registry.records.remove(&handle) else {
            return false;
        };
        let _ = record.kill.send(());
        debug!(conn = %record.identity, active = registry.records.len(), "connection destroyed");
        true
    }

    /// Refuses new connections and destroys every tracked one. Returns how
    /// many were destroyed.
    pub fn shutdown(&self) -> usize {
        let mut registry = self.lock();
        registry.shut_down = true;
        let destroyed = registry.records.len();
        for (_, record) in registry.records.drain() {
            let _ = record.kill.send(());
        }
        info!(destroyed, "connection manager shut down");
        destroyed
    }

    pub fn active_count(&self) -> usize {
        self.lock().records.len()
    }

    pub fn identity(&self, handle: ConnectionHandle) -> Option<String> {
        self.lock().records.get(&handle).map(|r| r.identity.clone())
    }

    pub fn is_shut_down(&self) -> bool {
        self.lock().shut_down
    }
}

/// Held by the task serving a connection. Dropping it closes the record.
pub struct ConnectionGuard {
    handle: ConnectionHandle,
    identity: String,
    killed: oneshot::Receiver<()>,
    manager: ConnectionManager,
}

impl ConnectionGuard {
    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Resolves when the manager destroys this connection.
    pub async fn destroyed(&mut self) {
        // A dropped sender means the record is gone as well.
        let _ = (&mut self.killed).await;
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.manager.close(self.handle);
    }
}

// ── Client errors ─────────────────────────────────────────────────────────────

/// Whether `err` is a peer hanging up abruptly. These are frequent and
/// harmless, so they are not logged.
pub fn is_abrupt_reset(err: &(dyn StdError + 'static)) -> bool {
    let mut source = Some(err);
    while let Some(e) = source {
        // `io::Error::source` skips the wrapped error itself, hence `get_ref`.
        let reset = e.downcast_ref::<io::Error>().is_some_and(|io| {
            matches!(
                io.kind(),
                io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe
            ) || io.get_ref().is_some_and(|inner| is_abrupt_reset(inner))
        });
        if reset {
            return true;
        }
        source = e.source();
    }
    false
}

// ── Idle tracking ─────────────────────────────────────────────────────────────

/// Time of the last successful read or write on a socket.
pub(crate) struct Activity(Mutex<Instant>);

impl Activity {
    pub(crate) fn new() -> Self {
        Self(Mutex::new(Instant::now()))
    }

    fn touch(&self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn last(&self) -> Instant {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Resolves once `timeout` passes without activity. A zero timeout never
/// resolves.
pub(crate) async fn idle(activity: &Activity, timeout: Duration) {
    if timeout.is_zero() {
        return std::future::pending().await;
    }
    loop {
        let deadline = activity.last() + timeout;
        if Instant::now() >= deadline {
            return;
        }
        tokio::time::sleep_until(deadline).await;
    }
}

/// A socket that records its activity.
pub(crate) struct IdleStream<S> {
    inner: S,
    activity: Arc<Activity>,
}

impl<S> IdleStream<S> {
    pub(crate) fn new(inner: S, activity: Arc<Activity>) -> Self {
        Self { inner, activity }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for IdleStream<S> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if matches!(poll, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            self.activity.touch();
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for IdleStream<S> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if matches!(poll, Poll::Ready(Ok(n)) if n > 0) {
            self.activity.touch();
        }
        poll
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write_vectored(cx, bufs);
        if matches!(poll, Poll::Ready(Ok(n)) if n > 0) {
            self.activity.touch();
        }
        poll
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
