//! The outgoing response, written incrementally by a handler.
//!
//! A [`Response`] is a cheap, clonable handle. Status and headers stay
//! mutable until the head is sent, either explicitly with
//! [`write_head`](Response::write_head) or implicitly by the first
//! [`write`](Response::write) or [`end`](Response::end). Body chunks travel
//! through a bounded channel to the connection, so a handler that writes
//! faster than the peer reads waits, and a handler that writes after its
//! connection was destroyed gets [`ResponseError::Closed`].
//!
//! ```text
//! handler ── set_status / set_header ──► (pending head)
//!         ── write_head ──────────────► oneshot ──► dispatcher ──► hyper
//!         ── write(chunk) ────────────► mpsc ───────────────────► hyper
//!         ── end ─────────────────────► sender dropped, body ends
//! ```

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context as TaskContext, Poll};

use bytes::Bytes;
use http::header::IntoHeaderName;
use http::{HeaderMap, HeaderValue, StatusCode};
use hyper::body::{Body, Frame, SizeHint};
use tokio::sync::{mpsc, oneshot};

use crate::error::ResponseError;

/// Chunks buffered between a handler and its connection.
const BODY_CHANNEL_CAPACITY: usize = 16;

/// The head of a response, handed to the dispatcher once it is sent.
pub(crate) type Head = http::Response<ResponseBody>;

// ── ResponseBody ──────────────────────────────────────────────────────────────

/// Body of a response as seen by the transport.
pub struct ResponseBody {
    inner: BodyInner,
}

enum BodyInner {
    Empty,
    Channel(mpsc::Receiver<Bytes>),
}

impl ResponseBody {
    pub(crate) fn empty() -> Self {
        Self { inner: BodyInner::Empty }
    }
}

impl Body for ResponseBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
        match &mut self.get_mut().inner {
            BodyInner::Empty => Poll::Ready(None),
            BodyInner::Channel(rx) => rx.poll_recv(cx).map(|chunk| chunk.map(|b| Ok(Frame::data(b)))),
        }
    }

    fn is_end_stream(&self) -> bool {
        matches!(self.inner, BodyInner::Empty)
    }

    fn size_hint(&self) -> SizeHint {
        match self.inner {
            BodyInner::Empty => SizeHint::with_exact(0),
            BodyInner::Channel(_) => SizeHint::default(),
        }
    }
}

/// A bare `500 Internal Server Error`, for when no handler-built head exists.
pub(crate) fn internal_error() -> Head {
    let mut head = http::Response::new(ResponseBody::empty());
    *head.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    head
}

// ── Response ──────────────────────────────────────────────────────────────────

/// Handle to the response of one request.
///
/// Every method takes `&self`; clones write to the same response.
///
/// ```rust,no_run
/// use perch::{BoxError, Context};
/// use http::{HeaderValue, StatusCode, header};
///
/// async fn report(ctx: Context) -> Result<(), BoxError> {
///     let res = ctx.response();
///     res.set_status(StatusCode::OK)?;
///     res.set_header(header::CONTENT_TYPE, HeaderValue::from_static("text/csv"))?;
///     res.write("id,name\n").await?;
///     res.write("1,alice\n").await?;
///     res.end()?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Response {
    state: Arc<Mutex<State>>,
}

struct State {
    status: StatusCode,
    headers: HeaderMap,
    /// `Some` until the head is sent.
    head: Option<PendingHead>,
    /// `Some` until the body is ended.
    body: Option<mpsc::Sender<Bytes>>,
    /// Set when the connection went away before the head was handed over.
    closed: bool,
}

struct PendingHead {
    tx: oneshot::Sender<Head>,
    rx: mpsc::Receiver<Bytes>,
}

impl State {
    fn ensure_open(&self) -> Result<(), ResponseError> {
        if self.closed {
            return Err(ResponseError::Closed);
        }
        Ok(())
    }

    /// Sends the head if it has not been sent. With `empty`, the head goes out
    /// with a zero-length body instead of the chunk channel.
    fn flush_head(&mut self, empty: bool) -> Result<(), ResponseError> {
        let Some(pending) = self.head.take() else {
            return Ok(());
        };
        let body = if empty {
            ResponseBody::empty()
        } else {
            ResponseBody { inner: BodyInner::Channel(pending.rx) }
        };
        let mut head = http::Response::new(body);
        *head.status_mut() = self.status;
        *head.headers_mut() = self.headers.clone();
        pending.tx.send(head).map_err(|_| ResponseError::Closed)
    }
}

impl Response {
    /// Creates a response and the receiver its head is delivered on.
    pub(crate) fn channel() -> (Self, oneshot::Receiver<Head>) {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        let state = State {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            head: Some(PendingHead { tx: head_tx, rx: body_rx }),
            body: Some(body_tx),
            closed: false,
        };
        (Self { state: Arc::new(Mutex::new(state)) }, head_rx)
    }

    /// Marks the response as undeliverable. Every later write, status or
    /// header change fails with [`ResponseError::Closed`].
    pub(crate) fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.head = None;
        state.body = None;
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The status that was sent, or will be sent. Defaults to `200 OK`.
    pub fn status(&self) -> StatusCode {
        self.lock().status
    }

    pub fn set_status(&self, status: StatusCode) -> Result<(), ResponseError> {
        let mut state = self.lock();
        state.ensure_open()?;
        if state.head.is_none() {
            return Err(ResponseError::HeadersSent);
        }
        state.status = status;
        Ok(())
    }

    /// Sets a header, replacing any previous value under the same name.
    pub fn set_header<K: IntoHeaderName>(&self, name: K, value: HeaderValue) -> Result<(), ResponseError> {
        let mut state = self.lock();
        state.ensure_open()?;
        if state.head.is_none() {
            return Err(ResponseError::HeadersSent);
        }
        state.headers.insert(name, value);
        Ok(())
    }

    /// Sends status and headers now.
    pub fn write_head(&self) -> Result<(), ResponseError> {
        let mut state = self.lock();
        state.ensure_open()?;
        if state.head.is_none() {
            return Err(ResponseError::HeadersSent);
        }
        state.flush_head(false)
    }

    /// Writes a body chunk, sending the head first if needed.
    ///
    /// Waits while the connection's buffer is full.
    pub async fn write(&self, chunk: impl Into<Bytes>) -> Result<(), ResponseError> {
        let tx = {
            let mut state = self.lock();
            state.ensure_open()?;
            let tx = state.body.clone().ok_or(ResponseError::Ended)?;
            state.flush_head(false)?;
            tx
        };
        tx.send(chunk.into()).await.map_err(|_| ResponseError::Closed)
    }

    /// Terminates the response. A second call returns [`ResponseError::Ended`].
    pub fn end(&self) -> Result<(), ResponseError> {
        let mut state = self.lock();
        state.ensure_open()?;
        if state.body.take().is_none() {
            return Err(ResponseError::Ended);
        }
        state.flush_head(true)
    }

    /// Sets the status, writes `body` and ends the response.
    pub async fn send(&self, status: StatusCode, body: impl Into<Bytes>) -> Result<(), ResponseError> {
        self.set_status(status)?;
        self.write(body).await?;
        self.end()
    }

    pub fn headers_sent(&self) -> bool {
        self.lock().head.is_none()
    }

    pub fn is_ended(&self) -> bool {
        self.lock().body.is_none()
    }
}
