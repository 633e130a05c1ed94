//! The server: listener, accept loop, and per-connection serving.
//!
//! # Stopping is abrupt
//!
//! [`Server::stop`] closes the listener and destroys every open connection
//! immediately. Handlers already running keep running until they settle,
//! but their connection is gone: their responses are closed so writes fail,
//! and the dispatcher still finalizes and logs them. There is no drain period.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::connection::{Activity, ConnectionGuard, ConnectionManager, IdleStream, idle, is_abrupt_reset};
use crate::dispatch::Dispatcher;
use crate::error::Error;
use crate::handler::Handler;
use crate::response::internal_error;
use crate::router::RoutingTable;

/// The request server.
///
/// ```rust,no_run
/// use perch::{BoxError, Context, Server, ServerConfig};
/// use http::{Method, StatusCode};
///
/// #[tokio::main]
/// async fn main() -> Result<(), perch::Error> {
///     let mut server = Server::new(ServerConfig::default());
///     server.set_handler(Method::GET, "/entity/*/devices", devices);
///     server.run_until_signal().await
/// }
///
/// async fn devices(ctx: Context) -> Result<(), BoxError> {
///     let id = ctx.param(0).unwrap_or("unknown").to_owned();
///     ctx.response().send(StatusCode::OK, id).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    config: ServerConfig,
    routes: Arc<RoutingTable>,
    connections: ConnectionManager,
    listening: Option<Listening>,
}

struct Listening {
    local_addr: SocketAddr,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            routes: Arc::new(RoutingTable::new()),
            connections: ConnectionManager::new(),
            listening: None,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Binds `handler` to `method` + `pattern`. See [`RoutingTable::insert`].
    ///
    /// The routes are snapshotted by [`start`](Server::start); a handler set
    /// while listening is served after the next start.
    pub fn set_handler(&mut self, method: http::Method, pattern: &str, handler: impl Handler) -> &mut Self {
        Arc::make_mut(&mut self.routes).insert(method, pattern, handler);
        self
    }

    /// Starts listening. Does nothing if already listening.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is invalid or cannot be bound.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.is_listening() {
            return Ok(());
        }

        let addr = self.config.socket_addr()?;
        let listener = listen(addr, self.config.max_connections())
            .map_err(|source| Error::Bind { addr: addr.to_string(), source })?;
        let local_addr = listener.local_addr()?;

        self.connections = ConnectionManager::new();
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&self.routes), self.config.cors()));
        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(accept_loop(
            listener,
            dispatcher,
            self.connections.clone(),
            self.config.idle_timeout(),
            self.config.max_connections(),
            stopped,
        ));

        info!(addr = %local_addr, "perch listening");
        self.listening = Some(Listening { local_addr, stop, task });
        Ok(())
    }

    /// Stops listening and destroys every open connection. Does nothing if
    /// not listening. Returns once all connection tasks are gone.
    pub async fn stop(&mut self) {
        let Some(listening) = self.listening.take() else {
            return;
        };
        let _ = listening.stop.send(());
        if let Err(e) = listening.task.await {
            error!("accept loop failed: {e}");
        }
    }

    /// Whether the accept loop is running. Turns false on its own if the
    /// listener fails.
    pub fn is_listening(&self) -> bool {
        self.listening.as_ref().is_some_and(|l| !l.task.is_finished())
    }

    /// The bound address while listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listening.as_ref().map(|l| l.local_addr)
    }

    /// Connections of the current (or last) listening period.
    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    /// Starts, waits for Ctrl-C or SIGTERM, then stops.
    pub async fn run_until_signal(&mut self) -> Result<(), Error> {
        self.start()?;
        shutdown_signal().await;
        info!("shutdown signal received");
        self.stop().await;
        Ok(())
    }
}

/// Binds with the advisory connection limit as the listen backlog.
fn listen(addr: SocketAddr, backlog: u32) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

// ── Accept loop ───────────────────────────────────────────────────────────────

async fn accept_loop(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    connections: ConnectionManager,
    idle_timeout: Duration,
    max_connections: u32,
    mut stop: oneshot::Receiver<()>,
) {
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            // Check stop first so it wins over queued connections.
            biased;

            _ = &mut stop => {
                debug!("stop requested");
                break;
            }

            res = listener.accept() => {
                let (stream, remote_addr) = match res {
                    Ok(v) => v,
                    Err(e) => {
                        error!("listener error, stopping: {e}");
                        break;
                    }
                };
                let local_addr = match stream.local_addr() {
                    Ok(a) => a,
                    Err(e) => {
                        debug!(peer = %remote_addr, "dropping connection without local address: {e}");
                        continue;
                    }
                };
                let Some(guard) = connections.register(remote_addr, local_addr) else {
                    continue;
                };

                let active = connections.active_count();
                if active > max_connections as usize {
                    warn!(active, max_connections, "more connections than the advisory maximum");
                }

                tasks.spawn(serve_connection(stream, guard, Arc::clone(&dispatcher), idle_timeout));
            }

            // Reap finished connection tasks so the JoinSet does not grow
            // without bound on long-running servers.
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
        }
    }

    drop(listener);
    connections.shutdown();
    while tasks.join_next().await.is_some() {}
    info!("perch stopped");
}

// ── Connection ────────────────────────────────────────────────────────────────

async fn serve_connection(
    stream: TcpStream,
    mut guard: ConnectionGuard,
    dispatcher: Arc<Dispatcher>,
    idle_timeout: Duration,
) {
    let conn = guard.identity().to_owned();
    let activity = Arc::new(Activity::new());
    let io = TokioIo::new(IdleStream::new(stream, Arc::clone(&activity)));

    // Each request is dispatched on its own task so that a connection
    // destroyed mid-request does not cancel the handler or its log record.
    let svc = service_fn(move |req: hyper::Request<Incoming>| {
        let dispatcher = Arc::clone(&dispatcher);
        async move {
            // hyper drops this future when the connection dies; `_alive` going
            // with it tells the dispatcher nobody will take the head.
            let (_alive, gone) = oneshot::channel::<()>();
            let gone = async move {
                let _ = gone.await;
            };
            let req = req.map(|body| body.boxed_unsync());
            let res = tokio::spawn(async move { dispatcher.dispatch_until(req, gone).await })
                .await
                .unwrap_or_else(|_| internal_error());
            Ok::<_, Infallible>(res)
        }
    });

    let builder = ConnBuilder::new(TokioExecutor::new());
    let serving = builder.serve_connection(io, svc);

    tokio::select! {
        res = serving => {
            if let Err(e) = res {
                if !is_abrupt_reset(&*e) {
                    error!(%conn, "connection error: {e}");
                }
            }
        }
        () = guard.destroyed() => {
            debug!(%conn, "connection destroyed");
        }
        () = idle(&activity, idle_timeout) => {
            debug!(%conn, ?idle_timeout, "idle timeout, destroying connection");
        }
    }
    // Dropping `guard` here records the close.
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on the first Ctrl-C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let sigterm = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c   => {}
        () = sigterm  => {}
    }
}
