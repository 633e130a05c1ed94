//! # perch
//!
//! A minimal request server: a routing table with wildcard segments, a
//! request lifecycle that always answers and always logs, and connection
//! bookkeeping that can tear everything down at once.
//!
//! ## The contract
//!
//! hyper parses HTTP. perch does not. What's left for perch:
//!
//! - **Routing**: one segment tree per method; `*` captures one segment
//! - **Dispatch**: the handler runs as its own task; failures become 500s
//!   when nothing was sent yet, and every request gets one access record
//! - **Connections**: identity per socket, idle timeouts, abrupt stop
//!
//! What perch intentionally leaves out: TLS, middleware chains, and graceful
//! draining. [`Server::stop`] destroys open connections on the spot.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use perch::{BoxError, Context, Server, ServerConfig};
//! use http::{Method, StatusCode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), perch::Error> {
//!     let mut server = Server::new(ServerConfig::builder().port(3000).build());
//!     server
//!         .set_handler(Method::GET, "/entity/*/devices", devices)
//!         .set_handler(Method::POST, "/entity", create);
//!
//!     server.run_until_signal().await
//! }
//!
//! async fn devices(ctx: Context) -> Result<(), BoxError> {
//!     let entity = ctx.param(0).unwrap_or_default().to_owned();
//!     ctx.response().send(StatusCode::OK, format!(r#"{{"entity":"{entity}"}}"#)).await?;
//!     Ok(())
//! }
//!
//! async fn create(mut ctx: Context) -> Result<(), BoxError> {
//!     let body = ctx.body_bytes().await?;
//!     if body.is_empty() {
//!         ctx.response().send(StatusCode::BAD_REQUEST, "empty body").await?;
//!         return Ok(());
//!     }
//!     ctx.response().send(StatusCode::CREATED, body).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Logging
//!
//! perch logs through [`tracing`]. Each request produces one `info` event
//! with target [`ACCESS_LOG_TARGET`] carrying `method`, `path`, `version`,
//! `status` and `elapsed_ms`. Install any subscriber to see them.

mod config;
mod connection;
mod context;
mod dispatch;
mod error;
mod handler;
mod response;
mod router;
mod server;

pub use config::{ServerConfig, ServerConfigBuilder};
pub use connection::{ConnectionGuard, ConnectionHandle, ConnectionManager, identity, is_abrupt_reset};
pub use context::{Context, RequestBody, Url, full_body};
pub use dispatch::{ACCESS_LOG_TARGET, Dispatcher};
pub use error::{BoxError, Error, HandlerFailure, ResponseError};
pub use handler::Handler;
pub use response::{Response, ResponseBody};
pub use router::{Lookup, RoutingTable, WILDCARD};
pub use server::Server;
