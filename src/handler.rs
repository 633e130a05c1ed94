//! Handler trait and type erasure.
//!
//! # How async handlers are stored
//!
//! The routing table holds handlers of *different* types in one tree per
//! method, so every handler is hidden behind `dyn ErasedHandler` and shared
//! through an `Arc`:
//!
//! ```text
//! async fn devices(ctx: Context) -> Result<(), E>   ← user writes this
//!        ↓ server.set_handler(Method::GET, "/entity/*/devices", devices)
//! devices.into_boxed_handler()                      ← Handler blanket impl
//!        ↓
//! Arc::new(FnHandler(devices))                      ← stored as BoxedHandler
//!        ↓
//! handler.call(ctx)  inside the request's task      ← one vtable dispatch
//! ```
//!
//! A handler does not return a response. It writes one through
//! [`Context::response`](crate::Context::response) and reports only whether
//! it succeeded. Whatever it failed to finish, the dispatcher finishes.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::Context;
use crate::error::BoxError;

/// A heap-allocated, type-erased handler future.
pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send + 'static>>;

/// Internal dispatch interface.
///
/// `#[doc(hidden)] pub` rather than `pub(crate)` because it appears in the
/// return type of the public `Handler` trait's `into_boxed_handler` method.
#[doc(hidden)]
pub trait ErasedHandler {
    fn call(&self, ctx: Context) -> BoxFuture;
}

/// A type-erased handler shared by every request that routes to it.
#[doc(hidden)]
pub type BoxedHandler = Arc<dyn ErasedHandler + Send + Sync + 'static>;

/// Implemented for every valid route handler.
///
/// Satisfied automatically by any function with the shape
///
/// ```text
/// async fn name(ctx: Context) -> Result<(), E>   where E: Into<BoxError>
/// ```
///
/// The trait is sealed: only the blanket impl below can satisfy it.
pub trait Handler: private::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_handler(self) -> BoxedHandler;
}

mod private {
    pub trait Sealed {}
}

impl<F, Fut, E> private::Sealed for F
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<BoxError> + 'static,
{
}

impl<F, Fut, E> Handler for F
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<BoxError> + 'static,
{
    fn into_boxed_handler(self) -> BoxedHandler {
        Arc::new(FnHandler(self))
    }
}

/// Bridges a concrete handler `F` into the trait-object world.
struct FnHandler<F>(F);

impl<F, Fut, E> ErasedHandler for FnHandler<F>
where
    F: Fn(Context) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<BoxError> + 'static,
{
    fn call(&self, ctx: Context) -> BoxFuture {
        let fut = (self.0)(ctx);
        Box::pin(async move { fut.await.map_err(Into::into) })
    }
}
