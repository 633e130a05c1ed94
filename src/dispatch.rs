//! Request dispatch: route, run the handler, finalize, log.
//!
//! Every request walks the same states, and every path ends in exactly one
//! access-log record:
//!
//! ```text
//! RECEIVED ─► ROUTED ─┬─► NOT_FOUND ──────────────► RESPONDED ───────┬─► LOGGED
//!                     └─► DISPATCHED ─► (settled) ─┬► RESPONDED ─────┤
//!                                                  └► FORCE_RESPONDED┘
//! ```
//!
//! The handler runs as its own task, so a failure (error or panic) comes
//! back as a value. Nothing cancels that task when the connection dies: its
//! response is closed, so later writes fail with
//! [`ResponseError::Closed`](crate::ResponseError), and it still settles, is
//! finalized and logged.

use std::any::Any;
use std::sync::Arc;

use http::header::ACCESS_CONTROL_ALLOW_ORIGIN;
use http::{HeaderValue, Method, StatusCode, Version};
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::context::{Context, RequestBody, Url};
use crate::error::{BoxError, HandlerFailure};
use crate::response::{Head, Response, ResponseBody, internal_error};
use crate::router::RoutingTable;

/// Target of the per-request access-log event.
pub const ACCESS_LOG_TARGET: &str = "perch::access";

/// Routes requests through a [`RoutingTable`] snapshot.
pub struct Dispatcher {
    routes: Arc<RoutingTable>,
    cors: Option<HeaderValue>,
}

impl Dispatcher {
    /// `cors` is the `Access-Control-Allow-Origin` value set on every
    /// response; `None` or an empty string disables it.
    pub fn new(routes: Arc<RoutingTable>, cors: Option<&str>) -> Self {
        let cors = cors.filter(|v| !v.is_empty()).and_then(|v| match HeaderValue::from_str(v) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(value = v, "invalid cross-origin value, header disabled");
                None
            }
        });
        Self { routes, cors }
    }

    /// Handles one request and returns the response head for the transport.
    ///
    /// The head may be returned before the handler settles, as soon as the
    /// handler sends it; the body then keeps streaming while the handler
    /// runs. The access record is emitted once the handler settles.
    pub async fn dispatch(&self, req: http::Request<RequestBody>) -> http::Response<ResponseBody> {
        self.dispatch_until(req, std::future::pending()).await
    }

    /// Like [`dispatch`](Dispatcher::dispatch), for a connection that may go
    /// away first. If `gone` resolves before the head is handed over, the
    /// response is closed: the handler's later writes fail with
    /// [`ResponseError::Closed`](crate::ResponseError). It is still
    /// finalized and logged once it settles.
    pub async fn dispatch_until(
        &self,
        req: http::Request<RequestBody>,
        gone: impl Future<Output = ()>,
    ) -> http::Response<ResponseBody> {
        let start = Instant::now();
        let (parts, body) = req.into_parts();
        let mut url = Url::parse(&parts.uri);
        let record = AccessRecord {
            method: parts.method.clone(),
            path: url.path.clone(),
            version: parts.version,
        };

        let (response, head) = Response::channel();
        if let Some(origin) = &self.cors {
            // Nothing has been sent yet, this cannot fail.
            let _ = response.set_header(ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
        }

        let found = self.routes.lookup(&parts.method, &url.path);
        let Some(handler) = found.handler else {
            let _ = response.set_status(StatusCode::NOT_FOUND);
            let _ = response.end();
            record.emit(start, response.status());
            return receive(head).await;
        };

        url.params = found.params;
        let ctx = Context::new(parts, body, url, response.clone());
        let mut task = tokio::spawn(async move { handler.call(ctx).await });
        let mut head = head;
        tokio::pin!(gone);

        let first = tokio::select! {
            biased;
            sent = &mut head => First::Head(sent),
            outcome = &mut task => First::Settled(outcome),
            () = &mut gone => First::Gone,
        };

        match first {
            First::Head(sent) if task.is_finished() => {
                finalize(task.await, &response);
                record.emit(start, response.status());
                sent.unwrap_or_else(|_| internal_error())
            }
            First::Head(sent) => {
                // Streaming: hand the head to the transport now, finish later.
                tokio::spawn(settle(task, response, record, start));
                sent.unwrap_or_else(|_| internal_error())
            }
            First::Settled(outcome) => {
                finalize(outcome, &response);
                record.emit(start, response.status());
                receive(head).await
            }
            First::Gone => {
                response.close();
                tokio::spawn(settle(task, response, record, start));
                internal_error()
            }
        }
    }
}

enum First {
    Head(Result<Head, oneshot::error::RecvError>),
    Settled(Result<Result<(), BoxError>, JoinError>),
    Gone,
}

async fn settle(task: JoinHandle<Result<(), BoxError>>, response: Response, record: AccessRecord, start: Instant) {
    finalize(task.await, &response);
    record.emit(start, response.status());
}

async fn receive(head: oneshot::Receiver<Head>) -> Head {
    head.await.unwrap_or_else(|_| internal_error())
}

/// Logs a failed handler and brings its response to a terminated state.
///
/// If the head went out, the status is left alone and the body is ended
/// unless the handler already did. Otherwise the response becomes a 500.
fn finalize(outcome: Result<Result<(), BoxError>, JoinError>, response: &Response) {
    let failure = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(HandlerFailure::Returned(e)),
        Err(e) if e.is_panic() => Some(HandlerFailure::Panicked(panic_message(e.into_panic()))),
        Err(e) => Some(HandlerFailure::Returned(Box::new(e))),
    };
    if let Some(failure) = &failure {
        error!(panic = failure.is_panic(), "{failure}");
    }

    if response.headers_sent() {
        if !response.is_ended() {
            let _ = response.end();
        }
    } else {
        let _ = response.set_status(StatusCode::INTERNAL_SERVER_ERROR);
        let _ = response.end();
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// What the access log needs from the request, captured before dispatch.
struct AccessRecord {
    method: Method,
    path: String,
    version: Version,
}

impl AccessRecord {
    fn emit(self, start: Instant, status: StatusCode) {
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        info!(
            target: ACCESS_LOG_TARGET,
            method = %self.method,
            path = %self.path,
            version = ?self.version,
            status = status.as_u16(),
            elapsed_ms,
            "request"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fmt;
    use std::sync::Mutex;
    use std::time::Duration;

    use bytes::Bytes;
    use http_body_util::BodyExt;
    use tracing::field::{Field, Visit};
    use tracing::{Event, Subscriber};
    use tracing_subscriber::layer::{Context as LayerContext, Layer, SubscriberExt};

    use super::*;
    use crate::context::full_body;
    use crate::error::ResponseError;

    // ── Access-log capture ────────────────────────────────────────────────────

    #[derive(Clone, Default)]
    struct Records(Arc<Mutex<Vec<HashMap<String, String>>>>);

    impl Records {
        fn install(&self) -> tracing::subscriber::DefaultGuard {
            tracing::subscriber::set_default(tracing_subscriber::registry().with(self.clone()))
        }

        fn take(&self) -> Vec<HashMap<String, String>> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    struct Fields(HashMap<String, String>);

    impl Visit for Fields {
        fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
            self.0.insert(field.name().to_owned(), format!("{value:?}"));
        }

        fn record_str(&mut self, field: &Field, value: &str) {
            self.0.insert(field.name().to_owned(), value.to_owned());
        }
    }

    impl<S: Subscriber> Layer<S> for Records {
        fn on_event(&self, event: &Event<'_>, _ctx: LayerContext<'_, S>) {
            if event.metadata().target() != ACCESS_LOG_TARGET {
                return;
            }
            let mut fields = Fields(HashMap::new());
            event.record(&mut fields);
            self.0.lock().unwrap().push(fields.0);
        }
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn get(uri: &str) -> http::Request<RequestBody> {
        http::Request::builder().method(Method::GET).uri(uri).body(full_body("")).unwrap()
    }

    async fn body(res: http::Response<ResponseBody>) -> Bytes {
        res.into_body().collect().await.unwrap().to_bytes()
    }

    fn dispatcher(routes: RoutingTable) -> Dispatcher {
        Dispatcher::new(Arc::new(routes), Some("*"))
    }

    /// Waits for the record a spawned finalizer emits after the head went out.
    async fn settled_record(records: &Records) -> HashMap<String, String> {
        for _ in 0..100 {
            if !records.0.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        only_record(records)
    }

    fn only_record(records: &Records) -> HashMap<String, String> {
        let mut all = records.take();
        assert_eq!(all.len(), 1, "expected exactly one access record, got {all:?}");
        all.remove(0)
    }

    async fn params_echo(ctx: Context) -> Result<(), BoxError> {
        let joined = ctx.params().join(",");
        ctx.response().send(StatusCode::OK, joined).await?;
        Ok(())
    }

    // ── Tests ─────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn routes_wildcards_and_404s() {
        let records = Records::default();
        let _guard = records.install();

        let mut routes = RoutingTable::new();
        routes.insert(Method::GET, "/entity/*/devices", params_echo);
        let d = dispatcher(routes);

        let res = d.dispatch(get("/entity/42/devices")).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(body(res).await, "42");

        let record = only_record(&records);
        assert_eq!(record["status"], "200");
        assert_eq!(record["method"], "GET");
        assert_eq!(record["path"], "/entity/42/devices");
        assert_eq!(record["version"], "HTTP/1.1");
        assert!(record["elapsed_ms"].parse::<f64>().unwrap() >= 0.0);

        let res = d.dispatch(get("/entity/42/sensors")).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert_eq!(res.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert!(body(res).await.is_empty());
        assert_eq!(only_record(&records)["status"], "404");
    }

    #[tokio::test]
    async fn cors_header_can_be_disabled() {
        let d = Dispatcher::new(Arc::new(RoutingTable::new()), Some(""));
        let res = d.dispatch(get("/nothing")).await;
        assert!(res.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN).is_none());

        let d = Dispatcher::new(Arc::new(RoutingTable::new()), None);
        let res = d.dispatch(get("/nothing")).await;
        assert!(res.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
    }

    #[tokio::test]
    async fn query_reaches_the_handler() {
        async fn search(ctx: Context) -> Result<(), BoxError> {
            let q = ctx.query("q").unwrap_or("").to_owned();
            ctx.response().send(StatusCode::OK, q).await?;
            Ok(())
        }
        let mut routes = RoutingTable::new();
        routes.insert(Method::GET, "/search", search);

        let res = dispatcher(routes).dispatch(get("/search?q=first&q=last")).await;
        assert_eq!(body(res).await, "last");
    }

    #[tokio::test]
    async fn panic_before_writing_is_a_500() {
        let records = Records::default();
        let _guard = records.install();

        async fn crash(_: Context) -> Result<(), BoxError> {
            panic!("crashed before writing");
        }
        let mut routes = RoutingTable::new();
        routes.insert(Method::GET, "/crash", crash);

        let res = dispatcher(routes).dispatch(get("/crash")).await;
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body(res).await.is_empty());
        assert_eq!(only_record(&records)["status"], "500");
    }

    #[tokio::test]
    async fn error_before_writing_is_a_500() {
        async fn fails(ctx: Context) -> Result<(), BoxError> {
            ctx.response().set_status(StatusCode::OK)?;
            Err("database unavailable".into())
        }
        let mut routes = RoutingTable::new();
        routes.insert(Method::GET, "/fails", fails);

        let res = dispatcher(routes).dispatch(get("/fails")).await;
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn silent_success_is_a_500() {
        async fn silent(_: Context) -> Result<(), BoxError> {
            Ok(())
        }
        let mut routes = RoutingTable::new();
        routes.insert(Method::GET, "/silent", silent);

        let res = dispatcher(routes).dispatch(get("/silent")).await;
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn failure_after_head_keeps_status_and_ends_once() {
        let records = Records::default();
        let _guard = records.install();

        let (seen_tx, seen_rx) = oneshot::channel::<Response>();
        let seen_tx = Arc::new(Mutex::new(Some(seen_tx)));
        let handler = move |ctx: Context| {
            let seen_tx = Arc::clone(&seen_tx);
            async move {
                let res = ctx.response().clone();
                if let Some(tx) = seen_tx.lock().unwrap().take() {
                    let _ = tx.send(res.clone());
                }
                res.set_status(StatusCode::OK)?;
                res.write("partial").await?;
                Err::<(), BoxError>("failed mid-body".into())
            }
        };
        let mut routes = RoutingTable::new();
        routes.insert(Method::GET, "/partial", handler);

        let res = dispatcher(routes).dispatch(get("/partial")).await;
        assert_eq!(res.status(), StatusCode::OK);
        // Collecting completes only because the dispatcher ended the body.
        assert_eq!(body(res).await, "partial");

        let response = seen_rx.await.unwrap();
        assert!(response.is_ended());
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.end(), Err(ResponseError::Ended));

        assert_eq!(settled_record(&records).await["status"], "200");
    }

    #[tokio::test]
    async fn streaming_handler_is_logged_after_it_settles() {
        let records = Records::default();
        let _guard = records.install();

        async fn slow(ctx: Context) -> Result<(), BoxError> {
            let res = ctx.response();
            res.write_head()?;
            tokio::time::sleep(Duration::from_millis(20)).await;
            res.write("done").await?;
            res.end()?;
            Ok(())
        }
        let mut routes = RoutingTable::new();
        routes.insert(Method::GET, "/slow", slow);

        let res = dispatcher(routes).dispatch(get("/slow")).await;
        assert_eq!(res.status(), StatusCode::OK);
        // The head is out but the handler is still sleeping.
        assert!(records.take().is_empty());

        assert_eq!(body(res).await, "done");
        assert_eq!(settled_record(&records).await["status"], "200");
    }

    #[tokio::test]
    async fn dropped_connection_fails_writes_but_still_logs() {
        let records = Records::default();
        let _guard = records.install();

        let (result_tx, result_rx) = oneshot::channel::<Result<(), ResponseError>>();
        let result_tx = Arc::new(Mutex::new(Some(result_tx)));
        let handler = move |ctx: Context| {
            let result_tx = Arc::clone(&result_tx);
            async move {
                let res = ctx.response();
                res.write_head()?;
                tokio::time::sleep(Duration::from_millis(20)).await;
                let outcome = res.write("too late").await;
                if let Some(tx) = result_tx.lock().unwrap().take() {
                    let _ = tx.send(outcome.clone());
                }
                outcome?;
                Ok::<(), BoxError>(())
            }
        };
        let mut routes = RoutingTable::new();
        routes.insert(Method::GET, "/gone", handler);

        let res = dispatcher(routes).dispatch(get("/gone")).await;
        drop(res);

        assert_eq!(result_rx.await.unwrap(), Err(ResponseError::Closed));
        assert_eq!(settled_record(&records).await["status"], "200");
    }

    #[tokio::test]
    async fn settled_handler_is_logged_before_the_head_returns() {
        let records = Records::default();
        let _guard = records.install();

        let mut routes = RoutingTable::new();
        routes.insert(Method::GET, "/entity/*", params_echo);

        let res = dispatcher(routes).dispatch(get("/entity/7")).await;
        assert_eq!(only_record(&records)["status"], "200");
        assert_eq!(body(res).await, "7");
    }

    #[tokio::test]
    async fn connection_lost_before_head_closes_the_response() {
        let records = Records::default();
        let _guard = records.install();

        let (result_tx, result_rx) = oneshot::channel::<Result<(), ResponseError>>();
        let result_tx = Arc::new(Mutex::new(Some(result_tx)));
        let handler = move |ctx: Context| {
            let result_tx = Arc::clone(&result_tx);
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                let outcome = ctx.response().send(StatusCode::OK, "too late").await;
                if let Some(tx) = result_tx.lock().unwrap().take() {
                    let _ = tx.send(outcome.clone());
                }
                outcome?;
                Ok::<(), BoxError>(())
            }
        };
        let mut routes = RoutingTable::new();
        routes.insert(Method::GET, "/slow", handler);

        let (alive, gone) = oneshot::channel::<()>();
        drop(alive);
        let gone = async move {
            let _ = gone.await;
        };
        let res = dispatcher(routes).dispatch_until(get("/slow"), gone).await;
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);

        assert_eq!(result_rx.await.unwrap(), Err(ResponseError::Closed));
        assert_eq!(settled_record(&records).await["status"], "200");
    }

    #[test]
    fn panic_messages() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(7_u8)), "non-string panic payload");
    }
}
