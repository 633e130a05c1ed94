//! Minimal perch example: a clock, a wildcard route, and a handler that fails.
//!
//! Run with:
//!   RUST_LOG=debug cargo run --example basic
//!
//! Try:
//!   curl -i http://127.0.0.1:56789/time
//!   curl -i http://127.0.0.1:56789/entity/42/devices?limit=5
//!   curl -i http://127.0.0.1:56789/entity/42/sensors     → 404
//!   curl -i http://127.0.0.1:56789/broken                → 500

use std::time::{SystemTime, UNIX_EPOCH};

use http::header::CONTENT_TYPE;
use http::{HeaderValue, Method, StatusCode};
use perch::{BoxError, Context, Server, ServerConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), perch::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::var("PERCH_CONFIG") {
        Ok(path) => ServerConfig::from_toml_str(&std::fs::read_to_string(path)?)?,
        Err(_) => ServerConfig::default(),
    };

    let mut server = Server::new(config);
    server
        .set_handler(Method::GET, "/time", time)
        .set_handler(Method::GET, "/entity/*/devices", devices)
        .set_handler(Method::GET, "/broken", broken);

    server.run_until_signal().await
}

// GET /time → {"now": <unix millis>}
async fn time(ctx: Context) -> Result<(), BoxError> {
    let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis();
    let res = ctx.response();
    res.set_header(CONTENT_TYPE, HeaderValue::from_static("application/json"))?;
    res.send(StatusCode::OK, format!(r#"{{"now":{now}}}"#)).await?;
    Ok(())
}

// GET /entity/*/devices → the captured entity id, plus an optional ?limit=
async fn devices(ctx: Context) -> Result<(), BoxError> {
    let entity = ctx.param(0).unwrap_or_default();
    let limit = ctx.query("limit").unwrap_or("all");
    let body = format!("devices of {entity} (limit: {limit})\n");
    ctx.response().send(StatusCode::OK, body).await?;
    Ok(())
}

// Fails before writing anything: the dispatcher answers 500.
async fn broken(_ctx: Context) -> Result<(), BoxError> {
    Err("this handler always fails".into())
}
