//! Per-request context handed to a handler.

use std::collections::HashMap;

use bytes::Bytes;
use http::request::Parts;
use http::{HeaderMap, Method, Uri, Version};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use tracing::error;

use crate::response::Response;

/// Body of an inbound request.
pub type RequestBody = UnsyncBoxBody<Bytes, hyper::Error>;

/// Builds an in-memory request body, for driving a
/// [`Dispatcher`](crate::Dispatcher) without a socket.
pub fn full_body(bytes: impl Into<Bytes>) -> RequestBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed_unsync()
}

/// The request target split into its parts, plus the route's captures.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Url {
    pub path: String,
    /// Query-string pairs. A repeated key keeps its last value.
    pub query: HashMap<String, String>,
    /// Values captured by `*` segments, left to right.
    pub params: Vec<String>,
}

impl Url {
    pub(crate) fn parse(uri: &Uri) -> Self {
        let query = uri
            .query()
            .map(|q| serde_urlencoded::from_str::<Vec<(String, String)>>(q).unwrap_or_default())
            .unwrap_or_default()
            .into_iter()
            .collect();
        Self { path: uri.path().to_owned(), query, params: Vec::new() }
    }
}

/// Everything a handler gets for one request: the inbound request, the
/// outbound [`Response`], and the parsed URL.
pub struct Context {
    parts: Parts,
    body: Option<RequestBody>,
    url: Url,
    response: Response,
}

impl Context {
    pub(crate) fn new(parts: Parts, body: RequestBody, url: Url, response: Response) -> Self {
        Self { parts, body: Some(body), url, response }
    }

    pub fn method(&self) -> &Method { &self.parts.method }
    pub fn uri(&self) -> &Uri { &self.parts.uri }
    pub fn version(&self) -> Version { self.parts.version }
    pub fn headers(&self) -> &HeaderMap { &self.parts.headers }
    pub fn url(&self) -> &Url { &self.url }
    pub fn path(&self) -> &str { &self.url.path }
    pub fn response(&self) -> &Response { &self.response }

    /// Header value as a string. `None` if absent or not visible ASCII.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.parts.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn query(&self, key: &str) -> Option<&str> {
        self.url.query.get(key).map(String::as_str)
    }

    /// The whole query as a map. A repeated key keeps its last value.
    pub fn query_map(&self) -> &HashMap<String, String> {
        &self.url.query
    }

    /// All wildcard captures, left to right.
    ///
    /// For a route `/entity/*/devices`, `/entity/42/devices` gives `["42"]`.
    pub fn params(&self) -> &[String] {
        &self.url.params
    }

    /// The `index`-th wildcard capture.
    pub fn param(&self, index: usize) -> Option<&str> {
        self.url.params.get(index).map(String::as_str)
    }

    /// Takes the raw body stream. Subsequent calls return `None`.
    pub fn take_body(&mut self) -> Option<RequestBody> {
        self.body.take()
    }

    /// Reads the whole body. Empty if the body was already taken.
    ///
    /// A failing stream is logged here and returned to the caller; the
    /// response is left for the handler to finish.
    pub async fn body_bytes(&mut self) -> Result<Bytes, hyper::Error> {
        let Some(body) = self.body.take() else {
            return Ok(Bytes::new());
        };
        match body.collect().await {
            Ok(collected) => Ok(collected.to_bytes()),
            Err(e) => {
                error!(method = %self.parts.method, path = %self.url.path, "request stream error: {e}");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(uri: &str, body: &'static str) -> Context {
        let (parts, body) = http::Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("x-trace", "abc")
            .body(full_body(body))
            .unwrap()
            .into_parts();
        let url = Url::parse(&parts.uri);
        let (response, _head) = Response::channel();
        Context::new(parts, body, url, response)
    }

    #[test]
    fn query_last_value_wins() {
        let url = Url::parse(&"/search?q=a&page=2&q=b".parse().unwrap());
        assert_eq!(url.path, "/search");
        assert_eq!(url.query.get("q").map(String::as_str), Some("b"));
        assert_eq!(url.query.get("page").map(String::as_str), Some("2"));
    }

    #[test]
    fn query_is_percent_decoded() {
        let url = Url::parse(&"/s?name=J%C3%B6rg+M&empty=".parse().unwrap());
        assert_eq!(url.query["name"], "Jörg M");
        assert_eq!(url.query["empty"], "");
    }

    #[test]
    fn no_query_is_an_empty_map() {
        let url = Url::parse(&"/plain".parse().unwrap());
        assert!(url.query.is_empty());
        assert!(url.params.is_empty());
    }

    #[tokio::test]
    async fn accessors() {
        let mut ctx = context("/items?sort=asc", "payload");
        ctx.url.params = vec!["7".to_owned()];

        assert_eq!(ctx.method(), Method::POST);
        assert_eq!(ctx.path(), "/items");
        assert_eq!(ctx.query("sort"), Some("asc"));
        assert_eq!(ctx.query_map().get("sort").map(String::as_str), Some("asc"));
        assert_eq!(ctx.header("X-Trace"), Some("abc"));
        assert_eq!(ctx.param(0), Some("7"));
        assert_eq!(ctx.param(1), None);

        assert_eq!(ctx.body_bytes().await.unwrap(), "payload");
        assert!(ctx.body_bytes().await.unwrap().is_empty());
        assert!(ctx.take_body().is_none());
    }
}
