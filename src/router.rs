//! Segment-tree request router.
//!
//! One tree per HTTP method. A pattern is split on `/`, empty segments are
//! dropped, and a segment that is exactly `*` matches any single concrete
//! segment and captures its value.
//!
//! ```text
//! GET /entity/*/devices
//!
//! root ── "entity" ── * ── "devices" → handler
//! ```
//!
//! Matching is greedy: at every depth a literal child beats the wildcard
//! child, and a literal branch that dead-ends further down is *not* retried
//! through its wildcard sibling.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use http::Method;
use tracing::debug;

use crate::handler::{BoxedHandler, Handler};

/// The segment that captures any single path segment.
pub const WILDCARD: &str = "*";

/// A node in a per-method path tree.
#[derive(Clone)]
enum Node {
    /// A handler bound at this path with nothing below it.
    Leaf(BoxedHandler),
    /// Children by segment, plus the handler bound at this exact path, if any.
    /// The wildcard child lives apart from the literals so that it can never
    /// be confused with a literal segment.
    Branch {
        literals: HashMap<String, Node>,
        wildcard: Option<Box<Node>>,
        terminal: Option<BoxedHandler>,
    },
}

impl Node {
    fn branch() -> Self {
        Self::with_terminal(None)
    }

    fn with_terminal(terminal: Option<BoxedHandler>) -> Self {
        Self::Branch { literals: HashMap::new(), wildcard: None, terminal }
    }

    /// Returns the child for `segment`, creating it with `make` if absent.
    /// A leaf becomes a branch whose terminal handler is the former leaf
    /// handler.
    fn child_or_insert(&mut self, segment: &str, make: impl FnOnce() -> Node) -> &mut Node {
        match self {
            Self::Branch { literals, wildcard, .. } => {
                if segment == WILDCARD {
                    &mut **wildcard.get_or_insert_with(|| Box::new(make()))
                } else {
                    literals.entry(segment.to_owned()).or_insert_with(make)
                }
            }
            Self::Leaf(handler) => {
                *self = Self::with_terminal(Some(Arc::clone(handler)));
                self.child_or_insert(segment, make)
            }
        }
    }

    /// Literal first, wildcard only if there is no literal child. The flag
    /// tells whether the wildcard was taken.
    fn child(&self, segment: &str) -> Option<(&Node, bool)> {
        let Self::Branch { literals, wildcard, .. } = self else {
            return None;
        };
        match literals.get(segment) {
            Some(child) => Some((child, false)),
            None => wildcard.as_deref().map(|child| (child, true)),
        }
    }

    /// Binds `handler` at this node's own path. Both a leaf and a branch's
    /// terminal slot are overridden; the last registration wins.
    fn bind(&mut self, handler: BoxedHandler) -> bool {
        match self {
            Self::Leaf(existing) => {
                *existing = handler;
                true
            }
            Self::Branch { terminal, .. } => terminal.replace(handler).is_some(),
        }
    }

    fn handler(&self) -> Option<&BoxedHandler> {
        match self {
            Self::Leaf(handler) => Some(handler),
            Self::Branch { terminal, .. } => terminal.as_ref(),
        }
    }
}

/// The result of [`RoutingTable::lookup`].
pub struct Lookup {
    /// The matched handler, or `None` when nothing is bound.
    pub handler: Option<BoxedHandler>,
    /// Values captured by wildcard segments, left to right.
    pub params: Vec<String>,
}

impl Lookup {
    fn miss() -> Self {
        Self { handler: None, params: Vec::new() }
    }
}

/// The routing table: a path tree per method.
///
/// Built during setup, read on every request. Cloning is cheap enough to do
/// once per [`Server::start`](crate::Server::start); handlers are shared.
#[derive(Clone, Default)]
pub struct RoutingTable {
    roots: HashMap<Method, Node>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self { roots: HashMap::new() }
    }

    /// Binds `handler` to `method` + `pattern`.
    ///
    /// Leading, trailing and doubled slashes are ignored. The empty pattern
    /// (or `/`) binds the method's root. Registering the same path twice
    /// replaces the earlier handler.
    ///
    /// ```rust
    /// # use perch::{Context, RoutingTable};
    /// # use http::Method;
    /// # async fn devices(_: Context) -> Result<(), perch::BoxError> { Ok(()) }
    /// let mut routes = RoutingTable::new();
    /// routes.insert(Method::GET, "/entity/*/devices", devices);
    ///
    /// let found = routes.lookup(&Method::GET, "/entity/42/devices");
    /// assert!(found.handler.is_some());
    /// assert_eq!(found.params, ["42"]);
    /// ```
    pub fn insert(&mut self, method: Method, pattern: &str, handler: impl Handler) {
        self.insert_boxed(method, pattern, handler.into_boxed_handler());
    }

    pub(crate) fn insert_boxed(&mut self, method: Method, pattern: &str, handler: BoxedHandler) {
        let segments: Vec<&str> = split(pattern).collect();

        let Some((last, intermediate)) = segments.split_last() else {
            match self.roots.entry(method) {
                Entry::Occupied(mut root) => {
                    if root.get_mut().bind(handler) {
                        debug!(method = %root.key(), pattern, "route handler replaced");
                    }
                }
                Entry::Vacant(root) => {
                    root.insert(Node::Leaf(handler));
                }
            }
            return;
        };

        let mut node = self.roots.entry(method.clone()).or_insert_with(Node::branch);
        for segment in intermediate {
            node = node.child_or_insert(segment, Node::branch);
        }

        let mut vacant = false;
        let child = node.child_or_insert(last, || {
            vacant = true;
            Node::Leaf(Arc::clone(&handler))
        });
        if !vacant && child.bind(handler) {
            debug!(%method, pattern, "route handler replaced");
        }
    }

    /// Finds the handler for `method` + `path`.
    ///
    /// Fails for a path that does not start with `/` and for a method with
    /// nothing registered. On a miss the parameter list is always empty.
    pub fn lookup(&self, method: &Method, path: &str) -> Lookup {
        if !path.starts_with('/') {
            return Lookup::miss();
        }
        let Some(mut node) = self.roots.get(method) else {
            return Lookup::miss();
        };

        let mut params = Vec::new();
        for segment in split(path) {
            let Some((child, captured)) = node.child(segment) else {
                return Lookup::miss();
            };
            if captured {
                params.push(segment.to_owned());
            }
            node = child;
        }

        match node.handler() {
            Some(handler) => Lookup { handler: Some(Arc::clone(handler)), params },
            None => Lookup::miss(),
        }
    }
}

fn split(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}
