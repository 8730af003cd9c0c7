//! Route table used by the HTTP transport.
//!
//! The transport only talks to the [`Router`] trait, so the table can be
//! replaced (e.g. to add host-based dispatch) without touching binding or
//! lifecycle code. [`MethodRouterTable`] is the default, backed by axum.

use std::collections::{BTreeMap, HashMap, HashSet};

use axum::http::Method;
use axum::routing::{MethodFilter, MethodRouter};

use super::endpoint::HttpHandler;

/// Errors from adding routes.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("route {method} {path} is already registered")]
    Duplicate { method: Method, path: String },

    #[error("method {0} cannot be routed")]
    UnsupportedMethod(Method),

    #[error("invalid route path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },
}

/// A table mapping (method, path) pairs to handlers.
pub trait Router: Send {
    /// Routes every combination of `methods` and `paths` to `handler`.
    ///
    /// # Errors
    ///
    /// Fails if a pair is already routed, a method is unsupported, or a path
    /// is malformed. On error the table is left unchanged.
    fn handle(&mut self, methods: &[Method], paths: &[String], handler: HttpHandler) -> Result<(), RouteError>;

    /// Handler for requests that match no route.
    fn set_not_found(&mut self, handler: HttpHandler);

    /// Number of (method, path) pairs routed so far.
    fn route_count(&self) -> usize;

    /// Converts the table into a servable axum router.
    fn into_axum(self: Box<Self>) -> axum::Router;
}

/// Default [`Router`]: one axum `MethodRouter` per path.
///
/// A known path requested with an unrouted method answers 405; an unknown
/// path answers 404 unless a not-found handler is set.
#[derive(Default)]
pub struct MethodRouterTable {
    routes: BTreeMap<String, MethodRouter>,
    registered: HashSet<(Method, String)>,
    // Capture-normalized shape -> path, so "/u/{id}" and "/u/{name}" cannot coexist.
    shapes: HashMap<String, String>,
    not_found: Option<HttpHandler>,
}

impl MethodRouterTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn validate_path(path: &str) -> Result<(), RouteError> {
    let invalid = |reason| RouteError::InvalidPath {
        path: path.to_string(),
        reason,
    };
    if !path.starts_with('/') {
        return Err(invalid("must start with '/'"));
    }

    let segments: Vec<&str> = path.split('/').collect();
    let last = segments.len() - 1;
    for (index, segment) in segments.iter().enumerate() {
        if segment.starts_with(':') || segment.starts_with('*') {
            return Err(invalid("captures are written as {name} or {*rest}"));
        }
        if !segment.contains(['{', '}']) {
            continue;
        }
        // A capture spans the whole segment: exactly one `{name}` or `{*rest}`.
        let Some(name) = segment
            .strip_prefix('{')
            .and_then(|inner| inner.strip_suffix('}'))
        else {
            return Err(invalid("unbalanced braces or text around a capture"));
        };
        if name.contains(['{', '}']) {
            return Err(invalid("only one capture is allowed per segment"));
        }
        let (wildcard, name) = match name.strip_prefix('*') {
            Some(rest) => (true, rest),
            None => (false, name),
        };
        if name.is_empty() || name.contains('*') {
            return Err(invalid("capture names must be non-empty and contain no '*'"));
        }
        if wildcard && index != last {
            return Err(invalid("a {*rest} capture must be the last segment"));
        }
    }
    Ok(())
}

fn path_shape(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if segment.starts_with('{') && segment.ends_with('}') {
                "{}"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

impl Router for MethodRouterTable {
    fn handle(&mut self, methods: &[Method], paths: &[String], handler: HttpHandler) -> Result<(), RouteError> {
        let mut pairs = Vec::with_capacity(methods.len() * paths.len());
        for path in paths {
            validate_path(path)?;
            if let Some(existing) = self.shapes.get(&path_shape(path)) {
                if existing != path {
                    return Err(RouteError::InvalidPath {
                        path: path.clone(),
                        reason: "conflicts with a route using different capture names",
                    });
                }
            }
            for method in methods {
                let filter = MethodFilter::try_from(method.clone())
                    .map_err(|_| RouteError::UnsupportedMethod(method.clone()))?;
                let key = (method.clone(), path.clone());
                if self.registered.contains(&key) || pairs.iter().any(|(_, k)| *k == key) {
                    return Err(RouteError::Duplicate {
                        method: method.clone(),
                        path: path.clone(),
                    });
                }
                pairs.push((filter, key));
            }
        }

        for (filter, key) in pairs {
            self.shapes.insert(path_shape(&key.1), key.1.clone());
            let route = self.routes.remove(&key.1).unwrap_or_else(MethodRouter::new);
            self.routes
                .insert(key.1.clone(), route.on_service(filter, handler.clone()));
            tracing::debug!(method = %key.0, path = %key.1, "route registered");
            self.registered.insert(key);
        }
        Ok(())
    }

    fn set_not_found(&mut self, handler: HttpHandler) {
        self.not_found = Some(handler);
    }

    fn route_count(&self) -> usize {
        self.registered.len()
    }

    fn into_axum(self: Box<Self>) -> axum::Router {
        let table = *self;
        let mut router = table
            .routes
            .into_iter()
            .fold(axum::Router::new(), |router, (path, route)| router.route(&path, route));
        if let Some(not_found) = table.not_found {
            router = router.fallback_service(not_found);
        }
        router
    }
}

impl std::fmt::Debug for MethodRouterTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodRouterTable")
            .field("paths", &self.routes.keys().collect::<Vec<_>>())
            .field("routes", &self.registered.len())
            .field("not_found", &self.not_found.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::extract::Request;
    use axum::http::StatusCode;
    use tower::ServiceExt;

    use super::*;
    use crate::network::endpoint::into_handler;

    fn text(body: &'static str) -> HttpHandler {
        into_handler(tower::service_fn(move |_request: Request| async move {
            Ok::<_, std::convert::Infallible>(body)
        }))
    }

    fn request(method: Method, uri: &str) -> Request {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn paths(items: &[&str]) -> Vec<String> {
        items.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn routes_dispatch_by_method_and_path() {
        let mut table = MethodRouterTable::new();
        table
            .handle(&[Method::GET], &paths(&["/a", "/b"]), text("read"))
            .unwrap();
        table.handle(&[Method::POST], &paths(&["/a"]), text("write")).unwrap();
        assert_eq!(table.route_count(), 3);

        let app = Box::new(table).into_axum();

        let response = app.clone().oneshot(request(Method::POST, "/a")).await.unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"write");

        let response = app.clone().oneshot(request(Method::GET, "/b")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.clone().oneshot(request(Method::DELETE, "/a")).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        let response = app.oneshot(request(Method::GET, "/missing")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn not_found_handler_answers_unknown_paths() {
        let mut table = MethodRouterTable::new();
        table.handle(&[Method::GET], &paths(&["/a"]), text("a")).unwrap();
        table.set_not_found(text("nothing here"));

        let app = Box::new(table).into_axum();
        let response = app.oneshot(request(Method::GET, "/zzz")).await.unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"nothing here");
    }

    #[tokio::test]
    async fn captures_use_brace_syntax() {
        let mut table = MethodRouterTable::new();
        table
            .handle(&[Method::GET], &paths(&["/users/{id}"]), text("user"))
            .unwrap();
        let app = Box::new(table).into_axum();
        let response = app.oneshot(request(Method::GET, "/users/42")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn duplicates_are_rejected_without_partial_registration() {
        let mut table = MethodRouterTable::new();
        table.handle(&[Method::GET], &paths(&["/a"]), text("a")).unwrap();

        let err = table
            .handle(&[Method::PUT, Method::GET], &paths(&["/a"]), text("b"))
            .unwrap_err();
        assert_eq!(
            err,
            RouteError::Duplicate {
                method: Method::GET,
                path: "/a".to_string()
            }
        );
        assert_eq!(table.route_count(), 1);

        let err = table
            .handle(&[Method::POST], &paths(&["/c", "/c"]), text("c"))
            .unwrap_err();
        assert!(matches!(err, RouteError::Duplicate { .. }));
    }

    #[test]
    fn malformed_paths_and_methods_are_rejected() {
        let mut table = MethodRouterTable::new();
        assert!(matches!(
            table.handle(&[Method::GET], &paths(&["a"]), text("a")),
            Err(RouteError::InvalidPath { .. })
        ));
        assert!(matches!(
            table.handle(&[Method::GET], &paths(&["/users/:id"]), text("a")),
            Err(RouteError::InvalidPath { .. })
        ));

        table
            .handle(&[Method::GET], &paths(&["/users/{id}"]), text("a"))
            .unwrap();
        assert!(matches!(
            table.handle(&[Method::PUT], &paths(&["/users/{name}"]), text("a")),
            Err(RouteError::InvalidPath { .. })
        ));

        let purge = Method::from_bytes(b"PURGE").unwrap();
        assert_eq!(
            table.handle(&[purge.clone()], &paths(&["/cache"]), text("a")),
            Err(RouteError::UnsupportedMethod(purge))
        );
        assert_eq!(table.route_count(), 1);
    }

    #[test]
    fn malformed_captures_are_rejected() {
        let mut table = MethodRouterTable::new();
        for path in [
            "/items/{id",
            "/items/id}",
            "/items/{}",
            "/items/{*}",
            "/files/{*rest}/meta",
            "/items/{a}{b}",
            "/items/{{id}}",
            "/items/v{id}",
        ] {
            assert!(
                matches!(
                    table.handle(&[Method::GET], &paths(&[path]), text("a")),
                    Err(RouteError::InvalidPath { .. })
                ),
                "{path}"
            );
        }
        assert_eq!(table.route_count(), 0);

        table
            .handle(&[Method::GET], &paths(&["/files/{*rest}"]), text("a"))
            .unwrap();
        let _app = Box::new(table).into_axum();
    }
}
