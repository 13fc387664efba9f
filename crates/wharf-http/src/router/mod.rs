//! Route matching.
//!
//! The router keeps an ordered list of `(route, handler)` pairs and
//! dispatches first-match-wins, in registration order. A route matches in
//! three stages: the method set (empty set accepts any method), the path
//! pattern, and finally the header predicates.

pub mod filter;
pub mod pattern;

use http::{HeaderName, Method};
use tracing::debug;

use crate::handler::RequestHandler;
use crate::protocol::{ParseError, RequestHead};
pub use filter::{HeaderPredicate, ValuePattern};
pub use pattern::{PathPattern, PatternError};

/// No route claimed the request. Stays internal to dispatch: the
/// connection driver turns it into a 404.
#[derive(Debug, thiserror::Error)]
#[error("no route matched the request")]
pub struct Unhandled;

/// Parameters bound by a matched route, in pattern order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathParams {
    entries: Vec<(String, String)>,
}

impl PathParams {
    pub fn empty() -> Self {
        Self::default()
    }

    pub(crate) fn new(entries: Vec<(String, String)>) -> Self {
        Self { entries }
    }

    pub fn get(&self, name: impl AsRef<str>) -> Option<&str> {
        let name = name.as_ref();
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A registered route: method set, path pattern, header predicates.
#[derive(Debug, Clone)]
pub struct Route {
    methods: Vec<Method>,
    pattern: PathPattern,
    predicates: Vec<HeaderPredicate>,
}

impl Route {
    /// A route for any method on `pattern`.
    pub fn new(pattern: &str) -> Result<Route, PatternError> {
        Ok(Route { methods: Vec::new(), pattern: PathPattern::parse(pattern)?, predicates: Vec::new() })
    }

    pub fn get(pattern: &str) -> Result<Route, PatternError> {
        Route::new(pattern).map(|r| r.method(Method::GET))
    }

    pub fn post(pattern: &str) -> Result<Route, PatternError> {
        Route::new(pattern).map(|r| r.method(Method::POST))
    }

    pub fn put(pattern: &str) -> Result<Route, PatternError> {
        Route::new(pattern).map(|r| r.method(Method::PUT))
    }

    pub fn delete(pattern: &str) -> Result<Route, PatternError> {
        Route::new(pattern).map(|r| r.method(Method::DELETE))
    }

    /// Adds a method to the accepted set; an empty set accepts any method.
    pub fn method(mut self, method: Method) -> Route {
        if !self.methods.contains(&method) {
            self.methods.push(method);
        }
        self
    }

    /// Requires `name` to be present and match `pattern`
    /// (literal, or `*` prefix/suffix wildcard).
    pub fn header(mut self, name: HeaderName, pattern: &str) -> Route {
        self.predicates.push(HeaderPredicate::new(name, ValuePattern::parse(pattern)));
        self
    }

    fn matches(&self, head: &RequestHead, segments: &[String], case_insensitive: bool) -> Option<PathParams> {
        if !self.methods.is_empty() && !self.methods.contains(head.method()) {
            return None;
        }
        let params = self.pattern.matches(segments, case_insensitive)?;
        if !self.predicates.iter().all(|predicate| predicate.check(head.headers())) {
            return None;
        }
        Some(PathParams::new(params))
    }
}

pub(crate) struct RouterItem {
    route: Route,
    handler: Box<dyn RequestHandler>,
}

impl RouterItem {
    pub(crate) fn handler(&self) -> &dyn RequestHandler {
        self.handler.as_ref()
    }
}

/// Ordered route table; first match wins.
///
/// Items are reference-counted so a dispatch result stays valid while
/// routes are added concurrently with in-flight requests.
pub struct Router {
    items: Vec<std::rc::Rc<RouterItem>>,
    case_insensitive: bool,
}

impl Router {
    pub fn new() -> Router {
        Router { items: Vec::new(), case_insensitive: false }
    }

    /// Makes literal path segments match case-insensitively.
    pub fn case_insensitive(mut self) -> Router {
        self.case_insensitive = true;
        self
    }

    /// Appends a route; later routes only see requests no earlier route
    /// claimed.
    pub fn add<H: RequestHandler + 'static>(&mut self, route: Route, handler: H) {
        self.items.push(std::rc::Rc::new(RouterItem { route, handler: Box::new(handler) }));
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Finds the first matching route for `head`.
    pub(crate) fn dispatch(
        &self,
        head: &RequestHead,
    ) -> Result<Option<(std::rc::Rc<RouterItem>, PathParams)>, ParseError> {
        let segments = head.path_segments()?;
        for item in &self.items {
            if let Some(params) = item.route.matches(head, &segments, self.case_insensitive) {
                return Ok(Some((item.clone(), params)));
            }
        }
        debug!(path = head.uri().path(), method = %head.method(), "no route matched");
        Ok(None)
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::route_fn;
    use crate::protocol::ResponseBody;
    use http::header::CONTENT_TYPE;
    use http::{Request, Response};

    fn ok_handler(tag: &'static str) -> impl RequestHandler {
        route_fn(move |_req| async move {
            Ok(Response::builder().status(200).header("x-tag", tag).body(ResponseBody::empty()).unwrap())
        })
    }

    fn head_for(method: Method, path: &str) -> RequestHead {
        Request::builder().method(method).uri(path).body(()).unwrap().into_parts().0.into()
    }

    #[test]
    fn insertion_order_wins() {
        let mut router = Router::new();
        router.add(Route::get("/a/*").unwrap(), ok_handler("wildcard"));
        router.add(Route::get("/a/b").unwrap(), ok_handler("literal"));

        let (item, _) = router.dispatch(&head_for(Method::GET, "/a/b")).unwrap().unwrap();
        assert!(item.route.pattern.has_wildcard(), "first registered route must win");
    }

    #[test]
    fn method_set_filters() {
        let mut router = Router::new();
        router.add(Route::get("/x").unwrap(), ok_handler("get"));

        assert!(router.dispatch(&head_for(Method::GET, "/x")).unwrap().is_some());
        assert!(router.dispatch(&head_for(Method::POST, "/x")).unwrap().is_none());
    }

    #[test]
    fn empty_method_set_accepts_anything() {
        let mut router = Router::new();
        router.add(Route::new("/x").unwrap(), ok_handler("any"));
        assert!(router.dispatch(&head_for(Method::DELETE, "/x")).unwrap().is_some());
    }

    #[test]
    fn params_bind_in_pattern_order() {
        let mut router = Router::new();
        router.add(Route::get("/u/{user}/p/{post}").unwrap(), ok_handler("params"));

        let (_, params) = router.dispatch(&head_for(Method::GET, "/u/42/p/7")).unwrap().unwrap();
        let collected: Vec<_> = params.iter().collect();
        assert_eq!(collected, vec![("user", "42"), ("post", "7")]);
        assert_eq!(params.get("post"), Some("7"));
    }

    #[test]
    fn header_predicates_gate_the_match() {
        let mut router = Router::new();
        router.add(
            Route::post("/submit").unwrap().header(CONTENT_TYPE, "application/*"),
            ok_handler("json"),
        );

        let plain = head_for(Method::POST, "/submit");
        assert!(router.dispatch(&plain).unwrap().is_none());

        let json: RequestHead = Request::builder()
            .method(Method::POST)
            .uri("/submit")
            .header(CONTENT_TYPE, "application/json")
            .body(())
            .unwrap()
            .into_parts()
            .0
            .into();
        assert!(router.dispatch(&json).unwrap().is_some());
    }

    #[test]
    fn unmatched_is_none_not_error() {
        let router = Router::new();
        assert!(router.dispatch(&head_for(Method::GET, "/nope")).unwrap().is_none());
    }
}
