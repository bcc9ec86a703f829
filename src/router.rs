//! Path → middleware-chain routing: exact-match table first, then
//! parametric (`:name`/`*`) routes compiled to regexes at registration
//! time, plus a separate WebSocket route table.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;

use crate::http::{Method, Request, Response};
use crate::websocket::WsHandler;

/// Whether a middleware lets the chain continue to the next entry, or
/// short-circuits it (e.g. an auth check that already wrote a 401).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

pub type Middleware = Arc<dyn Fn(&mut Request, &mut Response) -> Flow + Send + Sync>;

#[derive(Default, Clone)]
struct RouteNode {
    by_method: HashMap<&'static str, Vec<Middleware>>,
    wildcard: Option<Vec<Middleware>>,
}

impl RouteNode {
    fn chain_for(&self, method_str: &str) -> Option<&Vec<Middleware>> {
        self.by_method.get(method_str).or(self.wildcard.as_ref())
    }

    fn set(&mut self, method: Option<&'static str>, chain: Vec<Middleware>) {
        match method {
            Some(m) => {
                self.by_method.insert(m, chain);
            }
            None => self.wildcard = Some(chain),
        }
    }
}

struct RegexRoute {
    regex: Regex,
    param_names: Vec<String>,
    node: RouteNode,
}

pub struct RouteMatchResult {
    pub matched: bool,
    pub chain: Vec<Middleware>,
    pub params: HashMap<String, String>,
}

#[derive(Default)]
pub struct Router {
    exact: HashMap<String, RouteNode>,
    regex_routes: Vec<RegexRoute>,
    global: Vec<Middleware>,
    ws_routes: HashMap<String, Arc<dyn WsHandler>>,
}

impl Router {
    pub fn new() -> Self {
        Router::default()
    }

    /// Registers middleware that runs before every matched chain,
    /// regardless of path.
    pub fn use_middleware(&mut self, mw: Middleware) {
        self.global.push(mw);
    }

    /// Registers `chain` (middlewares followed by the terminal handler)
    /// for `method` (`None` = wildcard, matches any method not otherwise
    /// registered for this path) at `path`. Parametric segments
    /// (`:name`, `*`) compile `path` to a regex route; anything else is
    /// stored in the exact-match table.
    pub fn add(&mut self, method: Option<&'static str>, path: &str, chain: Vec<Middleware>) {
        if path.contains(':') || path.contains('*') {
            let (pattern, param_names) = compile_pattern(path);
            if let Some(existing) = self.regex_routes.iter_mut().find(|r| r.regex.as_str() == pattern) {
                existing.node.set(method, chain);
                return;
            }
            let regex = Regex::new(&pattern).expect("route pattern compiles");
            let mut node = RouteNode::default();
            node.set(method, chain);
            self.regex_routes.push(RegexRoute { regex, param_names, node });
        } else {
            self.exact.entry(path.to_string()).or_default().set(method, chain);
        }
    }

    pub fn get(&mut self, path: &str, chain: Vec<Middleware>) {
        self.add(Some("GET"), path, chain);
    }

    pub fn post(&mut self, path: &str, chain: Vec<Middleware>) {
        self.add(Some("POST"), path, chain);
    }

    pub fn all(&mut self, path: &str, chain: Vec<Middleware>) {
        self.add(None, path, chain);
    }

    pub fn add_websocket(&mut self, path: &str, handler: Arc<dyn WsHandler>) {
        self.ws_routes.insert(path.to_string(), handler);
    }

    pub fn match_websocket(&self, path: &str) -> Option<Arc<dyn WsHandler>> {
        self.ws_routes.get(path).cloned()
    }

    /// Exact-match table first, then regex routes in registration order
    /// for the first full match. The returned chain is the global
    /// middleware list followed by the matched per-method chain, so
    /// callers never need to special-case globals.
    pub fn match_route(&self, method_str: &str, path: &str) -> RouteMatchResult {
        if let Some(node) = self.exact.get(path) {
            if let Some(chain) = node.chain_for(method_str) {
                return RouteMatchResult {
                    matched: true,
                    chain: self.with_global(chain),
                    params: HashMap::new(),
                };
            }
        }

        for route in &self.regex_routes {
            if let Some(captures) = route.regex.captures(path) {
                if let Some(chain) = route.node.chain_for(method_str) {
                    let mut params = HashMap::new();
                    for name in &route.param_names {
                        if let Some(m) = captures.name(name) {
                            params.insert(name.clone(), m.as_str().to_string());
                        }
                    }
                    return RouteMatchResult {
                        matched: true,
                        chain: self.with_global(chain),
                        params,
                    };
                }
            }
        }

        RouteMatchResult { matched: false, chain: Vec::new(), params: HashMap::new() }
    }

    fn with_global(&self, chain: &[Middleware]) -> Vec<Middleware> {
        let mut full = self.global.clone();
        full.extend(chain.iter().cloned());
        full
    }
}

/// Converts a path template into an anchored regex, one named capture
/// group per `:name` segment and `(.*)` for a trailing `*`.
fn compile_pattern(path: &str) -> (String, Vec<String>) {
    let mut pattern = String::from("^");
    let mut names = Vec::new();
    for (i, segment) in path.split('/').enumerate() {
        if i > 0 {
            pattern.push('/');
        }
        if let Some(name) = segment.strip_prefix(':') {
            pattern.push_str(&format!("(?P<{name}>[A-Za-z0-9_]+)"));
            names.push(name.to_string());
        } else if segment == "*" {
            pattern.push_str("(?P<wildcard>.*)");
            names.push("wildcard".to_string());
        } else {
            pattern.push_str(&regex::escape(segment));
        }
    }
    pattern.push('$');
    (pattern, names)
}

/// Drives `chain` with a flat index cursor — never nested closures — so
/// chain depth never grows the call stack.
pub fn run_chain(chain: &[Middleware], req: &mut Request, resp: &mut Response) {
    for mw in chain {
        if mw(req, resp) == Flow::Stop {
            break;
        }
    }
}

pub fn method_str(method: Method) -> &'static str {
    method.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::StatusCode;

    fn handler(body: &'static str) -> Middleware {
        Arc::new(move |_req, resp| {
            resp.set_status_code(StatusCode::Ok);
            resp.set_body(body.as_bytes().to_vec());
            Flow::Continue
        })
    }

    #[test]
    fn exact_match_wins_over_regex() {
        let mut router = Router::new();
        router.get("/users/:id", vec![handler("param")]);
        router.get("/users/me", vec![handler("exact")]);
        let result = router.match_route("GET", "/users/me");
        assert!(result.matched);
        let mut req = Request::new();
        let mut resp = Response::new(false);
        run_chain(&result.chain, &mut req, &mut resp);
        assert_eq!(resp.body(), b"exact");
    }

    #[test]
    fn param_route_extracts_named_capture() {
        let mut router = Router::new();
        router.get("/users/:id", vec![handler("param")]);
        let result = router.match_route("GET", "/users/42");
        assert!(result.matched);
        assert_eq!(result.params.get("id"), Some(&"42".to_string()));
    }

    #[test]
    fn unmatched_path_reports_not_matched() {
        let router = Router::new();
        let result = router.match_route("GET", "/missing");
        assert!(!result.matched);
    }

    #[test]
    fn global_middleware_runs_before_matched_chain() {
        let mut router = Router::new();
        router.use_middleware(Arc::new(|_req, resp| {
            resp.set_header("X-Global", "1");
            Flow::Continue
        }));
        router.get("/ping", vec![handler("pong")]);
        let result = router.match_route("GET", "/ping");
        assert_eq!(result.chain.len(), 2);
    }

    #[test]
    fn stop_flow_short_circuits_remaining_middleware() {
        let mut router = Router::new();
        router.get(
            "/guarded",
            vec![
                Arc::new(|_req, resp| {
                    resp.set_status_code(StatusCode::Unauthorized);
                    Flow::Stop
                }),
                handler("never runs"),
            ],
        );
        let result = router.match_route("GET", "/guarded");
        let mut req = Request::new();
        let mut resp = Response::new(false);
        run_chain(&result.chain, &mut req, &mut resp);
        assert_eq!(resp.status_code(), StatusCode::Unauthorized);
        assert!(resp.body().is_empty());
    }
}
