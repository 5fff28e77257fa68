//! Route table mapping `(verb, href)` to resource handlers.
//!
//! Patterns are `/`-separated; a segment starting with `:` captures one path
//! segment into a named parameter. When several patterns match, the one with
//! the most literal segments wins. Equally specific matches resolve to the
//! route registered first and carry an `ambiguous route` warning.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use rsrest_domain::{JobError, RequestHandle, SubResponse, Verb};

use crate::phase::PhaseSyncer;

/// Everything a handler receives for one sub-request.
pub struct HandlerCall<C> {
    pub request: RequestHandle,
    /// Captured `:param` segments.
    pub params: HashMap<String, String>,
    pub body: Value,
    /// Context shared by every job of the run (e.g. the batch transaction).
    pub shared: Arc<C>,
}

impl<C> HandlerCall<C> {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

impl<C> fmt::Debug for HandlerCall<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerCall")
            .field("request", &self.request)
            .field("params", &self.params)
            .field("body", &self.body)
            .finish_non_exhaustive()
    }
}

/// A resource endpoint that can run inside a phase-synchronized batch.
///
/// Handlers call `syncer.phase()` at their checkpoints. A handler that never
/// does so simply runs unsynchronized.
#[async_trait]
pub trait ResourceHandler<C>: Send + Sync {
    async fn handle(&self, syncer: PhaseSyncer, call: HandlerCall<C>)
        -> Result<SubResponse, JobError>;

    /// Whether this handler is the batch endpoint itself.
    fn is_batch(&self) -> bool {
        false
    }
}

/// Errors raised while registering routes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("route pattern must start with '/': {pattern}")]
    NotAbsolute { pattern: String },

    #[error("empty parameter name in route pattern {pattern}")]
    EmptyParam { pattern: String },

    #[error("duplicate parameter '{name}' in route pattern {pattern}")]
    DuplicateParam { pattern: String, name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

struct Route<C> {
    verb: Verb,
    pattern: String,
    segments: Vec<Segment>,
    handler: Arc<dyn ResourceHandler<C>>,
}

impl<C> Route<C> {
    fn specificity(&self) -> usize {
        self.segments
            .iter()
            .filter(|segment| matches!(segment, Segment::Literal(_)))
            .count()
    }

    fn capture(&self, parts: &[&str]) -> Option<HashMap<String, String>> {
        if parts.len() != self.segments.len() {
            return None;
        }
        let mut params = HashMap::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(literal) if literal == part => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => {
                    params.insert(name.clone(), (*part).to_string());
                }
            }
        }
        Some(params)
    }
}

/// Result of resolving a path against the table.
pub struct RouteMatch<C> {
    pub handler: Arc<dyn ResourceHandler<C>>,
    pub pattern: String,
    pub params: HashMap<String, String>,
    /// Set when another route matched equally well.
    pub warning: Option<String>,
}

impl<C> fmt::Debug for RouteMatch<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteMatch")
            .field("pattern", &self.pattern)
            .field("params", &self.params)
            .field("warning", &self.warning)
            .finish_non_exhaustive()
    }
}

/// Ordered collection of routes.
pub struct RouteTable<C> {
    routes: Vec<Route<C>>,
}

impl<C> Default for RouteTable<C> {
    fn default() -> Self {
        Self { routes: Vec::new() }
    }
}

impl<C: Send + Sync + 'static> RouteTable<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for `verb` on `pattern`.
    pub fn add(
        &mut self,
        verb: Verb,
        pattern: &str,
        handler: Arc<dyn ResourceHandler<C>>,
    ) -> Result<(), RouteError> {
        let segments = parse_pattern(pattern)?;
        self.routes.push(Route {
            verb,
            pattern: pattern.to_string(),
            segments,
            handler,
        });
        Ok(())
    }

    /// Builder form of [`RouteTable::add`].
    pub fn with_route(
        mut self,
        verb: Verb,
        pattern: &str,
        handler: Arc<dyn ResourceHandler<C>>,
    ) -> Result<Self, RouteError> {
        self.add(verb, pattern, handler)?;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Finds the most specific route for `verb` and `href`.
    ///
    /// Any query string is ignored.
    pub fn resolve(&self, verb: Verb, href: &str) -> Option<RouteMatch<C>> {
        let path = href.split(['?', '#']).next().unwrap_or_default();
        let parts = split_path(path);

        let mut best: Option<(&Route<C>, HashMap<String, String>)> = None;
        let mut tied: Vec<&str> = Vec::new();

        for route in self.routes.iter().filter(|route| route.verb == verb) {
            let Some(params) = route.capture(&parts) else {
                continue;
            };
            match &best {
                Some((current, _)) if route.specificity() < current.specificity() => {}
                Some((current, _)) if route.specificity() == current.specificity() => {
                    tied.push(route.pattern.as_str());
                }
                _ => {
                    tied.clear();
                    best = Some((route, params));
                }
            }
        }

        let (route, params) = best?;
        let warning = if tied.is_empty() {
            None
        } else {
            let message = format!(
                "ambiguous route: {verb} {path} matches {} and {}; using {}",
                route.pattern,
                tied.join(", "),
                route.pattern
            );
            warn!(%verb, path, chosen = %route.pattern, others = ?tied, "ambiguous route");
            Some(message)
        };

        Some(RouteMatch {
            handler: Arc::clone(&route.handler),
            pattern: route.pattern.clone(),
            params,
            warning,
        })
    }
}

fn parse_pattern(pattern: &str) -> Result<Vec<Segment>, RouteError> {
    if !pattern.starts_with('/') {
        return Err(RouteError::NotAbsolute {
            pattern: pattern.to_string(),
        });
    }
    let mut segments = Vec::new();
    let mut names: Vec<&str> = Vec::new();
    for part in split_path(pattern) {
        match part.strip_prefix(':') {
            Some("") => {
                return Err(RouteError::EmptyParam {
                    pattern: pattern.to_string(),
                })
            }
            Some(name) => {
                if names.contains(&name) {
                    return Err(RouteError::DuplicateParam {
                        pattern: pattern.to_string(),
                        name: name.to_string(),
                    });
                }
                names.push(name);
                segments.push(Segment::Param(name.to_string()));
            }
            None => segments.push(Segment::Literal(part.to_string())),
        }
    }
    Ok(segments)
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|part| !part.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl ResourceHandler<()> for Named {
        async fn handle(
            &self,
            _syncer: PhaseSyncer,
            _call: HandlerCall<()>,
        ) -> Result<SubResponse, JobError> {
            Ok(SubResponse::ok(Value::String(self.0.to_string())))
        }
    }

    fn named(name: &'static str) -> Arc<dyn ResourceHandler<()>> {
        Arc::new(Named(name))
    }

    fn table() -> RouteTable<()> {
        RouteTable::new()
            .with_route(Verb::Get, "/api/rows", named("list"))
            .and_then(|t| t.with_route(Verb::Get, "/api/rows/:id", named("get")))
            .and_then(|t| t.with_route(Verb::Get, "/api/rows/count", named("count")))
            .and_then(|t| t.with_route(Verb::Put, "/api/rows/:id", named("put")))
            .unwrap()
    }

    #[test]
    fn test_resolve_captures_params() {
        let found = table().resolve(Verb::Get, "/api/rows/42").unwrap();
        assert_eq!(found.pattern, "/api/rows/:id");
        assert_eq!(found.params.get("id").map(String::as_str), Some("42"));
        assert!(found.warning.is_none());
    }

    #[test]
    fn test_literal_segment_beats_param() {
        let found = table().resolve(Verb::Get, "/api/rows/count").unwrap();
        assert_eq!(found.pattern, "/api/rows/count");
        assert!(found.params.is_empty());
    }

    #[test]
    fn test_verb_must_match() {
        let table = table();
        assert!(table.resolve(Verb::Delete, "/api/rows/1").is_none());
        assert_eq!(table.resolve(Verb::Put, "/api/rows/1").unwrap().pattern, "/api/rows/:id");
    }

    #[test]
    fn test_query_and_trailing_slash_are_ignored() {
        let found = table().resolve(Verb::Get, "/api/rows/?limit=10").unwrap();
        assert_eq!(found.pattern, "/api/rows");
    }

    #[test]
    fn test_no_match_returns_none() {
        assert!(table().resolve(Verb::Get, "/api/other").is_none());
        assert!(table().resolve(Verb::Get, "/api/rows/1/extra").is_none());
    }

    #[test]
    fn test_equally_specific_routes_use_first_and_warn() {
        let table = RouteTable::new()
            .with_route(Verb::Get, "/api/:kind/1", named("first"))
            .and_then(|t| t.with_route(Verb::Get, "/api/rows/:id", named("second")))
            .unwrap();

        let found = table.resolve(Verb::Get, "/api/rows/1").unwrap();
        assert_eq!(found.pattern, "/api/:kind/1");
        let warning = found.warning.unwrap();
        assert!(warning.starts_with("ambiguous route"), "{warning}");
        assert!(warning.contains("/api/rows/:id"));
    }

    #[test]
    fn test_invalid_patterns_are_rejected() {
        let mut table: RouteTable<()> = RouteTable::new();
        assert!(matches!(
            table.add(Verb::Get, "api/rows", named("x")),
            Err(RouteError::NotAbsolute { .. })
        ));
        assert!(matches!(
            table.add(Verb::Get, "/api/:", named("x")),
            Err(RouteError::EmptyParam { .. })
        ));
        assert!(matches!(
            table.add(Verb::Get, "/api/:id/:id", named("x")),
            Err(RouteError::DuplicateParam { .. })
        ));
        assert!(table.is_empty());
    }
}
