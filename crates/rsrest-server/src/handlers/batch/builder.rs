//! Turns a parsed batch body into resolved sub-requests.
//!
//! Every href is normalized against the path the batch endpoint is mounted
//! under and resolved to a route before any job runs, so structural errors
//! reject the whole batch up front.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use rsrest_domain::{DomainError, SubRequest, Verb};

use crate::routes::{ResourceHandler, RouteTable};

/// A sub-request whose href has been normalized and routed.
pub(crate) struct PlannedRequest<C> {
    pub verb: Verb,
    pub href: String,
    pub body: Value,
    pub target: Target<C>,
}

pub(crate) enum Target<C> {
    Route {
        handler: Arc<dyn ResourceHandler<C>>,
        params: HashMap<String, String>,
    },
    /// Settles as a 404 when run.
    NotFound(DomainError),
}

impl<C> PlannedRequest<C> {
    pub fn is_read_only(&self) -> bool {
        self.verb.is_read_only()
    }
}

/// Resolved groups, in execution order, plus any routing warnings.
pub(crate) struct BatchPlan<C> {
    pub groups: Vec<Vec<PlannedRequest<C>>>,
    pub warnings: Vec<String>,
}

/// Path relative hrefs resolve against: the batch href minus its last segment.
///
/// `/api/v1/batch` yields `/api/v1/`.
pub fn base_path(batch_href: &str) -> String {
    let path = strip_query(batch_href).0.trim_end_matches('/');
    match path.rfind('/') {
        Some(index) => path[..=index].to_string(),
        None => "/".to_string(),
    }
}

/// Resolves `href` against `base` and removes `.` and `..` segments.
///
/// The result must stay at or below `base`; the query string is kept.
pub fn normalize_href(base: &str, href: &str) -> Result<String, DomainError> {
    let (path, query) = strip_query(href.trim());
    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{base}{path}")
    };

    let mut segments: Vec<&str> = Vec::new();
    for segment in joined.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(DomainError::across_boundary(href, base));
                }
            }
            other => segments.push(other),
        }
    }
    let mut normalized = format!("/{}", segments.join("/"));

    let boundary = base.trim_end_matches('/');
    let inside = boundary.is_empty()
        || normalized == boundary
        || normalized
            .strip_prefix(boundary)
            .is_some_and(|rest| rest.starts_with('/'));
    if !inside {
        return Err(DomainError::across_boundary(href, base));
    }

    if let Some(query) = query {
        normalized.push('?');
        normalized.push_str(query);
    }
    Ok(normalized)
}

fn strip_query(href: &str) -> (&str, Option<&str>) {
    match href.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (href, None),
    }
}

/// Normalizes and routes every sub-request of every group.
pub(crate) fn plan<C: Send + Sync + 'static>(
    routes: &RouteTable<C>,
    batch_href: &str,
    groups: Vec<Vec<SubRequest>>,
) -> Result<BatchPlan<C>, DomainError> {
    let base = base_path(batch_href);
    let batch_path = strip_query(batch_href).0.trim_end_matches('/');
    let mut warnings = Vec::new();

    let mut planned_groups = Vec::with_capacity(groups.len());
    for group in groups {
        let mut planned = Vec::with_capacity(group.len());
        for request in group {
            let href = normalize_href(&base, &request.href)?;
            if strip_query(&href).0 == batch_path {
                return Err(DomainError::batch_in_batch(&request.href));
            }

            let target = match routes.resolve(request.verb, &href) {
                Some(found) if found.handler.is_batch() => {
                    return Err(DomainError::batch_in_batch(&request.href));
                }
                Some(found) => {
                    warnings.extend(found.warning);
                    Target::Route {
                        handler: found.handler,
                        params: found.params,
                    }
                }
                None => {
                    debug!(verb = %request.verb, href = %href, "no route for batch element");
                    Target::NotFound(DomainError::route_not_found(request.verb.as_str(), &href))
                }
            };

            planned.push(PlannedRequest {
                verb: request.verb,
                href,
                body: request.body,
                target,
            });
        }
        planned_groups.push(planned);
    }

    Ok(BatchPlan {
        groups: planned_groups,
        warnings,
    })
}
