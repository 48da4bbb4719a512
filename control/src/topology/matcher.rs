//! Route Matcher - host/path lookup over the declared route rules
//!
//! Host match is exact and case-insensitive. Rules without a host are only
//! consulted when no rule for the request host matches. Among matching
//! rules the longest path wins, Exact beats Prefix at equal length, and the
//! first declared rule wins remaining ties.

use crate::apis::ingress::{BackendPort, PathType, RouteRule};
use crate::error::RoutingError;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

/// Result of matching one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    /// Declaration index of the winning rule
    pub order: usize,
    pub ingress: Arc<str>,
    /// Host of the winning rule, `None` for a host-less rule
    pub host: Option<Arc<str>>,
    pub service: Arc<str>,
    pub backend_port: BackendPort,
    pub path_type: PathType,
    /// The rule path that matched
    pub matched_path: Arc<str>,
    /// Path sent to the backend after rewriting
    pub forwarded_path: String,
}

impl RouteMatch {
    /// Forwarded path with the original query string re-attached
    pub fn forwarded_uri(&self, query: Option<&str>) -> String {
        match query {
            Some(q) if !q.is_empty() => format!("{}?{}", self.forwarded_path, q),
            _ => self.forwarded_path.clone(),
        }
    }
}

#[derive(Debug)]
struct CompiledRule {
    order: usize,
    ingress: Arc<str>,
    host: Option<Arc<str>>,
    path: Arc<str>,
    path_type: PathType,
    /// Non-empty segments of a prefix path
    segments: Vec<String>,
    rewrite_target: Option<String>,
    service: Arc<str>,
    backend_port: BackendPort,
}

impl CompiledRule {
    fn new(rule: &RouteRule) -> Self {
        Self {
            order: rule.order,
            ingress: Arc::from(rule.ingress.as_str()),
            host: rule.host.as_deref().map(|h| Arc::from(normalize_host(h).as_str())),
            path: Arc::from(rule.path.as_str()),
            path_type: rule.path_type,
            segments: segments(&rule.path).map(str::to_string).collect(),
            rewrite_target: rule.rewrite_target.clone(),
            service: Arc::from(rule.backend_service.as_str()),
            backend_port: rule.backend_port.clone(),
        }
    }

    /// Match length when `path` matches this rule
    fn match_len(&self, path: &str) -> Option<usize> {
        match self.path_type {
            PathType::Exact => (path == self.path.as_ref()).then(|| self.path.len()),
            PathType::Prefix | PathType::ImplementationSpecific => {
                let mut request = segments(path);
                for expected in &self.segments {
                    if request.next() != Some(expected.as_str()) {
                        return None;
                    }
                }
                Some(self.path.trim_end_matches('/').len().max(1))
            }
        }
    }

    fn to_match(&self, request_path: &str) -> RouteMatch {
        let forwarded_path = match self.rewrite_target.as_deref() {
            Some("") => "/".to_string(),
            Some(target) => target.to_string(),
            None => request_path.to_string(),
        };
        RouteMatch {
            order: self.order,
            ingress: Arc::clone(&self.ingress),
            host: self.host.clone(),
            service: Arc::clone(&self.service),
            backend_port: self.backend_port.clone(),
            path_type: self.path_type,
            matched_path: Arc::clone(&self.path),
            forwarded_path,
        }
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Lowercase, drop a `:port` suffix and a trailing dot
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let without_port = if let Some(rest) = host.strip_prefix('[') {
        // [v6]:port
        rest.split(']').next().unwrap_or(rest)
    } else {
        match host.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
            _ => host,
        }
    };
    without_port.trim_end_matches('.').to_ascii_lowercase()
}

/// Compiled, immutable route table
#[derive(Debug, Default)]
pub struct RouteTable {
    by_host: HashMap<Arc<str>, Vec<CompiledRule>>,
    any_host: Vec<CompiledRule>,
}

impl RouteTable {
    pub fn new(rules: &[RouteRule]) -> Self {
        let mut table = RouteTable::default();
        for rule in rules {
            let compiled = CompiledRule::new(rule);
            match &compiled.host {
                Some(host) => table
                    .by_host
                    .entry(Arc::clone(host))
                    .or_default()
                    .push(compiled),
                None => table.any_host.push(compiled),
            }
        }
        table
    }

    pub fn is_empty(&self) -> bool {
        self.by_host.is_empty() && self.any_host.is_empty()
    }

    /// Match a request by Host header and path (without query string)
    pub fn match_request(&self, host: &str, path: &str) -> Result<RouteMatch, RoutingError> {
        let normalized = normalize_host(host);

        let host_rules = self.by_host.get(normalized.as_str());
        let winner = host_rules
            .and_then(|rules| best_match(rules, path))
            .or_else(|| best_match(&self.any_host, path));

        winner
            .map(|rule| rule.to_match(path))
            .ok_or_else(|| RoutingError::RouteNotFound {
                host: normalized,
                path: path.to_string(),
            })
    }
}

fn best_match<'a>(rules: &'a [CompiledRule], path: &str) -> Option<&'a CompiledRule> {
    rules
        .iter()
        .filter_map(|rule| rule.match_len(path).map(|len| (rule, len)))
        .max_by(|(a, a_len), (b, b_len)| {
            a_len
                .cmp(b_len)
                .then_with(|| exactness(a).cmp(&exactness(b)))
                // Earlier declaration wins, so a lower order compares greater
                .then_with(|| b.order.cmp(&a.order))
        })
        .map(|(rule, _)| rule)
}

fn exactness(rule: &CompiledRule) -> Ordering {
    match rule.path_type {
        PathType::Exact => Ordering::Greater,
        _ => Ordering::Less,
    }
}
