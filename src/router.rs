//! Gateway route resolution.
//!
//! Ingress gateways are searched in declaration order, and routes within a
//! gateway in declaration order. The first route whose host, path and method
//! all match wins; there is no specificity ranking. Put narrow routes before
//! broad wildcards.
//!
//! Egress gateways are kept for inspection but never match.

use crate::config::{GatewayConfig, GatewayType, RouteConfig, ROUTE_WILDCARD};
use http::Method;
use tracing::debug;

/// How a route path matches a request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathMatch<'a> {
    /// Path must be exactly this value.
    Exact(&'a str),
    /// Path must start with this prefix (the route path minus its `*`).
    Prefix(&'a str),
}

impl<'a> PathMatch<'a> {
    pub fn parse(route_path: &'a str) -> Self {
        match route_path.strip_suffix(ROUTE_WILDCARD) {
            Some(prefix) => PathMatch::Prefix(prefix),
            None => PathMatch::Exact(route_path),
        }
    }

    /// Checks if the path matches.
    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathMatch::Exact(expected) => path == *expected,
            PathMatch::Prefix(prefix) => path.starts_with(prefix),
        }
    }

    /// Applies `rewrite` to a matching path.
    ///
    /// Prefix routes swap the prefix; exact routes replace the whole path.
    pub fn rewrite(&self, path: &str, rewrite: &str) -> String {
        match self {
            PathMatch::Exact(_) => rewrite.to_string(),
            PathMatch::Prefix(prefix) => {
                format!("{}{}", rewrite, path.strip_prefix(prefix).unwrap_or(path))
            }
        }
    }
}

fn method_matches(route: &RouteConfig, method: &Method) -> bool {
    route
        .methods
        .iter()
        .any(|m| m.eq_ignore_ascii_case(method.as_str()))
}

/// Result of a route match.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    /// Name of the gateway that owns the route.
    pub gateway: String,
    /// The matched route.
    pub route: RouteConfig,
    /// Path to send downstream, with rewrite applied and query preserved.
    pub upstream_path: String,
}

/// Ordered table of gateways.
#[derive(Debug, Clone, Default)]
pub struct GatewayRouter {
    gateways: Vec<GatewayConfig>,
}

impl GatewayRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_gateways(gateways: Vec<GatewayConfig>) -> Self {
        Self { gateways }
    }

    /// Adds a gateway, replacing one with the same name in place.
    pub fn add_gateway(&mut self, gateway: GatewayConfig) {
        match self.gateways.iter_mut().find(|g| g.name == gateway.name) {
            Some(existing) => *existing = gateway,
            None => self.gateways.push(gateway),
        }
    }

    /// Removes a gateway by name.
    pub fn remove_gateway(&mut self, name: &str) -> Option<GatewayConfig> {
        let pos = self.gateways.iter().position(|g| g.name == name)?;
        Some(self.gateways.remove(pos))
    }

    pub fn clear(&mut self) {
        self.gateways.clear();
    }

    /// Finds the first matching route for `(host, path, method)`.
    ///
    /// `host` must already be normalized (no port, lowercase). `path` may
    /// carry a query string, which is ignored for matching and kept on the
    /// upstream path.
    pub fn route(&self, host: &str, path: &str, method: &Method) -> Option<RouteMatch> {
        let (path_only, query) = match path.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (path, None),
        };

        let ingress = self.gateways.iter().filter(|g| {
            g.gateway_type == GatewayType::Ingress
                && g.hosts.iter().any(|h| h.eq_ignore_ascii_case(host))
        });

        for gateway in ingress {
            for route in &gateway.routes {
                let matcher = PathMatch::parse(&route.path);
                if !matcher.matches(path_only) || !method_matches(route, method) {
                    continue;
                }

                let mut upstream_path = match &route.rewrite {
                    Some(rewrite) => matcher.rewrite(path_only, rewrite),
                    None => path_only.to_string(),
                };
                if let Some(query) = query {
                    upstream_path.push('?');
                    upstream_path.push_str(query);
                }

                debug!(
                    gateway = %gateway.name,
                    route = %route.path,
                    service = %route.service,
                    "matched route"
                );
                return Some(RouteMatch {
                    gateway: gateway.name.clone(),
                    route: route.clone(),
                    upstream_path,
                });
            }
        }

        debug!(host = %host, path = %path_only, method = %method, "no matching route found");
        None
    }

    /// Returns all gateways in declaration order.
    pub fn gateways(&self) -> &[GatewayConfig] {
        &self.gateways
    }

    pub fn len(&self) -> usize {
        self.gateways.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gateways.is_empty()
    }
}
