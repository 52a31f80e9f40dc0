//! Request and response values passed through the mesh.

use http::{HeaderMap, Method, StatusCode};
use hyper::body::Bytes;
use std::net::IpAddr;
use std::time::Duration;

/// An inbound request to be routed to a service.
#[derive(Debug, Clone)]
pub struct MeshRequest {
    pub method: Method,
    /// Path, optionally followed by `?query`.
    pub path: String,
    /// Value matched against ingress gateway hosts. A port suffix is ignored.
    pub host: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    /// Peer address of the caller, if known.
    pub client_ip: Option<IpAddr>,
}

impl MeshRequest {
    pub fn new(method: Method, host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            host: host.into(),
            headers: HeaderMap::new(),
            body: None,
            client_ip: None,
        }
    }

    pub fn get(host: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(Method::GET, host, path)
    }

    pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
        if let Ok(value) = value.parse() {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_client_ip(mut self, ip: IpAddr) -> Self {
        self.client_ip = Some(ip);
        self
    }

    /// Path without the query string.
    pub fn path_only(&self) -> &str {
        self.path.split_once('?').map_or(self.path.as_str(), |(path, _)| path)
    }

    /// Query string without the leading `?`.
    pub fn query(&self) -> Option<&str> {
        self.path.split_once('?').map(|(_, query)| query)
    }

    /// Host without a `:port` suffix, lowercased.
    ///
    /// Bracketed IPv6 hosts lose their brackets; a bare IPv6 address is
    /// never split.
    pub fn host_only(&self) -> String {
        let host = self.host.as_str();
        let host = if let Some(rest) = host.strip_prefix('[') {
            rest.split_once(']').map_or(host, |(addr, _)| addr)
        } else {
            match host.rsplit_once(':') {
                Some((name, port))
                    if !name.contains(':')
                        && !port.is_empty()
                        && port.chars().all(|c| c.is_ascii_digit()) =>
                {
                    name
                }
                _ => host,
            }
        };
        host.to_ascii_lowercase()
    }
}

/// Result of a successfully routed request.
#[derive(Debug, Clone)]
pub struct MeshResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub service: String,
    /// Id of the instance that served the final attempt, empty for cache
    /// hits.
    pub instance: String,
    /// True when the body came from the response cache.
    pub cached: bool,
    pub latency: Duration,
}
