//! Error types for the mesh control plane.

use crate::config::ConfigError;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during control plane operations.
#[derive(Error, Debug)]
pub enum MeshError {
    /// Configuration is invalid or references unknown services.
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// No gateway route matches the request.
    #[error("no route found for {method} {host}{path}")]
    RouteNotFound {
        host: String,
        path: String,
        method: String,
    },

    /// The service has no healthy instance to serve the request.
    #[error("no healthy instance available for service {service} at {path}")]
    NoHealthyInstance { service: String, path: String },

    /// A security policy rejected the request.
    #[error("authorization failed for service {service} at {path}: {reason}")]
    Authorization {
        service: String,
        path: String,
        reason: String,
    },

    /// The caller exceeded its rate limit.
    #[error("rate limit exceeded for {identifier} (retry after {}ms)", retry_after.as_millis())]
    RateLimitExceeded {
        identifier: String,
        retry_after: Duration,
    },

    /// The routed call failed, returned a non-2xx status, or timed out.
    #[error("upstream error from {service} at {path}: {reason}")]
    Upstream {
        service: String,
        path: String,
        status: Option<u16>,
        reason: String,
    },

    /// The circuit breaker for the service is open.
    #[error("circuit breaker is open for service {service} at {path}")]
    CircuitOpen { service: String, path: String },

    /// A health probe failed. Never leaves the health checker.
    #[error("health probe to {target} failed: {reason}")]
    HealthProbe { target: String, reason: String },

    /// The mesh has not been initialized or was shut down.
    #[error("mesh is not running")]
    NotRunning,

    /// The service registry rejected an operation.
    #[error("registry error: {0}")]
    Registry(String),

    /// Failed to bind the admin listener.
    #[error("failed to bind listener to {addr}: {source}")]
    ListenerBind { addr: String, source: io::Error },

    /// HTTP protocol error.
    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl MeshError {
    /// Returns true when the failure happened talking to the upstream and
    /// the call may succeed on another attempt.
    pub fn is_upstream(&self) -> bool {
        matches!(self, MeshError::Upstream { .. })
    }

    /// Returns the upstream status code, if the failure carried one.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            MeshError::Upstream { status, .. } => *status,
            _ => None,
        }
    }
}

/// Result type alias for control plane operations.
pub type Result<T> = std::result::Result<T, MeshError>;
