//! Admin endpoints exposing mesh state.

use crate::controller::MeshController;
use http::{Method, Request, Response, StatusCode};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use serde::Serialize;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::Service;
use tracing::{debug, warn};

const JSON: &str = "application/json";
const PROMETHEUS_TEXT: &str = "text/plain; version=0.0.4";

/// Admin service for a [`MeshController`].
///
/// Serves:
/// - `/health` - 200 while the mesh is running, 503 otherwise
/// - `/metrics` - Prometheus metrics in text format
/// - `/mesh/metrics` - per-service metrics as JSON
/// - `/mesh/instances` - registered instances as JSON
/// - `/mesh/policies` - applied policies as JSON
/// - `/mesh/sidecars` - sidecar records as JSON
#[derive(Clone)]
pub struct AdminService {
    controller: Arc<MeshController>,
}

impl AdminService {
    pub fn new(controller: Arc<MeshController>) -> Self {
        Self { controller }
    }

    async fn handle_request(
        self,
        req: Request<Incoming>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Infallible> {
        if req.method() != Method::GET {
            return Ok(Self::error_response(
                StatusCode::METHOD_NOT_ALLOWED,
                "Method Not Allowed",
            ));
        }
        Ok(self.respond(req.uri().path()).await)
    }

    /// Builds the response for `path`.
    async fn respond(&self, path: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
        debug!(path = %path, "admin request");
        match path {
            "/health" => self.health_response(),
            "/metrics" => match self.controller.metrics().encode() {
                Ok(metrics) => Self::body_response(StatusCode::OK, PROMETHEUS_TEXT, metrics),
                Err(e) => {
                    warn!(error = %e, "failed to encode metrics");
                    Self::error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Failed to encode metrics",
                    )
                }
            },
            "/mesh/metrics" => {
                let snapshot: std::collections::BTreeMap<_, _> =
                    self.controller.metrics().snapshot().into_iter().collect();
                Self::json_response(&snapshot)
            }
            "/mesh/instances" => match self.controller.instances().await {
                Ok(instances) => Self::json_response(&instances),
                Err(e) => {
                    warn!(error = %e, "failed to list instances");
                    Self::error_response(StatusCode::INTERNAL_SERVER_ERROR, "Registry unavailable")
                }
            },
            "/mesh/policies" => Self::json_response(&self.controller.policies().policies()),
            "/mesh/sidecars" => Self::json_response(&self.controller.sidecars().records()),
            _ => Self::error_response(StatusCode::NOT_FOUND, "Not Found"),
        }
    }

    fn health_response(&self) -> Response<BoxBody<Bytes, hyper::Error>> {
        if self.controller.is_running() {
            Self::body_response(StatusCode::OK, "text/plain", "healthy".to_string())
        } else {
            Self::body_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "text/plain",
                "stopped".to_string(),
            )
        }
    }

    fn json_response<T: Serialize>(value: &T) -> Response<BoxBody<Bytes, hyper::Error>> {
        match serde_json::to_string(value) {
            Ok(body) => Self::body_response(StatusCode::OK, JSON, body),
            Err(e) => {
                warn!(error = %e, "failed to serialize admin response");
                Self::error_response(StatusCode::INTERNAL_SERVER_ERROR, "Serialization failed")
            }
        }
    }

    fn error_response(status: StatusCode, message: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
        Self::body_response(status, "text/plain", message.to_string())
    }

    fn body_response(
        status: StatusCode,
        content_type: &str,
        body: String,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        Response::builder()
            .status(status)
            .header("Content-Type", content_type)
            .body(
                Full::new(Bytes::from(body))
                    .map_err(|never| match never {})
                    .boxed(),
            )
            .unwrap_or_else(|_| {
                Response::new(
                    Full::new(Bytes::new())
                        .map_err(|never| match never {})
                        .boxed(),
                )
            })
    }
}

impl Service<Request<Incoming>> for AdminService {
    type Response = Response<BoxBody<Bytes, hyper::Error>>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        Box::pin(self.clone().handle_request(req))
    }
}
