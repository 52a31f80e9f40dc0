//! HTTP client adapter used for routed calls.

use crate::error::{MeshError, Result};
use crate::registry::{SelectOptions, ServiceInstance, ServiceRegistry};
use async_trait::async_trait;
use http::{HeaderMap, Method, Request, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

/// Headers that describe a single hop and are never forwarded.
const HOP_BY_HOP: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Options for one downstream call.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: Method,
    pub data: Option<Bytes>,
    pub headers: HeaderMap,
    /// Bounds the whole call, body included.
    pub timeout: Duration,
    /// Instance to call. When `None` the client asks the registry.
    pub instance: Option<ServiceInstance>,
}

impl RequestOptions {
    pub fn new(method: Method, timeout: Duration) -> Self {
        Self {
            method,
            data: None,
            headers: HeaderMap::new(),
            timeout,
            instance: None,
        }
    }

    pub fn with_instance(mut self, instance: ServiceInstance) -> Self {
        self.instance = Some(instance);
        self
    }

    pub fn with_data(mut self, data: Option<Bytes>) -> Self {
        self.data = data;
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

/// Response of a downstream call, whatever its status.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub data: Bytes,
    /// True for 2xx statuses.
    pub success: bool,
    pub instance_id: String,
}

/// Performs calls to mesh services.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Calls `path` on an instance of `service_name`.
    ///
    /// Non-2xx statuses are returned as responses with `success == false`.
    /// Transport failures and timeouts are `MeshError::Upstream` without a
    /// status.
    async fn request(
        &self,
        service_name: &str,
        path: &str,
        options: RequestOptions,
    ) -> Result<UpstreamResponse>;
}

/// [`HttpClient`] over the hyper legacy pooled client.
#[derive(Clone)]
pub struct HyperHttpClient {
    client: Client<HttpConnector, Full<Bytes>>,
    registry: Arc<dyn ServiceRegistry>,
}

impl HyperHttpClient {
    pub fn new(registry: Arc<dyn ServiceRegistry>) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self { client, registry }
    }

    /// Builds the full upstream URI from the instance address and path.
    fn build_uri(service: &str, instance: &ServiceInstance, path: &str) -> Result<Uri> {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        format!("{}{}", instance.base_url(), path)
            .parse()
            .map_err(|e| MeshError::Upstream {
                service: service.to_string(),
                path: path.clone(),
                status: None,
                reason: format!("failed to parse URI: {}", e),
            })
    }
}

#[async_trait]
impl HttpClient for HyperHttpClient {
    #[instrument(level = "debug", skip(self, options))]
    async fn request(
        &self,
        service_name: &str,
        path: &str,
        options: RequestOptions,
    ) -> Result<UpstreamResponse> {
        let instance = match options.instance {
            Some(instance) => instance,
            None => self
                .registry
                .select_instance(service_name, SelectOptions::default())
                .await?
                .ok_or_else(|| MeshError::NoHealthyInstance {
                    service: service_name.to_string(),
                    path: path.to_string(),
                })?,
        };

        let uri = Self::build_uri(service_name, &instance, path)?;
        let upstream_error = |reason: String| MeshError::Upstream {
            service: service_name.to_string(),
            path: path.to_string(),
            status: None,
            reason,
        };

        let mut builder = Request::builder().method(options.method).uri(uri);
        if let Some(headers) = builder.headers_mut() {
            for (name, value) in options.headers.iter() {
                if name == http::header::HOST || HOP_BY_HOP.contains(&name.as_str()) {
                    continue;
                }
                headers.append(name.clone(), value.clone());
            }
        }
        let request = builder
            .body(Full::new(options.data.unwrap_or_default()))
            .map_err(|e| upstream_error(format!("invalid request: {}", e)))?;

        debug!(instance = %instance.id, "forwarding to upstream");

        let call = async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(|e| upstream_error(format!("request failed: {}", e)))?;
            let (parts, body) = response.into_parts();
            let data = body
                .collect()
                .await
                .map_err(|e| upstream_error(format!("failed to read body: {}", e)))?
                .to_bytes();
            Ok::<_, MeshError>((parts, data))
        };

        let (parts, data) = match timeout(options.timeout, call).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(instance = %instance.id, timeout_ms = options.timeout.as_millis() as u64, "upstream request timed out");
                return Err(upstream_error(format!(
                    "timed out after {}ms",
                    options.timeout.as_millis()
                )));
            }
        };

        Ok(UpstreamResponse {
            success: parts.status.is_success(),
            status: parts.status,
            headers: parts.headers,
            data,
            instance_id: instance.id,
        })
    }
}
