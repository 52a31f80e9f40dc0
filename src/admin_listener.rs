//! HTTP listener serving the admin endpoints.

use crate::admin::AdminService;
use crate::controller::MeshController;
use crate::error::{MeshError, Result};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower::Service;
use tracing::{debug, error, info, instrument, warn};

/// Admin HTTP listener.
///
/// # Example
///
/// ```no_run
/// use mesh_controlplane::admin_listener::AdminListener;
/// use mesh_controlplane::client::HyperHttpClient;
/// use mesh_controlplane::controller::MeshController;
/// use mesh_controlplane::registry::InMemoryRegistry;
/// use std::sync::Arc;
/// use tokio::sync::broadcast;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let registry = Arc::new(InMemoryRegistry::new());
///     let client = Arc::new(HyperHttpClient::new(registry.clone()));
///     let controller = Arc::new(MeshController::new(registry, client));
///
///     let (shutdown_tx, _) = broadcast::channel(1);
///     let listener = AdminListener::bind("127.0.0.1:9090", controller).await?;
///     listener.serve(shutdown_tx.subscribe()).await?;
///     Ok(())
/// }
/// ```
pub struct AdminListener {
    tcp_listener: TcpListener,
    admin_service: AdminService,
    addr: SocketAddr,
}

impl AdminListener {
    /// Binds the admin endpoints of `controller` to `addr`.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::ListenerBind` if binding fails.
    #[instrument(level = "info", skip(controller))]
    pub async fn bind(addr: &str, controller: Arc<MeshController>) -> Result<Self> {
        let tcp_listener = TcpListener::bind(addr)
            .await
            .map_err(|e| MeshError::ListenerBind {
                addr: addr.to_string(),
                source: e,
            })?;

        let local_addr = tcp_listener
            .local_addr()
            .map_err(|e| MeshError::ListenerBind {
                addr: addr.to_string(),
                source: e,
            })?;

        info!("admin endpoint bound to {}", local_addr);

        Ok(Self {
            tcp_listener,
            admin_service: AdminService::new(controller),
            addr: local_addr,
        })
    }

    /// Returns the local address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serves admin endpoints until `shutdown_rx` fires.
    #[instrument(level = "info", skip(self, shutdown_rx), fields(addr = %self.addr))]
    pub async fn serve(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("serving admin endpoints");

        loop {
            tokio::select! {
                accept_result = self.tcp_listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            debug!(peer = %peer_addr, "admin connection");
                            let service = self.admin_service.clone();
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, service).await {
                                    error!("admin connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("failed to accept admin connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("received shutdown signal, stopping admin listener");
                    break;
                }
            }
        }

        Ok(())
    }

    #[instrument(level = "debug", skip(stream, service))]
    async fn handle_connection(stream: tokio::net::TcpStream, service: AdminService) -> Result<()> {
        let io = TokioIo::new(stream);

        let service = service_fn(move |req: Request<Incoming>| {
            let mut service = service.clone();
            async move { service.call(req).await }
        });

        http1::Builder::new()
            .serve_connection(io, service)
            .await
            .map_err(MeshError::Http)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::HyperHttpClient;
    use crate::registry::InMemoryRegistry;
    use http_body_util::{BodyExt, Empty};
    use hyper::body::Bytes;
    use hyper_util::client::legacy::Client;
    use hyper_util::rt::TokioExecutor;

    fn controller() -> Arc<MeshController> {
        let registry = Arc::new(InMemoryRegistry::new());
        let client = Arc::new(HyperHttpClient::new(registry.clone()));
        Arc::new(MeshController::new(registry, client))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_admin_listener_bind() {
        let listener = AdminListener::bind("127.0.0.1:0", controller()).await;
        assert!(listener.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_admin_listener_bind_invalid_address() {
        let listener = AdminListener::bind("999.999.999.999:0", controller()).await;
        assert!(matches!(listener, Err(MeshError::ListenerBind { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_serves_until_shutdown() {
        let listener = AdminListener::bind("127.0.0.1:0", controller())
            .await
            .unwrap();
        let addr = listener.local_addr();
        let (shutdown_tx, _) = broadcast::channel(1);
        let task = tokio::spawn(listener.serve(shutdown_tx.subscribe()));

        let client: Client<_, Empty<Bytes>> =
            Client::builder(TokioExecutor::new()).build_http();
        let uri = format!("http://{}/health", addr).parse().unwrap();
        let response = client.get(uri).await.unwrap();
        assert_eq!(response.status(), http::StatusCode::SERVICE_UNAVAILABLE);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"stopped");

        shutdown_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }
}
